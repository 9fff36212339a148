//! # session-client
//!
//! Session runtime for Duet real-time collaborative editing.
//!
//! This is the library an editor embeds to share folders with other users.
//!
//! ## Features
//!
//! - **Host-sequenced replication**: one total order of activities for every replica
//! - **Gap repair**: missing activities are re-requested from the host
//! - **Channel fallback**: direct links first, relayed links when they fail
//! - **Pluggable host**: all file access goes through [`HostFileSystem`]
//! - **Pure State Machines**: ordering, membership and lifecycle live in session-core
//!
//! ## Example
//!
//! ```ignore
//! use session_client::{spawn, LocalReferencePoint, SessionOptions};
//!
//! let handle = spawn(SessionOptions::new(alice, connectors, inbox, fs));
//! handle.start_session(vec![LocalReferencePoint::new("proj", "/home/alice/proj")]).await?;
//!
//! let mut events = handle.subscribe();
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod apply;
pub mod config;
pub mod error;
pub mod events;
pub mod host;
pub mod session;
pub mod transport;

pub use apply::{ActivityApplier, ApplyError};
pub use config::{ClientConfig, ConfigError, SessionConfig, TransportConfig};
pub use error::{ClientError, SessionError};
pub use events::{EventBus, EventMonitor, SessionEvent, Subscription};
pub use host::{
    snapshot_tree, ChangeKind, DirEntry, HostFileSystem, LocalChange, LocalFileSystem,
    MemoryFileSystem, TreeSnapshot,
};
pub use session::{
    spawn, LocalReferencePoint, SessionHandle, SessionOptions, SessionStatus,
};
pub use transport::{
    Channel, ChannelNegotiator, Connector, Inbound, MemoryNetwork, TransportError,
};
