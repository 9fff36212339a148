//! # session-core
//!
//! Pure session logic for Duet (no I/O, instant tests).
//!
//! This crate implements the state machines and algorithms of a
//! collaborative session without any network or disk I/O.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. Time is passed in as an [`std::time::Instant`]
//! rather than read from a clock, so ordering and timeout behaviour is
//! deterministic under test.
//!
//! The actual I/O (network, file system) is performed by `session-client`,
//! which interprets the actions produced by these state machines.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod batcher;
pub mod dispatcher;
pub mod error;
pub mod invitation;
pub mod lifecycle;
pub mod link;
pub mod membership;
pub mod resource;
pub mod sequencer;
pub mod transfer;

pub use batcher::Batcher;
pub use dispatcher::{Dispatcher, GapAction};
pub use error::{
    InvitationError, MembershipError, PermissionError, ResourceError, SessionConsistencyError,
};
pub use invitation::{InvitationOutcome, Invitations, PendingInvitation};
pub use lifecycle::{LifecycleAction, LifecycleEvent, LifecycleNotice, SessionLifecycle};
pub use link::{calculate_backoff, ChannelKind, LinkAction, LinkEvent, LinkNotice, LinkState};
pub use membership::{Participant, Participants, SessionPolicy};
pub use resource::{relative_to_session_path, ReferencePointRegistry, Resource};
pub use sequencer::{ReplayBuffer, Sequencer};
pub use transfer::{
    classify_transfer, format_bytes, format_duration, remaining_time_label, TransferMode,
    TransferState, TransferStats, TransferStatus,
};
