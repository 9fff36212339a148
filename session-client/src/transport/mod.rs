//! Channels between participants and their negotiation.
//!
//! A [`Connector`] opens outbound [`Channel`]s of one [`ChannelKind`]
//! towards a peer. Frames arriving from peers are not read from the
//! channel; every node owns a single inbox (`mpsc::UnboundedReceiver<Inbound>`)
//! that all of its acceptors and in-memory endpoints feed.
//!
//! # Design
//!
//! - [`ChannelNegotiator`] keeps one [`LinkState`](session_core::LinkState)
//!   machine per peer and falls back through the configured kinds
//! - [`TcpConnector`]/[`TcpAcceptor`] carry length-prefixed frames over TCP
//! - [`MemoryNetwork`] is an in-process hub with failure injection
//! - [`MockChannel`] captures frames for unit tests
//! - [`OutgoingTransfer`]/[`IncomingTransfers`] move bulk payloads as chunks;
//!   [`split_frame`] does the same for a single frame over [`MAX_FRAME_SIZE`]
//! - [`monitor_transfer`] polls a transfer and reports progress

mod memory;
mod mock;
mod monitor;
mod negotiator;
mod tcp;
mod transfer;

pub use memory::{MemoryConnector, MemoryNetwork};
pub use mock::{MockChannel, MockConnector};
pub use monitor::{monitor_transfer, NullMonitor, ProgressMonitor, TracingMonitor};
pub use negotiator::ChannelNegotiator;
pub use tcp::{read_frame, write_frame, AddressBook, TcpAcceptor, TcpConnector};
pub use transfer::{split_frame, FileTransfer, IncomingTransfers, OutgoingTransfer};

use async_trait::async_trait;
use session_core::ChannelKind;
use session_types::{UserId, WireError};
use thiserror::Error;

/// Maximum frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer could not be reached over this kind.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// Connection timeout.
    #[error("connection timeout")]
    Timeout,

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Frame exceeds [`MAX_FRAME_SIZE`].
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    /// Every candidate channel failed.
    #[error("no channel to {peer} after {attempt} round(s)")]
    FallbackExhausted {
        /// Unreachable peer.
        peer: UserId,
        /// Failed negotiation rounds.
        attempt: u32,
    },

    /// The remote end broke the framing protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Frame encoding failed.
    #[error(transparent)]
    Wire(#[from] WireError),
}

impl TransportError {
    /// Whether a later retry may succeed on a renegotiated link.
    ///
    /// Oversized and unencodable frames fail the same way on any link.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            TransportError::FallbackExhausted { .. }
                | TransportError::FrameTooLarge(_)
                | TransportError::Wire(_)
        )
    }
}

/// A frame delivered to this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// Sending participant.
    pub from: UserId,
    /// Raw frame bytes.
    pub frame: Vec<u8>,
}

/// An open outbound byte-stream channel to one peer.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Kind of this channel.
    fn kind(&self) -> ChannelKind;

    /// Send one frame.
    async fn send(&self, frame: &[u8]) -> Result<(), TransportError>;

    /// Check if the channel can still carry frames.
    fn is_open(&self) -> bool;

    /// Close the channel gracefully.
    async fn close(&self);
}

/// Opens channels of one kind.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Kind of channel this connector opens.
    fn kind(&self) -> ChannelKind;

    /// Open a channel to `peer`.
    async fn open(&self, peer: &UserId) -> Result<Box<dyn Channel>, TransportError>;
}
