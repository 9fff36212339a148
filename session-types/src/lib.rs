//! # session-types
//!
//! Wire format types for Duet collaborative editing sessions.
//!
//! This crate provides the foundational types used across all Duet crates:
//! - [`SessionId`], [`UserId`], [`ReferencePointId`], [`Timestamp`] - Identity and ordering types
//! - [`Role`] - Participant roles (host, driver, observer)
//! - [`SessionPath`], [`ResourcePath`] - Reference-point-relative addressing
//! - [`Activity`], [`TimedActivity`] - Replicated editing operations
//! - [`ActivityRegistry`] - Immutable tag → codec table
//! - [`Envelope`] - Batched, timestamped activity wire format
//! - [`PeerMessage`] - Frames exchanged between participants
//! - [`WireError`], [`MalformedActivityError`], [`PathError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod activity;
mod envelope;
mod error;
mod ids;
mod messages;
mod path;
mod registry;
mod role;

pub use activity::{Activity, ActivityKind, TimedActivity};
pub use envelope::{Envelope, PROTOCOL_VERSION};
pub use error::{MalformedActivityError, PathError, WireError};
pub use ids::{InvitationId, ReferencePointId, SessionId, Timestamp, TransferId, UserId};
pub use messages::{
    ActivityBatch, Hello, Invitation, InvitationAccepted, InvitationDeclined, Kicked,
    ParticipantInfo, PeerMessage, ReferencePointInfo, ReferencePointSnapshot, RetransmitRequest,
    SessionEnded, StopReason, TransferCancelled, TransferChunk, UserJoined, UserLeft, Welcome,
};
pub use path::{ResourcePath, SessionPath};
pub use registry::{tags, ActivityCodec, ActivityRegistry, DecodeFn, EncodeFn};
pub use role::Role;
