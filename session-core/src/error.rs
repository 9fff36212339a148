//! Error types for session logic.

use session_types::{PathError, ReferencePointId, Timestamp, UserId};
use std::path::PathBuf;
use thiserror::Error;

/// An operation was refused because of the caller's role.
///
/// Refusals are local: nothing is sent and no state changes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PermissionError {
    /// The participant only has read access.
    #[error("{0} is an observer and cannot modify shared resources")]
    ReadOnly(UserId),

    /// Only the host may do this.
    #[error("only the host may {operation}")]
    NotHost {
        /// What was attempted.
        operation: &'static str,
    },

    /// Drivers are not allowed to invite in this session.
    #[error("session policy does not allow drivers to invite")]
    InvitesNotAllowed,

    /// The host's role never changes.
    #[error("the host's role cannot be changed")]
    HostRoleImmutable,

    /// Not a member of the session.
    #[error("{0} is not a session participant")]
    NotParticipant(UserId),
}

/// Participant set could not be updated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MembershipError {
    /// Already a participant.
    #[error("{0} is already a participant")]
    AlreadyMember(UserId),

    /// No such participant.
    #[error("{0} is not a participant")]
    NotMember(UserId),

    /// The host cannot be added, removed or demoted.
    #[error("the host cannot be added, removed or demoted")]
    HostImmutable,

    /// A snapshot does not contain exactly one host.
    #[error("participant snapshot must contain exactly one host")]
    InvalidSnapshot,

    /// Role-based refusal.
    #[error(transparent)]
    Permission(#[from] PermissionError),
}

/// Invitation bookkeeping failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvitationError {
    /// An invitation for this user is still pending.
    #[error("{0} already has a pending invitation")]
    AlreadyInvited(UserId),

    /// Already a participant.
    #[error("{0} is already a participant")]
    AlreadyMember(UserId),
}

/// Resource addressing failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    /// Reference points are never deleted as a unit.
    #[error("reference point {0} cannot be deleted")]
    ReferencePointDeletion(ReferencePointId),

    /// The reference point is not shared in this session.
    #[error("unknown reference point {0}")]
    UnknownReferencePoint(ReferencePointId),

    /// The reference point id is already registered.
    #[error("reference point {0} is already registered")]
    DuplicateReferencePoint(ReferencePointId),

    /// A host path could not be expressed relative to a reference point.
    #[error("{0} cannot be expressed as a session path")]
    Unrepresentable(PathBuf),

    /// Invalid relative path.
    #[error(transparent)]
    Path(#[from] PathError),
}

/// Shared order or reference-point state can no longer be trusted.
///
/// Fatal to the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionConsistencyError {
    /// A gap survived its retransmission request.
    #[error("activities {from}..={to} never arrived")]
    UnresolvedGap {
        /// First missing timestamp.
        from: Timestamp,
        /// Last missing timestamp.
        to: Timestamp,
    },

    /// Applying an activity contradicted the reference-point tree.
    #[error("reference point state is inconsistent: {0}")]
    ReferencePoints(#[from] ResourceError),
}
