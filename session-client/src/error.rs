//! Error types of the session runtime.

use crate::config::ConfigError;
use crate::transport::TransportError;
use session_core::{
    InvitationError, MembershipError, PermissionError, ResourceError, SessionConsistencyError,
};
use session_types::WireError;
use thiserror::Error;

/// Errors returned by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The operation needs a session.
    #[error("not in a session")]
    NoSession,

    /// A session is already starting or running.
    #[error("already in a session")]
    AlreadyInSession,

    /// The session is still starting or already stopping.
    #[error("session is not running")]
    NotRunning,

    /// The invitation is unknown or no longer open.
    #[error("unknown invitation")]
    UnknownInvitation,

    /// Joining a session failed before it was running.
    #[error("join failed: {0}")]
    JoinFailed(String),

    /// The local user lacks the required role.
    #[error(transparent)]
    Permission(#[from] PermissionError),

    /// Participant set rules were violated.
    #[error(transparent)]
    Membership(#[from] MembershipError),

    /// Invitation rules were violated.
    #[error(transparent)]
    Invitation(#[from] InvitationError),

    /// Reference-point addressing failed.
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// Replicas can no longer agree.
    #[error(transparent)]
    Consistency(#[from] SessionConsistencyError),

    /// Reaching a peer failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Encoding or decoding failed.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Host file-system access failed.
    #[error("host I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by the client handle.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The operation failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The session actor is gone.
    #[error("session actor stopped")]
    ActorStopped,

    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ClientError {
    /// The session error behind this one, if any.
    pub fn session_error(&self) -> Option<&SessionError> {
        match self {
            ClientError::Session(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use session_types::UserId;

    #[test]
    fn permission_errors_pass_through() {
        let user = UserId::parse("obs@example.org").unwrap();
        let err: ClientError = SessionError::from(PermissionError::ReadOnly(user)).into();
        assert!(matches!(
            err.session_error(),
            Some(SessionError::Permission(PermissionError::ReadOnly(_)))
        ));
        assert_eq!(err.to_string(), SessionError::Permission(PermissionError::ReadOnly(
            UserId::parse("obs@example.org").unwrap()
        )).to_string());
    }

    #[test]
    fn actor_stopped_has_no_session_error() {
        assert!(ClientError::ActorStopped.session_error().is_none());
        assert_eq!(ClientError::ActorStopped.to_string(), "session actor stopped");
    }
}
