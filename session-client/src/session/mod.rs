//! The session runtime.
//!
//! [`spawn`] starts the session actor for one local user and returns a
//! [`SessionHandle`]. Every operation is a message to the actor, so calls
//! from any number of tasks are serialized against incoming frames and
//! timers.
//!
//! ## Example
//!
//! ```ignore
//! let network = MemoryNetwork::new();
//! let inbox = network.join(alice.clone());
//! let handle = session::spawn(SessionOptions::new(
//!     alice.clone(),
//!     network.connectors(&alice, &[ChannelKind::Direct]),
//!     inbox,
//!     Arc::new(fs),
//! ));
//!
//! handle.start_session(vec![LocalReferencePoint::new("proj", "/proj")]).await?;
//! handle.invite(vec![bob], "pairing").await?;
//! ```

mod actor;
mod outbound;

use crate::config::ClientConfig;
use crate::error::{ClientError, SessionError};
use crate::events::{EventBus, Subscription};
use crate::host::HostFileSystem;
use crate::transport::{ChannelNegotiator, Connector, Inbound};
use actor::{ActorInputs, Command, Reply, SessionActor};
use session_core::{SessionLifecycle, TransferMode};
use session_types::{
    ActivityKind, ActivityRegistry, Invitation, InvitationId, ParticipantInfo, ReferencePointId,
    Role, SessionId, Timestamp, UserId,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Capacity of the command queue.
const COMMAND_QUEUE: usize = 64;

/// A local folder to share as a reference point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalReferencePoint {
    /// Display name shown to other participants.
    pub name: String,
    /// Host folder.
    pub root: PathBuf,
}

impl LocalReferencePoint {
    /// Share `root` under `name`.
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }
}

/// A point-in-time view of the actor's state.
#[derive(Debug, Clone, Default)]
pub struct SessionStatus {
    /// Lifecycle phase.
    pub lifecycle: SessionLifecycle,
    /// Current session, if any.
    pub session_id: Option<SessionId>,
    /// Session host, if any.
    pub host: Option<UserId>,
    /// Participants in join order.
    pub participants: Vec<ParticipantInfo>,
    /// Shared reference points with their local roots.
    pub reference_points: Vec<(ReferencePointId, String, PathBuf)>,
    /// Invitations received and not yet answered.
    pub received_invitations: Vec<Invitation>,
    /// Invitations this host is waiting on.
    pub pending_invitations: usize,
    /// Next timestamp the local replica will apply.
    pub next_expected: Option<Timestamp>,
}

impl SessionStatus {
    /// Role of `user` in the current session.
    pub fn role_of(&self, user: &UserId) -> Option<Role> {
        self.participants
            .iter()
            .find(|p| &p.user == user)
            .map(|p| p.role)
    }
}

/// Everything the session actor needs.
pub struct SessionOptions {
    /// The local user.
    pub local: UserId,
    /// Runtime configuration.
    pub config: ClientConfig,
    /// Connectors, one per channel kind.
    pub connectors: Vec<Arc<dyn Connector>>,
    /// Frames addressed to the local user.
    pub inbox: mpsc::UnboundedReceiver<Inbound>,
    /// Host file system.
    pub fs: Arc<dyn HostFileSystem>,
    /// Activity codecs.
    pub registry: Arc<ActivityRegistry>,
}

impl SessionOptions {
    /// Options with the default configuration and activity registry.
    pub fn new(
        local: UserId,
        connectors: Vec<Arc<dyn Connector>>,
        inbox: mpsc::UnboundedReceiver<Inbound>,
        fs: Arc<dyn HostFileSystem>,
    ) -> Self {
        Self {
            local,
            config: ClientConfig::default(),
            connectors,
            inbox,
            fs,
            registry: Arc::new(ActivityRegistry::standard()),
        }
    }

    /// Replace the configuration.
    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the activity registry.
    pub fn with_registry(mut self, registry: Arc<ActivityRegistry>) -> Self {
        self.registry = registry;
        self
    }
}

/// Start the session actor.
///
/// Must be called from within a Tokio runtime.
pub fn spawn(options: SessionOptions) -> SessionHandle {
    let SessionOptions {
        local,
        config,
        connectors,
        inbox,
        fs,
        registry,
    } = options;

    let (notices_tx, notices) = mpsc::unbounded_channel();
    let negotiator = Arc::new(
        ChannelNegotiator::new(
            connectors,
            &config.transport.channels,
            config.transport.connect_timeout(),
        )
        .with_notices(notices_tx),
    );
    let (commands_tx, commands) = mpsc::channel(COMMAND_QUEUE);
    let (failures_tx, failures) = mpsc::unbounded_channel();
    let events = EventBus::new();

    let inputs = ActorInputs {
        commands,
        inbox,
        failures,
        failures_tx,
        notices,
        changes: fs.subscribe_changes(),
    };
    let actor = SessionActor::new(
        local.clone(),
        config,
        registry,
        fs,
        Arc::clone(&negotiator),
        events.clone(),
        inputs,
    );
    tokio::spawn(actor.run());

    SessionHandle {
        commands: commands_tx,
        events,
        negotiator,
        local,
    }
}

/// Cloneable handle to a running session actor.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    events: EventBus,
    negotiator: Arc<ChannelNegotiator>,
    local: UserId,
}

impl SessionHandle {
    /// The local user.
    pub fn local_user(&self) -> &UserId {
        &self.local
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| ClientError::ActorStopped)?;
        let result: Result<T, SessionError> = rx.await.map_err(|_| ClientError::ActorStopped)?;
        Ok(result?)
    }

    /// Start a new session hosted by the local user, sharing
    /// `reference_points`.
    pub async fn start_session(
        &self,
        reference_points: Vec<LocalReferencePoint>,
    ) -> Result<SessionId, ClientError> {
        self.request(|reply| Command::Start {
            reference_points,
            reply,
        })
        .await
    }

    /// Invite `users`. The host tracks every invitation; drivers' go
    /// through it.
    pub async fn invite(
        &self,
        users: Vec<UserId>,
        description: impl Into<String>,
    ) -> Result<Vec<InvitationId>, ClientError> {
        let description = description.into();
        self.request(|reply| Command::Invite {
            users,
            description,
            reply,
        })
        .await
    }

    /// Accept an invitation and wait until the session is running.
    ///
    /// Shared reference points are materialized below the configured
    /// workspace folder.
    pub async fn accept_invitation(&self, invitation_id: InvitationId) -> Result<(), ClientError> {
        self.request(|reply| Command::Accept {
            invitation_id,
            workspace: None,
            reply,
        })
        .await
    }

    /// Accept an invitation, materializing reference points below
    /// `workspace`.
    pub async fn accept_invitation_into(
        &self,
        invitation_id: InvitationId,
        workspace: impl Into<PathBuf>,
    ) -> Result<(), ClientError> {
        let workspace = Some(workspace.into());
        self.request(|reply| Command::Accept {
            invitation_id,
            workspace,
            reply,
        })
        .await
    }

    /// Decline an invitation.
    pub async fn decline_invitation(
        &self,
        invitation_id: InvitationId,
        reason: impl Into<String>,
    ) -> Result<(), ClientError> {
        let reason = reason.into();
        self.request(|reply| Command::Decline {
            invitation_id,
            reason,
            reply,
        })
        .await
    }

    /// Share more folders with the running session.
    pub async fn add_reference_points(
        &self,
        reference_points: Vec<LocalReferencePoint>,
    ) -> Result<Vec<ReferencePointId>, ClientError> {
        self.request(|reply| Command::AddReferencePoints {
            reference_points,
            reply,
        })
        .await
    }

    /// Host only: change a participant's role.
    pub async fn change_role(&self, user: UserId, role: Role) -> Result<(), ClientError> {
        self.request(|reply| Command::ChangeRole { user, role, reply })
            .await
    }

    /// Host only: remove a participant.
    pub async fn kick(&self, user: UserId) -> Result<(), ClientError> {
        self.request(|reply| Command::Kick { user, reply }).await
    }

    /// Record a local change for replication.
    pub async fn record(&self, kind: ActivityKind) -> Result<(), ClientError> {
        self.request(|reply| Command::Record { kind, reply }).await
    }

    /// Leave the session. A host leaving ends it for everyone.
    pub async fn leave_session(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::Leave { reply }).await
    }

    /// Leave any session and stop the actor.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Shutdown { reply })
            .await
            .map_err(|_| ClientError::ActorStopped)?;
        rx.await.map_err(|_| ClientError::ActorStopped)
    }

    /// Receive session events from now on.
    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    /// Snapshot of the actor's state.
    pub async fn status(&self) -> Result<SessionStatus, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Status { reply })
            .await
            .map_err(|_| ClientError::ActorStopped)?;
        rx.await.map_err(|_| ClientError::ActorStopped)
    }

    /// Whether a session exists in any phase.
    pub async fn is_in_session(&self) -> Result<bool, ClientError> {
        Ok(self.status().await?.lifecycle.is_in_session())
    }

    /// Participants of the current session.
    pub async fn participants(&self) -> Result<Vec<ParticipantInfo>, ClientError> {
        Ok(self.status().await?.participants)
    }

    /// Role of `user` in the current session.
    pub async fn role(&self, user: &UserId) -> Result<Option<Role>, ClientError> {
        Ok(self.status().await?.role_of(user))
    }

    /// Id of the current session.
    pub async fn session_id(&self) -> Result<Option<SessionId>, ClientError> {
        Ok(self.status().await?.session_id)
    }

    /// Shared reference points with their local roots.
    pub async fn reference_points(
        &self,
    ) -> Result<Vec<(ReferencePointId, String, PathBuf)>, ClientError> {
        Ok(self.status().await?.reference_points)
    }

    /// Channel in use towards `peer`, with its last transfer statistics.
    pub fn current_transfer_mode(&self, peer: &UserId) -> Option<TransferMode> {
        self.negotiator.current_mode(peer)
    }
}
