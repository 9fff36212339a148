//! The task that owns all session state.
//!
//! Handles talk to it through [`Command`]s; peers through the node inbox.
//! Nothing else mutates participants, reference points, the sequencer or
//! the reorder buffer.

use super::outbound::{PeerFailure, PeerSenders};
use super::{LocalReferencePoint, SessionStatus};
use crate::apply::{ActivityApplier, ApplyError};
use crate::config::ClientConfig;
use crate::error::SessionError;
use crate::events::{EventBus, EventMonitor, SessionEvent};
use crate::host::{snapshot_tree, HostFileSystem, LocalChange};
use crate::transport::{
    monitor_transfer, ChannelNegotiator, Inbound, IncomingTransfers, OutgoingTransfer,
};
use session_core::{
    Batcher, Dispatcher, GapAction, InvitationError, InvitationOutcome, Invitations,
    LifecycleAction, LifecycleEvent, LifecycleNotice, LinkNotice, MembershipError, Participants,
    PermissionError, ReferencePointRegistry, ReplayBuffer, Resource, ResourceError, Sequencer,
    SessionConsistencyError, SessionLifecycle, SessionPolicy, TransferStats, TransferStatus,
};
use session_types::{
    Activity, ActivityBatch, ActivityKind, ActivityRegistry, Envelope, Invitation,
    InvitationAccepted, InvitationDeclined, InvitationId, Kicked, ParticipantInfo, PeerMessage,
    ReferencePointId, ReferencePointInfo, ReferencePointSnapshot, RetransmitRequest, Role,
    SessionEnded, SessionId, SessionPath, StopReason, TimedActivity, TransferCancelled,
    TransferChunk, UserId, UserJoined, UserLeft, Welcome, WireError,
};
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Upper bound for sending end-of-session notices inline.
const ANNOUNCE_TIMEOUT: Duration = Duration::from_millis(500);

/// Shortest housekeeping period.
const MIN_TICK: Duration = Duration::from_millis(5);

pub(crate) type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// Requests from [`SessionHandle`](super::SessionHandle)s.
pub(crate) enum Command {
    Start {
        reference_points: Vec<LocalReferencePoint>,
        reply: Reply<SessionId>,
    },
    Invite {
        users: Vec<UserId>,
        description: String,
        reply: Reply<Vec<InvitationId>>,
    },
    Accept {
        invitation_id: InvitationId,
        workspace: Option<PathBuf>,
        reply: Reply<()>,
    },
    Decline {
        invitation_id: InvitationId,
        reason: String,
        reply: Reply<()>,
    },
    AddReferencePoints {
        reference_points: Vec<LocalReferencePoint>,
        reply: Reply<Vec<ReferencePointId>>,
    },
    ChangeRole {
        user: UserId,
        role: Role,
        reply: Reply<()>,
    },
    Kick {
        user: UserId,
        reply: Reply<()>,
    },
    Record {
        kind: ActivityKind,
        reply: Reply<()>,
    },
    Leave {
        reply: Reply<()>,
    },
    Status {
        reply: oneshot::Sender<SessionStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Outcome of a snapshot transfer to a joiner.
#[derive(Debug)]
pub(crate) struct TransferReport {
    peer: UserId,
    status: TransferStatus,
    stats: TransferStats,
}

/// State only the host keeps.
struct HostState {
    sequencer: Sequencer,
    replay: ReplayBuffer,
    invitations: Invitations,
}

struct ActiveSession {
    id: SessionId,
    participants: Participants,
    reference_points: ReferencePointRegistry,
    workspace: PathBuf,
    dispatcher: Dispatcher,
    outgoing: Batcher<TimedActivity>,
    host: Option<HostState>,
}

impl ActiveSession {
    fn is_host(&self) -> bool {
        self.host.is_some()
    }
}

/// An accepted invitation waiting for the host's snapshot.
struct Joining {
    invitation: Invitation,
    workspace: PathBuf,
    /// Host frames that arrived before the snapshot.
    stash: Vec<PeerMessage>,
    deadline: Instant,
    reply: Option<Reply<()>>,
}

/// An invitation addressed to us, dropped if left unanswered.
struct ReceivedInvitation {
    invitation: Invitation,
    expires: Instant,
}

/// Channels feeding the actor besides its command queue.
pub(crate) struct ActorInputs {
    pub commands: mpsc::Receiver<Command>,
    pub inbox: mpsc::UnboundedReceiver<Inbound>,
    pub failures: mpsc::UnboundedReceiver<PeerFailure>,
    pub failures_tx: mpsc::UnboundedSender<PeerFailure>,
    pub notices: mpsc::UnboundedReceiver<(UserId, LinkNotice)>,
    pub changes: Option<mpsc::UnboundedReceiver<LocalChange>>,
}

pub(crate) struct SessionActor {
    local: UserId,
    config: ClientConfig,
    registry: Arc<ActivityRegistry>,
    fs: Arc<dyn HostFileSystem>,
    applier: ActivityApplier,
    negotiator: Arc<ChannelNegotiator>,
    senders: PeerSenders,
    events: EventBus,

    lifecycle: SessionLifecycle,
    session: Option<ActiveSession>,
    joining: Option<Joining>,
    received: HashMap<InvitationId, ReceivedInvitation>,
    incoming: IncomingTransfers,

    commands: mpsc::Receiver<Command>,
    inbox: Option<mpsc::UnboundedReceiver<Inbound>>,
    failures: mpsc::UnboundedReceiver<PeerFailure>,
    notices: mpsc::UnboundedReceiver<(UserId, LinkNotice)>,
    changes: Option<mpsc::UnboundedReceiver<LocalChange>>,
    reports_tx: mpsc::UnboundedSender<TransferReport>,
    reports: mpsc::UnboundedReceiver<TransferReport>,
}

/// The running session, or why there is none.
fn running(
    lifecycle: SessionLifecycle,
    session: Option<&mut ActiveSession>,
) -> Result<&mut ActiveSession, SessionError> {
    match session {
        Some(session) if lifecycle.is_running() => Ok(session),
        _ if lifecycle.is_in_session() => Err(SessionError::NotRunning),
        _ => Err(SessionError::NoSession),
    }
}

/// Surface permission problems as such rather than as membership errors.
fn membership(err: MembershipError) -> SessionError {
    match err {
        MembershipError::Permission(e) => SessionError::Permission(e),
        other => SessionError::Membership(other),
    }
}

async fn recv_opt<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn batch_frame(
    registry: &ActivityRegistry,
    session_id: SessionId,
    activities: Vec<TimedActivity>,
    wrap: fn(ActivityBatch) -> PeerMessage,
) -> Result<Vec<u8>, WireError> {
    let envelope = Envelope::new(session_id, activities).encode(registry)?;
    wrap(ActivityBatch { envelope }).to_bytes()
}

/// Where a joiner materializes a reference point called `name`.
fn replica_root(
    workspace: &Path,
    name: &str,
    id: ReferencePointId,
    registry: &ReferencePointRegistry,
) -> PathBuf {
    let single_segment = SessionPath::parse(name).is_ok_and(|p| p.len() == 1);
    if !single_segment {
        return workspace.join(id.to_string());
    }
    let candidate = workspace.join(name);
    let taken = registry
        .ids()
        .iter()
        .any(|other| registry.root(other) == Some(candidate.as_path()));
    if taken {
        workspace.join(format!("{name}-{id}"))
    } else {
        candidate
    }
}

fn reference_point_info(
    fs: &dyn HostFileSystem,
    registry: &ReferencePointRegistry,
) -> Vec<ReferencePointInfo> {
    registry
        .ids()
        .into_iter()
        .filter_map(|id| {
            let name = registry.name(&id)?.to_string();
            let root = registry.root(&id)?;
            let (file_count, total_bytes) = match snapshot_tree(fs, root) {
                Ok(tree) => (tree.file_count(), tree.total_bytes()),
                Err(e) => {
                    debug!(root = %root.display(), error = %e, "Could not size reference point");
                    (0, 0)
                }
            };
            Some(ReferencePointInfo {
                id,
                name,
                file_count,
                total_bytes,
            })
        })
        .collect()
}

fn build_welcome(
    fs: &dyn HostFileSystem,
    session: &ActiveSession,
) -> Result<Welcome, std::io::Error> {
    let registry = &session.reference_points;
    let mut reference_points = Vec::with_capacity(registry.len());
    for id in registry.ids() {
        let (Some(name), Some(root)) = (registry.name(&id), registry.root(&id)) else {
            continue;
        };
        let tree = snapshot_tree(fs, root)?;
        reference_points.push(ReferencePointSnapshot {
            id,
            name: name.to_string(),
            folders: tree.folders,
            files: tree.files,
        });
    }
    Ok(Welcome {
        session_id: session.id,
        host: session.participants.host().clone(),
        participants: session.participants.to_info(),
        reference_points,
        next_timestamp: session.dispatcher.next_expected(),
    })
}

/// Check a locally recorded activity before it leaves this replica.
fn validate_local(
    local: &UserId,
    session: &ActiveSession,
    kind: &ActivityKind,
) -> Result<(), SessionError> {
    session.participants.check_origination(local, kind)?;
    if let ActivityKind::RoleChanged { user, role } = kind {
        session
            .participants
            .check_role_change(local, user, *role)
            .map_err(membership)?;
    }
    check_resources(session, kind)
}

/// Check that `kind` targets shared reference points and never removes
/// one of their roots.
fn check_resources(session: &ActiveSession, kind: &ActivityKind) -> Result<(), SessionError> {
    let moved_to = match kind {
        ActivityKind::FileMoved { to, .. } => Some(to),
        _ => None,
    };
    for path in kind.target().into_iter().chain(moved_to) {
        if !session.reference_points.contains(&path.reference_point) {
            return Err(ResourceError::UnknownReferencePoint(path.reference_point).into());
        }
    }

    match kind {
        ActivityKind::FileDeleted { path } | ActivityKind::FileMoved { from: path, .. } => {
            Resource::classify(path.clone(), false).ensure_deletable()?
        }
        ActivityKind::FolderDeleted { path } => {
            Resource::classify(path.clone(), true).ensure_deletable()?
        }
        _ => {}
    }
    Ok(())
}

/// Report a failed application; only reference-point contradictions are
/// fatal.
fn apply_failed(
    events: &EventBus,
    source: UserId,
    err: ApplyError,
) -> Result<(), SessionConsistencyError> {
    events.publish(SessionEvent::ActivityDropped {
        source: source.clone(),
        reason: err.to_string(),
    });
    match err {
        ApplyError::Resource(e) => Err(e.into()),
        ApplyError::Io { .. } => {
            warn!(source = %source, error = %err, "Dropped activity");
            Ok(())
        }
    }
}

impl SessionActor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        local: UserId,
        config: ClientConfig,
        registry: Arc<ActivityRegistry>,
        fs: Arc<dyn HostFileSystem>,
        negotiator: Arc<ChannelNegotiator>,
        events: EventBus,
        inputs: ActorInputs,
    ) -> Self {
        let (reports_tx, reports) = mpsc::unbounded_channel();
        let senders = PeerSenders::new(
            Arc::clone(&negotiator),
            inputs.failures_tx,
            config.transport.send_retries,
            config.transport.chunk_size,
        );
        Self {
            local,
            registry,
            applier: ActivityApplier::new(Arc::clone(&fs)),
            fs,
            negotiator,
            senders,
            events,
            config,
            lifecycle: SessionLifecycle::default(),
            session: None,
            joining: None,
            received: HashMap::new(),
            incoming: IncomingTransfers::new(),
            commands: inputs.commands,
            inbox: Some(inputs.inbox),
            failures: inputs.failures,
            notices: inputs.notices,
            changes: inputs.changes,
            reports_tx,
            reports,
        }
    }

    /// Process commands, frames and timers until shut down.
    pub(crate) async fn run(mut self) {
        let period = self.config.session.batch_window().max(MIN_TICK);
        let mut housekeeping = tokio::time::interval(period);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(user = %self.local, "Session actor started");

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        debug!("All handles dropped");
                        self.stop(StopReason::LocalLeave).await;
                        break;
                    };
                    if self.on_command(command).await.is_break() {
                        break;
                    }
                }
                inbound = recv_opt(&mut self.inbox) => match inbound {
                    Some(inbound) => self.on_inbound(inbound).await,
                    None => {
                        warn!("Inbox closed");
                        self.inbox = None;
                    }
                },
                Some(failure) = self.failures.recv() => self.on_peer_failure(failure).await,
                Some((peer, status)) = self.notices.recv() => {
                    self.events.publish(SessionEvent::LinkStatus { peer, status });
                }
                change = recv_opt(&mut self.changes) => match change {
                    Some(change) => self.on_local_change(change),
                    None => self.changes = None,
                },
                Some(report) = self.reports.recv() => self.on_transfer_report(report).await,
                _ = housekeeping.tick() => self.housekeeping().await,
            }
        }

        self.negotiator.close_all().await;
        info!(user = %self.local, "Session actor stopped");
    }

    // ===== Commands =====

    async fn on_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Start {
                reference_points,
                reply,
            } => {
                let _ = reply.send(self.start(reference_points).await);
            }
            Command::Invite {
                users,
                description,
                reply,
            } => {
                let _ = reply.send(self.invite(users, description));
            }
            Command::Accept {
                invitation_id,
                workspace,
                reply,
            } => match self.accept(invitation_id, workspace) {
                Ok(()) => {
                    if let Some(joining) = self.joining.as_mut() {
                        joining.reply = Some(reply);
                    }
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Decline {
                invitation_id,
                reason,
                reply,
            } => {
                let _ = reply.send(self.decline(invitation_id, reason));
            }
            Command::AddReferencePoints {
                reference_points,
                reply,
            } => {
                let _ = reply.send(self.add_reference_points(reference_points).await);
            }
            Command::ChangeRole { user, role, reply } => {
                let _ = reply.send(self.record(ActivityKind::RoleChanged { user, role }).await);
            }
            Command::Kick { user, reply } => {
                let _ = reply.send(self.kick(user));
            }
            Command::Record { kind, reply } => {
                let _ = reply.send(self.record(kind).await);
            }
            Command::Leave { reply } => {
                let result = if self.lifecycle.is_in_session() {
                    self.flush_outgoing();
                    self.stop(StopReason::LocalLeave).await;
                    Ok(())
                } else {
                    Err(SessionError::NoSession)
                };
                let _ = reply.send(result);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown { reply } => {
                self.flush_outgoing();
                self.stop(StopReason::LocalLeave).await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn start(
        &mut self,
        reference_points: Vec<LocalReferencePoint>,
    ) -> Result<SessionId, SessionError> {
        let (state, actions) = self.lifecycle.on_event(LifecycleEvent::StartRequested);
        if !actions.contains(&LifecycleAction::SetUpLocalSession) {
            return Err(SessionError::AlreadyInSession);
        }
        self.lifecycle = state;

        match self.set_up_local_session(reference_points) {
            Ok(session_id) => {
                info!(session = %session_id, "Session started as host");
                self.on_lifecycle(LifecycleEvent::SetupCompleted).await;
                Ok(session_id)
            }
            Err(e) => {
                self.on_lifecycle(LifecycleEvent::SetupFailed {
                    error: e.to_string(),
                })
                .await;
                Err(e)
            }
        }
    }

    fn set_up_local_session(
        &mut self,
        reference_points: Vec<LocalReferencePoint>,
    ) -> Result<SessionId, SessionError> {
        let mut registry = ReferencePointRegistry::new();
        for rp in reference_points {
            if !self.fs.is_folder(&rp.root) {
                return Err(SessionError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{} is not a folder", rp.root.display()),
                )));
            }
            registry.register(ReferencePointId::new(), rp.name, rp.root)?;
        }

        let session = &self.config.session;
        let id = SessionId::new();
        self.session = Some(ActiveSession {
            id,
            participants: Participants::new(self.local.clone()),
            reference_points: registry,
            workspace: session.workspace_dir.clone(),
            dispatcher: Dispatcher::new(session.gap_timeout()),
            outgoing: Batcher::new(session.batch_window(), session.max_batch_size),
            host: Some(HostState {
                sequencer: Sequencer::new(),
                replay: ReplayBuffer::new(session.replay_buffer_capacity),
                invitations: Invitations::new(session.invitation_timeout()),
            }),
        });
        Ok(id)
    }

    fn invite(
        &mut self,
        users: Vec<UserId>,
        description: String,
    ) -> Result<Vec<InvitationId>, SessionError> {
        let now = Instant::now();
        let policy = self.config.session.policy();
        let session = running(self.lifecycle, self.session.as_mut())?;
        session.participants.check_can_invite(&self.local, &policy)?;

        for invitee in &users {
            if session.participants.contains(invitee) {
                return Err(InvitationError::AlreadyMember(invitee.clone()).into());
            }
            if let Some(host) = &session.host {
                if host.invitations.is_pending_for(invitee) {
                    return Err(InvitationError::AlreadyInvited(invitee.clone()).into());
                }
            }
        }

        let reference_points = reference_point_info(&*self.fs, &session.reference_points);
        let participants = session.participants.to_info();
        let session_host = session.participants.host().clone();
        let mut ids = Vec::with_capacity(users.len());
        let mut outgoing = Vec::with_capacity(users.len());

        for invitee in users {
            // Drivers' invitations are routed through the host, which tracks them.
            let (invitation_id, to) = match session.host.as_mut() {
                Some(host) => (
                    host.invitations
                        .issue(invitee.clone(), self.local.clone(), now)?,
                    invitee.clone(),
                ),
                None => (InvitationId::new(), session_host.clone()),
            };
            let invitation = Invitation {
                invitation_id,
                session_id: session.id,
                host: session_host.clone(),
                inviter: self.local.clone(),
                invitee: invitee.clone(),
                description: description.clone(),
                reference_points: reference_points.clone(),
                participants: participants.clone(),
            };
            info!(invitee = %invitee, invitation = %invitation_id, "Inviting");
            outgoing.push((to, PeerMessage::Invitation(invitation)));
            ids.push(invitation_id);
        }

        for (to, message) in outgoing {
            self.send(&to, &message);
        }
        Ok(ids)
    }

    fn accept(
        &mut self,
        invitation_id: InvitationId,
        workspace: Option<PathBuf>,
    ) -> Result<(), SessionError> {
        if self.lifecycle.is_in_session() {
            return Err(SessionError::AlreadyInSession);
        }
        let invitation = self
            .received
            .remove(&invitation_id)
            .ok_or(SessionError::UnknownInvitation)?
            .invitation;

        let (state, _) = self.lifecycle.on_event(LifecycleEvent::JoinRequested);
        self.lifecycle = state;

        let host = invitation.host.clone();
        let accepted = PeerMessage::InvitationAccepted(InvitationAccepted {
            invitation_id,
            session_id: invitation.session_id,
        });
        info!(session = %invitation.session_id, host = %host, "Joining session");
        self.joining = Some(Joining {
            invitation,
            workspace: workspace.unwrap_or_else(|| self.config.session.workspace_dir.clone()),
            stash: Vec::new(),
            deadline: Instant::now() + self.config.session.invitation_timeout(),
            reply: None,
        });
        self.send(&host, &accepted);
        Ok(())
    }

    fn decline(&mut self, invitation_id: InvitationId, reason: String) -> Result<(), SessionError> {
        let invitation = self
            .received
            .remove(&invitation_id)
            .ok_or(SessionError::UnknownInvitation)?
            .invitation;
        info!(invitation = %invitation_id, %reason, "Declining invitation");
        self.send(
            &invitation.host,
            &PeerMessage::InvitationDeclined(InvitationDeclined {
                invitation_id,
                reason,
            }),
        );
        Ok(())
    }

    async fn add_reference_points(
        &mut self,
        reference_points: Vec<LocalReferencePoint>,
    ) -> Result<Vec<ReferencePointId>, SessionError> {
        let session = running(self.lifecycle, self.session.as_mut())?;
        session.participants.check_write_access(&self.local)?;

        // Everything is read before anything is registered.
        let mut prepared = Vec::with_capacity(reference_points.len());
        for rp in reference_points {
            if !self.fs.is_folder(&rp.root) {
                return Err(SessionError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{} is not a folder", rp.root.display()),
                )));
            }
            self.fs.refresh(&rp.root)?;
            let tree = snapshot_tree(&*self.fs, &rp.root)?;
            prepared.push((rp, tree));
        }

        let mut ids = Vec::with_capacity(prepared.len());
        let mut activities = Vec::with_capacity(prepared.len());
        for (rp, tree) in prepared {
            let id = ReferencePointId::new();
            session
                .reference_points
                .register(id, rp.name.clone(), rp.root)?;
            info!(reference_point = %id, name = %rp.name, files = tree.file_count(), "Sharing reference point");
            activities.push(ActivityKind::ReferencePointAdded {
                id,
                name: rp.name,
                folders: tree.folders,
                files: tree.files,
            });
            ids.push(id);
        }

        for kind in activities {
            self.record(kind).await?;
        }
        Ok(ids)
    }

    fn kick(&mut self, user: UserId) -> Result<(), SessionError> {
        let session = running(self.lifecycle, self.session.as_mut())?;
        if !session.is_host() {
            return Err(PermissionError::NotHost {
                operation: "kick participants",
            }
            .into());
        }
        if &user == session.participants.host() {
            return Err(MembershipError::HostImmutable.into());
        }
        if !session.participants.contains(&user) {
            return Err(MembershipError::NotMember(user).into());
        }

        let session_id = session.id;
        info!(user = %user, "Kicking participant");
        self.send(&user, &PeerMessage::Kicked(Kicked { session_id }));
        self.remove_participant(&user, StopReason::Kicked);
        Ok(())
    }

    async fn record(&mut self, kind: ActivityKind) -> Result<(), SessionError> {
        let now = Instant::now();
        let session = running(self.lifecycle, self.session.as_mut())?;
        validate_local(&self.local, session, &kind)?;
        let activity = Activity::new(self.local.clone(), kind);

        if session.is_host() {
            self.sequence(activity).await;
        } else if let Some(batch) = session
            .outgoing
            .push(TimedActivity::unsequenced(activity), now)
        {
            self.submit(batch);
        }
        Ok(())
    }

    fn status(&self) -> SessionStatus {
        let mut status = SessionStatus {
            lifecycle: self.lifecycle,
            received_invitations: self
                .received
                .values()
                .map(|r| r.invitation.clone())
                .collect(),
            ..SessionStatus::default()
        };
        if let Some(session) = &self.session {
            let registry = &session.reference_points;
            status.session_id = Some(session.id);
            status.host = Some(session.participants.host().clone());
            status.participants = session.participants.to_info();
            status.reference_points = registry
                .ids()
                .into_iter()
                .filter_map(|id| {
                    Some((
                        id,
                        registry.name(&id)?.to_string(),
                        registry.root(&id)?.to_path_buf(),
                    ))
                })
                .collect();
            status.pending_invitations = session.host.as_ref().map_or(0, |h| h.invitations.len());
            status.next_expected = Some(session.dispatcher.next_expected());
        }
        status
    }

    // ===== Lifecycle =====

    async fn on_lifecycle(&mut self, event: LifecycleEvent) {
        let (state, actions) = self.lifecycle.on_event(event);
        debug!(from = ?self.lifecycle, to = ?state, "Lifecycle transition");
        self.lifecycle = state;
        for action in actions {
            self.execute(action).await;
        }
    }

    async fn execute(&mut self, action: LifecycleAction) {
        match action {
            // Done by `start`, which holds the reference points.
            LifecycleAction::SetUpLocalSession => {}
            LifecycleAction::AnnounceEnd { reason } => self.announce_end(reason).await,
            LifecycleAction::CancelPendingSends => self.senders.cancel_all(),
            LifecycleAction::AbandonReorderBuffer => {
                if let Some(session) = self.session.as_mut() {
                    let dropped = session.dispatcher.abandon();
                    if dropped > 0 {
                        debug!(dropped, "Abandoned reorder buffer");
                    }
                }
            }
            LifecycleAction::ReleaseResources => self.release().await,
            LifecycleAction::Emit(notice) => self.emit(notice),
        }
    }

    async fn stop(&mut self, reason: StopReason) {
        if !self.lifecycle.is_in_session() {
            return;
        }
        info!(%reason, "Stopping session");
        self.on_lifecycle(LifecycleEvent::StopRequested { reason })
            .await;
        self.on_lifecycle(LifecycleEvent::TeardownCompleted).await;
    }

    async fn announce_end(&mut self, reason: StopReason) {
        let (session_id, recipients) = if let Some(session) = &self.session {
            let recipients: Vec<UserId> = if session.is_host() {
                session.participants.others(&self.local).cloned().collect()
            } else {
                vec![session.participants.host().clone()]
            };
            (session.id, recipients)
        } else if let Some(joining) = &self.joining {
            (
                joining.invitation.session_id,
                vec![joining.invitation.host.clone()],
            )
        } else {
            return;
        };
        let ended = PeerMessage::SessionEnded(SessionEnded { session_id, reason });
        self.send_now(&recipients, &ended).await;
    }

    async fn release(&mut self) {
        if let Some(session) = self.session.take() {
            debug!(
                session = %session.id,
                reference_points = session.reference_points.len(),
                participants = session.participants.len(),
                "Releasing session"
            );
        }
        if let Some(joining) = self.joining.take() {
            if let Some(reply) = joining.reply {
                let _ = reply.send(Err(SessionError::JoinFailed("session stopped".into())));
            }
        }
        self.incoming.clear();
        self.negotiator.close_all().await;
    }

    fn emit(&self, notice: LifecycleNotice) {
        match notice {
            LifecycleNotice::Started => {
                if let Some(session) = &self.session {
                    self.events.publish(SessionEvent::SessionStarted {
                        session_id: session.id,
                        host: session.participants.host().clone(),
                    });
                }
            }
            LifecycleNotice::StartFailed { error } => warn!(%error, "Session setup failed"),
            LifecycleNotice::Stopped { reason } => {
                info!(%reason, "Session stopped");
                self.events
                    .publish(SessionEvent::SessionStopped { reason });
            }
        }
    }

    // ===== Sending =====

    fn send(&mut self, peer: &UserId, message: &PeerMessage) {
        match message.to_bytes() {
            Ok(frame) => self.senders.send(peer, frame),
            Err(e) => warn!(peer = %peer, kind = message.kind(), error = %e, "Could not encode frame"),
        }
    }

    /// Send `message` without queueing, for notices that must go out even
    /// though pending sends are about to be cancelled.
    async fn send_now(&self, peers: &[UserId], message: &PeerMessage) {
        let frame = match message.to_bytes() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(kind = message.kind(), error = %e, "Could not encode frame");
                return;
            }
        };
        let deadline = tokio::time::Instant::now() + ANNOUNCE_TIMEOUT;
        for peer in peers {
            match tokio::time::timeout_at(deadline, self.negotiator.send(peer, &frame)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(peer = %peer, error = %e, "Notice not delivered"),
                Err(_) => debug!(peer = %peer, "Notice timed out"),
            }
        }
    }

    /// Host: send sequenced activities to every other participant.
    fn broadcast(&mut self, batch: Vec<TimedActivity>) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let frame = match batch_frame(&self.registry, session.id, batch, PeerMessage::Activities) {
            Ok(frame) => frame,
            Err(e) => {
                error!(error = %e, "Could not encode activity batch");
                return;
            }
        };
        let recipients: Vec<UserId> = session.participants.others(&self.local).cloned().collect();
        for peer in recipients {
            self.senders.send(&peer, frame.clone());
        }
    }

    /// Participant: hand unsequenced activities to the host.
    fn submit(&mut self, batch: Vec<TimedActivity>) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let host = session.participants.host().clone();
        match batch_frame(&self.registry, session.id, batch, PeerMessage::Submit) {
            Ok(frame) => self.senders.send(&host, frame),
            Err(e) => error!(error = %e, "Could not encode submission"),
        }
    }

    fn flush_outgoing(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let batch = session.outgoing.flush();
        if batch.is_empty() {
            return;
        }
        if session.is_host() {
            self.broadcast(batch);
        } else {
            self.submit(batch);
        }
    }

    // ===== Sequencing and application =====

    /// Host: stamp, queue for broadcast and apply locally once in order.
    async fn sequence(&mut self, activity: Activity) {
        let now = Instant::now();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(host) = session.host.as_mut() else {
            return;
        };
        let timed = host.sequencer.stamp(activity);
        host.replay.push(timed.clone());
        let batch = session.outgoing.push(timed.clone(), now);
        let ready = session.dispatcher.receive(timed, now);

        if let Some(batch) = batch {
            self.broadcast(batch);
        }
        self.deliver(ready).await;
    }

    async fn deliver(&mut self, ready: Vec<TimedActivity>) {
        for timed in ready {
            if let Err(e) = self.apply_sequenced(timed) {
                error!(error = %e, "Local replica diverged from the session");
                self.stop(StopReason::LocalError).await;
                return;
            }
        }
    }

    fn apply_sequenced(&mut self, timed: TimedActivity) -> Result<(), SessionConsistencyError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let TimedActivity {
            activity,
            timestamp,
        } = timed;

        match &activity.kind {
            ActivityKind::RoleChanged { user, role } => {
                match session.participants.apply_role_change(user, *role) {
                    Ok(old) => {
                        info!(user = %user, %old, new = %role, "Role changed");
                        self.events.publish(SessionEvent::RoleChanged {
                            user: user.clone(),
                            old,
                            new: *role,
                        });
                    }
                    Err(e) => {
                        warn!(user = %user, error = %e, "Dropped role change");
                        self.events.publish(SessionEvent::ActivityDropped {
                            source: activity.source.clone(),
                            reason: e.to_string(),
                        });
                        return Ok(());
                    }
                }
            }
            ActivityKind::ReferencePointAdded { id, name, .. } => {
                // The adder registered it with its own root already.
                if !session.reference_points.contains(id) {
                    let root = replica_root(&session.workspace, name, *id, &session.reference_points);
                    session.reference_points.register(*id, name.clone(), root)?;
                    if let Err(e) = self.applier.apply(&activity.kind, &session.reference_points) {
                        return apply_failed(&self.events, activity.source.clone(), e);
                    }
                }
                self.events.publish(SessionEvent::ReferencePointsAdded {
                    reference_points: vec![(*id, name.clone())],
                });
            }
            kind => {
                if let Err(e) = self.applier.apply(kind, &session.reference_points) {
                    return apply_failed(&self.events, activity.source.clone(), e);
                }
            }
        }

        self.events.publish(SessionEvent::ActivityApplied {
            timestamp,
            activity,
        });
        Ok(())
    }

    // ===== Inbound frames =====

    async fn on_inbound(&mut self, inbound: Inbound) {
        let Inbound { from, frame } = inbound;
        let message = match PeerMessage::from_bytes(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %from, error = %e, "Dropping undecodable frame");
                return;
            }
        };
        debug!(peer = %from, kind = message.kind(), "Received");

        let message = match message {
            PeerMessage::TransferChunk(chunk) => match self.on_transfer_chunk(&from, chunk).await {
                Some(message) => message,
                None => return,
            },
            message => message,
        };
        self.on_message(from, message).await;
    }

    async fn on_message(&mut self, from: UserId, message: PeerMessage) {
        match message {
            PeerMessage::Hello(_) => {}
            PeerMessage::Invitation(invitation) => self.on_invitation(from, invitation),
            PeerMessage::InvitationAccepted(accepted) => {
                self.on_invitation_accepted(from, accepted)
            }
            PeerMessage::InvitationDeclined(declined) => {
                self.on_invitation_declined(from, declined)
            }
            PeerMessage::Welcome(welcome) => self.on_welcome(from, welcome).await,
            PeerMessage::TransferChunk(_) => {
                warn!(peer = %from, "Dropping nested transfer chunk");
            }
            PeerMessage::TransferCancelled(cancelled) => {
                self.on_transfer_cancelled(from, cancelled).await
            }
            PeerMessage::Submit(batch) => self.on_submit(from, batch).await,
            PeerMessage::RetransmitRequest(request) => self.on_retransmit_request(from, request),
            PeerMessage::SessionEnded(ended) => self.on_session_ended(from, ended).await,
            message @ (PeerMessage::Activities(_)
            | PeerMessage::UserJoined(_)
            | PeerMessage::UserLeft(_)
            | PeerMessage::Kicked(_)) => self.on_host_message(from, message).await,
        }
    }

    fn on_invitation(&mut self, from: UserId, invitation: Invitation) {
        if invitation.invitee == self.local {
            info!(from = %from, session = %invitation.session_id, "Invitation received");
            let invitation_id = invitation.invitation_id;
            self.received.insert(
                invitation_id,
                ReceivedInvitation {
                    invitation: invitation.clone(),
                    expires: Instant::now() + self.config.session.invitation_timeout(),
                },
            );
            self.events
                .publish(SessionEvent::InvitationReceived(invitation));
            if self.config.session.auto_accept_invitations && !self.lifecycle.is_in_session() {
                if let Err(e) = self.accept(invitation_id, None) {
                    warn!(error = %e, "Auto-accept failed");
                }
            }
            return;
        }

        // A driver's invitation on its way to the invitee.
        let now = Instant::now();
        let policy = self.config.session.policy();
        if !self.lifecycle.is_running() {
            return;
        }
        let Some(session) = self
            .session
            .as_mut()
            .filter(|s| s.id == invitation.session_id)
        else {
            debug!(from = %from, "Ignoring invitation for another session");
            return;
        };
        let Some(host) = session.host.as_mut() else {
            debug!(from = %from, "Ignoring invitation addressed to someone else");
            return;
        };
        if invitation.inviter != from {
            warn!(from = %from, inviter = %invitation.inviter, "Invitation relayed for someone else");
            return;
        }
        if let Err(e) = session.participants.check_can_invite(&from, &policy) {
            warn!(from = %from, error = %e, "Rejected invitation");
            return;
        }
        if session.participants.contains(&invitation.invitee) {
            debug!(invitee = %invitation.invitee, "Invitee already joined");
            return;
        }
        if let Err(e) = host.invitations.register(
            invitation.invitation_id,
            invitation.invitee.clone(),
            from,
            now,
        ) {
            warn!(error = %e, "Rejected invitation");
            return;
        }
        let invitee = invitation.invitee.clone();
        self.send(&invitee, &PeerMessage::Invitation(invitation));
    }

    fn on_invitation_accepted(&mut self, from: UserId, accepted: InvitationAccepted) {
        let running = self.lifecycle.is_running();
        let Some(session) = self
            .session
            .as_mut()
            .filter(|s| running && s.id == accepted.session_id)
        else {
            debug!(from = %from, "Acceptance for a session that is gone");
            self.reject_joiner(&from, accepted.session_id);
            return;
        };
        let Some(host) = session.host.as_mut() else {
            return;
        };
        let known = host
            .invitations
            .get(&accepted.invitation_id)
            .is_some_and(|pending| pending.invitee == from);
        if !known {
            warn!(from = %from, invitation = %accepted.invitation_id, "Acceptance for unknown invitation");
            self.reject_joiner(&from, accepted.session_id);
            return;
        }
        host.invitations.resolve(&accepted.invitation_id);
        self.admit(from, accepted.invitation_id);
    }

    fn reject_joiner(&mut self, joiner: &UserId, session_id: SessionId) {
        self.send(
            joiner,
            &PeerMessage::SessionEnded(SessionEnded {
                session_id,
                reason: StopReason::HostDissolved,
            }),
        );
    }

    /// Host: add an accepted invitee and send it the session snapshot.
    fn admit(&mut self, joiner: UserId, invitation_id: InvitationId) {
        // Batches still pending go to the current members only.
        self.flush_outgoing();

        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Err(e) = session
            .participants
            .add(joiner.clone(), SessionPolicy::JOINER_ROLE)
        {
            warn!(user = %joiner, error = %e, "Could not admit joiner");
            return;
        }
        self.applier.refresh_all(&session.reference_points);
        let welcome = match build_welcome(&*self.fs, session) {
            Ok(welcome) => welcome,
            Err(e) => {
                error!(user = %joiner, error = %e, "Could not snapshot reference points");
                let _ = session.participants.remove(&joiner);
                let session_id = session.id;
                self.reject_joiner(&joiner, session_id);
                return;
            }
        };
        let session_id = session.id;
        let others: Vec<UserId> = session
            .participants
            .others(&self.local)
            .filter(|user| *user != &joiner)
            .cloned()
            .collect();

        self.events.publish(SessionEvent::InvitationResolved {
            invitation_id,
            invitee: joiner.clone(),
            outcome: InvitationOutcome::Accepted,
        });
        let participant = ParticipantInfo {
            user: joiner.clone(),
            role: SessionPolicy::JOINER_ROLE,
        };
        let joined = PeerMessage::UserJoined(UserJoined {
            session_id,
            participant: participant.clone(),
        });
        for peer in &others {
            self.send(peer, &joined);
        }
        self.events.publish(SessionEvent::UserJoined(participant));
        info!(user = %joiner, "Participant joined");

        match PeerMessage::Welcome(welcome).to_bytes() {
            Ok(payload) => self.send_snapshot(joiner, payload),
            Err(e) => error!(user = %joiner, error = %e, "Could not encode snapshot"),
        }
    }

    fn send_snapshot(&self, joiner: UserId, payload: Vec<u8>) {
        let transfer = OutgoingTransfer::start(
            Arc::clone(&self.negotiator),
            joiner.clone(),
            payload,
            self.config.transport.chunk_size,
        );
        debug!(peer = %joiner, transfer = %transfer.id(), "Sending session snapshot");
        let monitor = EventMonitor::new(self.events.clone(), joiner.clone());
        let interval = self.config.transport.monitor_interval();
        let reports = self.reports_tx.clone();
        tokio::spawn(async move {
            let (status, stats) = monitor_transfer(&transfer, &monitor, interval).await;
            let _ = reports.send(TransferReport {
                peer: joiner,
                status,
                stats,
            });
        });
    }

    async fn on_transfer_report(&mut self, report: TransferReport) {
        match report.status {
            TransferStatus::Ok => {
                debug!(peer = %report.peer, bytes = report.stats.written, "Snapshot delivered");
                self.negotiator.record_transfer(&report.peer, report.stats);
            }
            status => {
                warn!(peer = %report.peer, ?status, "Snapshot transfer failed");
                let is_member = self
                    .session
                    .as_ref()
                    .is_some_and(|s| s.is_host() && s.participants.contains(&report.peer));
                if is_member {
                    self.remove_participant(&report.peer, StopReason::ConnectionLost);
                }
            }
        }
    }

    fn on_invitation_declined(&mut self, from: UserId, declined: InvitationDeclined) {
        let Some(host) = self.session.as_mut().and_then(|s| s.host.as_mut()) else {
            return;
        };
        let known = host
            .invitations
            .get(&declined.invitation_id)
            .is_some_and(|pending| pending.invitee == from);
        if !known {
            debug!(from = %from, "Decline for unknown invitation");
            return;
        }
        host.invitations.resolve(&declined.invitation_id);
        info!(invitee = %from, reason = %declined.reason, "Invitation declined");
        self.events.publish(SessionEvent::InvitationResolved {
            invitation_id: declined.invitation_id,
            invitee: from,
            outcome: InvitationOutcome::Declined {
                reason: declined.reason,
            },
        });
    }

    /// Add a chunk; returns the reassembled message once complete.
    async fn on_transfer_chunk(&mut self, from: &UserId, chunk: TransferChunk) -> Option<PeerMessage> {
        match self.incoming.on_chunk(from, chunk) {
            Ok(None) => None,
            Ok(Some(payload)) => match PeerMessage::from_bytes(&payload) {
                Ok(message) => {
                    debug!(peer = %from, kind = message.kind(), size = payload.len(), "Reassembled frame");
                    Some(message)
                }
                Err(e) => {
                    warn!(peer = %from, error = %e, "Undecodable transfer payload");
                    self.fail_join_from(from, e.to_string()).await;
                    None
                }
            },
            Err(e) => {
                warn!(peer = %from, error = %e, "Transfer failed");
                self.fail_join_from(from, e.to_string()).await;
                None
            }
        }
    }

    async fn on_transfer_cancelled(&mut self, from: UserId, cancelled: TransferCancelled) {
        if self.incoming.cancel(&from, cancelled.transfer_id) {
            self.fail_join_from(&from, "snapshot transfer cancelled".into())
                .await;
        }
    }

    async fn on_welcome(&mut self, from: UserId, welcome: Welcome) {
        let Some(joining) = self.joining.as_ref() else {
            debug!(peer = %from, "Snapshot while not joining");
            return;
        };
        if from != joining.invitation.host || welcome.session_id != joining.invitation.session_id {
            warn!(peer = %from, "Snapshot from an unexpected peer");
            return;
        }

        let added: Vec<(ReferencePointId, String)> = welcome
            .reference_points
            .iter()
            .map(|rp| (rp.id, rp.name.clone()))
            .collect();
        let result = self.set_up_joined_session(welcome, &joining.workspace);
        let session = match result {
            Ok(session) => session,
            Err(e) => {
                self.fail_join(e.to_string()).await;
                return;
            }
        };
        let Some(joining) = self.joining.take() else {
            return;
        };

        info!(session = %session.id, next = %session.dispatcher.next_expected(), "Joined session");
        self.session = Some(session);
        self.on_lifecycle(LifecycleEvent::SetupCompleted).await;
        if !added.is_empty() {
            self.events.publish(SessionEvent::ReferencePointsAdded {
                reference_points: added,
            });
        }
        for message in joining.stash {
            self.on_host_message(from.clone(), message).await;
        }
        if let Some(reply) = joining.reply {
            let _ = reply.send(Ok(()));
        }
    }

    fn set_up_joined_session(
        &self,
        welcome: Welcome,
        workspace: &Path,
    ) -> Result<ActiveSession, SessionError> {
        let participants =
            Participants::from_snapshot(&welcome.host, &welcome.participants).map_err(membership)?;
        if !participants.contains(&self.local) {
            return Err(MembershipError::NotMember(self.local.clone()).into());
        }

        let mut reference_points = ReferencePointRegistry::new();
        for snapshot in welcome.reference_points {
            let root = replica_root(workspace, &snapshot.name, snapshot.id, &reference_points);
            reference_points.register(snapshot.id, snapshot.name.clone(), root)?;
            let content = ActivityKind::ReferencePointAdded {
                id: snapshot.id,
                name: snapshot.name,
                folders: snapshot.folders,
                files: snapshot.files,
            };
            self.applier
                .apply(&content, &reference_points)
                .map_err(|e| SessionError::JoinFailed(e.to_string()))?;
        }

        let config = &self.config.session;
        Ok(ActiveSession {
            id: welcome.session_id,
            participants,
            reference_points,
            workspace: workspace.to_path_buf(),
            dispatcher: Dispatcher::starting_at(welcome.next_timestamp, config.gap_timeout()),
            outgoing: Batcher::new(config.batch_window(), config.max_batch_size),
            host: None,
        })
    }

    async fn fail_join_from(&mut self, peer: &UserId, error: String) {
        if self
            .joining
            .as_ref()
            .is_some_and(|j| &j.invitation.host == peer)
        {
            self.fail_join(error).await;
        }
    }

    async fn fail_join(&mut self, error: String) {
        let Some(joining) = self.joining.as_mut() else {
            return;
        };
        warn!(session = %joining.invitation.session_id, %error, "Joining failed");
        let reply = joining.reply.take();
        let host = joining.invitation.host.clone();
        let ended = PeerMessage::SessionEnded(SessionEnded {
            session_id: joining.invitation.session_id,
            reason: StopReason::LocalError,
        });
        self.send_now(&[host], &ended).await;
        self.on_lifecycle(LifecycleEvent::SetupFailed {
            error: error.clone(),
        })
        .await;
        if let Some(reply) = reply {
            let _ = reply.send(Err(SessionError::JoinFailed(error)));
        }
    }

    /// Frames only the host sends: sequenced activities and membership news.
    async fn on_host_message(&mut self, from: UserId, message: PeerMessage) {
        if let Some(joining) = self.joining.as_mut() {
            if from == joining.invitation.host {
                if matches!(message, PeerMessage::Kicked(_)) {
                    self.fail_join("removed by the host".into()).await;
                } else {
                    joining.stash.push(message);
                }
                return;
            }
        }

        let Some(session) = self.session.as_ref() else {
            debug!(peer = %from, kind = message.kind(), "No session for frame");
            return;
        };
        if session.is_host() || &from != session.participants.host() {
            debug!(peer = %from, kind = message.kind(), "Ignoring frame not sent by the host");
            return;
        }
        let session_id = session.id;

        match message {
            PeerMessage::Activities(batch) => self.on_activities(from, batch).await,
            PeerMessage::UserJoined(joined) if joined.session_id == session_id => {
                self.on_user_joined(joined.participant)
            }
            PeerMessage::UserLeft(left) if left.session_id == session_id => {
                self.on_user_left(left)
            }
            PeerMessage::Kicked(kicked) if kicked.session_id == session_id => {
                warn!("Removed from the session by the host");
                self.stop(StopReason::Kicked).await;
            }
            other => debug!(kind = other.kind(), "Ignoring frame for another session"),
        }
    }

    async fn on_activities(&mut self, from: UserId, batch: ActivityBatch) {
        let now = Instant::now();
        let envelope = match Envelope::decode(&batch.envelope, &self.registry) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(peer = %from, error = %e, "Dropping malformed batch");
                self.events.publish(SessionEvent::ActivityDropped {
                    source: from,
                    reason: e.to_string(),
                });
                return;
            }
        };
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if envelope.session_id != session.id {
            debug!(peer = %from, "Batch for another session");
            return;
        }

        let mut ready = Vec::new();
        for timed in envelope.activities {
            ready.extend(session.dispatcher.receive(timed, now));
        }
        self.deliver(ready).await;
    }

    fn on_user_joined(&mut self, participant: ParticipantInfo) {
        if participant.user == self.local {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session
            .participants
            .add(participant.user.clone(), participant.role)
        {
            Ok(()) => {
                info!(user = %participant.user, "Participant joined");
                self.events.publish(SessionEvent::UserJoined(participant));
            }
            Err(e) => debug!(user = %participant.user, error = %e, "Ignoring join"),
        }
    }

    fn on_user_left(&mut self, left: UserLeft) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.participants.remove(&left.user) {
            Ok(_) => {
                info!(user = %left.user, reason = %left.reason, "Participant left");
                self.events.publish(SessionEvent::UserLeft {
                    user: left.user,
                    reason: left.reason,
                });
            }
            Err(e) => debug!(user = %left.user, error = %e, "Ignoring leave"),
        }
    }

    async fn on_submit(&mut self, from: UserId, batch: ActivityBatch) {
        let envelope = match Envelope::decode(&batch.envelope, &self.registry) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(peer = %from, error = %e, "Dropping malformed submission");
                self.events.publish(SessionEvent::ActivityDropped {
                    source: from,
                    reason: e.to_string(),
                });
                return;
            }
        };
        let running = self.lifecycle.is_running();
        if !self
            .session
            .as_ref()
            .is_some_and(|s| running && s.is_host() && s.id == envelope.session_id)
        {
            debug!(peer = %from, "Submission outside a hosted session");
            return;
        }

        for timed in envelope.activities {
            let activity = timed.activity;
            // Checked one at a time: earlier entries may add reference points.
            let verdict = match self.session.as_ref() {
                None => break,
                Some(_) if activity.source != from => {
                    Err(format!("submitted on behalf of {}", activity.source))
                }
                Some(session) => session
                    .participants
                    .check_origination(&from, &activity.kind)
                    .map_err(SessionError::from)
                    .and_then(|()| check_resources(session, &activity.kind))
                    .map_err(|e| e.to_string()),
            };
            match verdict {
                Ok(()) => self.sequence(activity).await,
                Err(reason) => {
                    warn!(peer = %from, %reason, "Rejected activity");
                    self.events.publish(SessionEvent::ActivityDropped {
                        source: from.clone(),
                        reason,
                    });
                }
            }
        }
    }

    fn on_retransmit_request(&mut self, from: UserId, request: RetransmitRequest) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let Some(host) = session.host.as_ref() else {
            return;
        };
        if request.session_id != session.id || !session.participants.contains(&from) {
            debug!(peer = %from, "Retransmit request outside the session");
            return;
        }
        let Some(activities) = host.replay.range(request.from, request.to) else {
            warn!(peer = %from, from = %request.from, to = %request.to, "Retransmit range no longer held");
            return;
        };

        info!(peer = %from, from = %request.from, to = %request.to, "Retransmitting");
        let size = self.config.session.max_batch_size.max(1);
        for chunk in activities.chunks(size) {
            match batch_frame(
                &self.registry,
                session.id,
                chunk.to_vec(),
                PeerMessage::Activities,
            ) {
                Ok(frame) => self.senders.send(&from, frame),
                Err(e) => {
                    error!(error = %e, "Could not encode retransmission");
                    return;
                }
            }
        }
    }

    async fn on_session_ended(&mut self, from: UserId, ended: SessionEnded) {
        if self
            .joining
            .as_ref()
            .is_some_and(|j| j.invitation.host == from)
        {
            self.fail_join(format!("host ended the session ({})", ended.reason))
                .await;
            return;
        }
        let Some(session) = self
            .session
            .as_ref()
            .filter(|s| s.id == ended.session_id)
        else {
            return;
        };

        if session.is_host() {
            if session.participants.contains(&from) {
                self.remove_participant(&from, ended.reason);
            }
        } else if &from == session.participants.host() {
            info!(reason = %ended.reason, "Host ended the session");
            self.stop(StopReason::HostDissolved).await;
        }
    }

    /// Host: drop a participant and tell everyone else.
    fn remove_participant(&mut self, user: &UserId, reason: StopReason) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.is_host() || session.participants.remove(user).is_err() {
            return;
        }
        let session_id = session.id;
        let others: Vec<UserId> = session.participants.others(&self.local).cloned().collect();

        if reason == StopReason::Kicked {
            // Let the notice go out first.
            self.senders.finish(user);
        } else {
            self.senders.cancel(user);
        }
        let left = PeerMessage::UserLeft(UserLeft {
            session_id,
            user: user.clone(),
            reason,
        });
        for peer in &others {
            self.send(peer, &left);
        }
        info!(user = %user, %reason, "Participant left");
        self.events.publish(SessionEvent::UserLeft {
            user: user.clone(),
            reason,
        });
    }

    async fn on_peer_failure(&mut self, failure: PeerFailure) {
        let PeerFailure { peer, error } = failure;
        if self
            .joining
            .as_ref()
            .is_some_and(|j| j.invitation.host == peer)
        {
            self.fail_join(format!("host unreachable: {error}")).await;
            return;
        }
        let Some(session) = self.session.as_ref() else {
            debug!(peer = %peer, error = %error, "Peer unreachable");
            return;
        };

        if session.is_host() {
            if session.participants.contains(&peer) {
                warn!(peer = %peer, error = %error, "Lost participant");
                self.remove_participant(&peer, StopReason::ConnectionLost);
            }
        } else if &peer == session.participants.host() {
            warn!(peer = %peer, error = %error, "Lost the session host");
            self.stop(StopReason::ConnectionLost).await;
        }
    }

    fn on_local_change(&mut self, change: LocalChange) {
        if !self.lifecycle.is_running() {
            return;
        }
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if let Some(resource) = session.reference_points.locate(&change.path) {
            debug!(path = %change.path.display(), "Local change to a shared resource");
            self.events
                .publish(SessionEvent::LocalConflict { resource, change });
        }
    }

    // ===== Timers =====

    async fn housekeeping(&mut self) {
        let now = Instant::now();

        let due = self.session.as_mut().and_then(|s| {
            let is_host = s.is_host();
            s.outgoing.poll(now).map(|batch| (is_host, batch))
        });
        match due {
            Some((true, batch)) => self.broadcast(batch),
            Some((false, batch)) => self.submit(batch),
            None => {}
        }

        let gap = self.session.as_mut().and_then(|s| s.dispatcher.poll_gap(now));
        match gap {
            Some(GapAction::RequestRetransmit { from, to }) => {
                if let Some(session) = &self.session {
                    info!(%from, %to, "Requesting retransmission");
                    let host = session.participants.host().clone();
                    let request = PeerMessage::RetransmitRequest(RetransmitRequest {
                        session_id: session.id,
                        from,
                        to,
                    });
                    self.send(&host, &request);
                }
            }
            Some(GapAction::Escalate(e)) => {
                error!(error = %e, "Gap not repaired");
                self.stop(StopReason::LocalError).await;
            }
            None => {}
        }

        let expired = self
            .session
            .as_mut()
            .and_then(|s| s.host.as_mut())
            .map(|h| h.invitations.expire(now))
            .unwrap_or_default();
        for invitation in expired {
            info!(invitee = %invitation.invitee, "Invitation expired");
            self.events.publish(SessionEvent::InvitationResolved {
                invitation_id: invitation.id,
                invitee: invitation.invitee,
                outcome: InvitationOutcome::Expired,
            });
        }

        self.received.retain(|id, r| {
            let keep = r.expires > now;
            if !keep {
                debug!(invitation = %id, host = %r.invitation.host, "Dropping unanswered invitation");
            }
            keep
        });

        if self.joining.as_ref().is_some_and(|j| j.deadline <= now) {
            self.fail_join("no snapshot from the host in time".into())
                .await;
        }
    }
}
