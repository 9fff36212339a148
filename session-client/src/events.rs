//! Session notifications.
//!
//! The session actor publishes [`SessionEvent`]s on an [`EventBus`].
//! Each [`Subscription`] has its own queue; once it is dropped or
//! unsubscribed nothing more is delivered to it.

use crate::host::LocalChange;
use crate::transport::ProgressMonitor;
use session_core::{InvitationOutcome, LinkNotice, TransferStats};
use session_types::{
    Activity, Invitation, InvitationId, ParticipantInfo, ReferencePointId, ResourcePath, Role,
    SessionId, StopReason, Timestamp, UserId,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;

/// Something observers of a session care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The local session is running.
    SessionStarted {
        /// Session id.
        session_id: SessionId,
        /// Session host.
        host: UserId,
    },
    /// The local session ended.
    SessionStopped {
        /// Why.
        reason: StopReason,
    },
    /// Someone joined.
    UserJoined(ParticipantInfo),
    /// Someone left.
    UserLeft {
        /// Who.
        user: UserId,
        /// Why.
        reason: StopReason,
    },
    /// A role changed.
    RoleChanged {
        /// Whose.
        user: UserId,
        /// Previous role.
        old: Role,
        /// New role.
        new: Role,
    },
    /// An invitation arrived for the local user.
    InvitationReceived(Invitation),
    /// An invitation issued in this session was answered or expired.
    InvitationResolved {
        /// Invitation handle.
        invitation_id: InvitationId,
        /// Invited user.
        invitee: UserId,
        /// How it ended.
        outcome: InvitationOutcome,
    },
    /// Reference points became shared.
    ReferencePointsAdded {
        /// Their ids and names.
        reference_points: Vec<(ReferencePointId, String)>,
    },
    /// A sequenced activity was applied locally.
    ActivityApplied {
        /// Its timestamp.
        timestamp: Timestamp,
        /// The activity.
        activity: Activity,
    },
    /// An activity was rejected or could not be applied.
    ActivityDropped {
        /// Originator.
        source: UserId,
        /// Why.
        reason: String,
    },
    /// Progress of a bulk transfer.
    TransferProgress {
        /// Other end of the transfer.
        peer: UserId,
        /// Current statistics.
        stats: TransferStats,
    },
    /// The link to a peer changed.
    LinkStatus {
        /// Peer.
        peer: UserId,
        /// What happened.
        status: LinkNotice,
    },
    /// The local user changed a shared resource outside the session.
    LocalConflict {
        /// Session address of the resource.
        resource: ResourcePath,
        /// The change.
        change: LocalChange,
    },
}

#[derive(Debug, Default)]
struct Subscribers {
    senders: HashMap<u64, mpsc::UnboundedSender<SessionEvent>>,
}

/// Fan-out of session events.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Subscribers>>,
    next_id: Arc<AtomicU64>,
}

fn lock(subscribers: &Mutex<Subscribers>) -> MutexGuard<'_, Subscribers> {
    subscribers.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EventBus {
    /// Create a bus with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to every live subscription.
    pub fn publish(&self, event: SessionEvent) {
        let mut subs = lock(&self.subscribers);
        subs.senders.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    /// Start receiving events.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscribers).senders.insert(id, tx);
        Subscription {
            id,
            rx,
            bus: Arc::downgrade(&self.subscribers),
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).senders.len()
    }
}

/// A stream of session events.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<SessionEvent>,
    bus: Weak<Mutex<Subscribers>>,
}

impl Subscription {
    /// Subscription id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next event. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Next event if one is queued.
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }

    /// Stop receiving; queued events are discarded.
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(subs) = self.bus.upgrade() {
            lock(&subs).senders.remove(&self.id);
        }
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Publishes transfer progress as [`SessionEvent::TransferProgress`].
#[derive(Debug)]
pub struct EventMonitor {
    bus: EventBus,
    peer: UserId,
    cancelled: AtomicBool,
}

impl EventMonitor {
    /// Report progress of a transfer to `peer` on `bus`.
    pub fn new(bus: EventBus, peer: UserId) -> Self {
        Self {
            bus,
            peer,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Ask the monitored transfer to stop.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl ProgressMonitor for EventMonitor {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn worked(&self, _delta: u32) {}

    fn sub_task(&self, label: &str) {
        tracing::debug!(peer = %self.peer, "{label}");
    }

    fn stats(&self, stats: &TransferStats) {
        self.bus.publish(SessionEvent::TransferProgress {
            peer: self.peer.clone(),
            stats: *stats,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stopped() -> SessionEvent {
        SessionEvent::SessionStopped {
            reason: StopReason::LocalLeave,
        }
    }

    #[tokio::test]
    async fn every_subscriber_gets_every_event() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(stopped());
        assert_eq!(a.recv().await, Some(stopped()));
        assert_eq!(b.recv().await, Some(stopped()));
    }

    #[test]
    fn dropped_subscription_is_removed() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(stopped());
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let keep = bus.subscribe();
        let gone = bus.subscribe();
        assert_ne!(keep.id(), gone.id());
        gone.unsubscribe();
        bus.publish(stopped());
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn subscription_outlives_bus() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        bus.publish(stopped());
        drop(bus);
        assert_eq!(sub.try_recv(), Some(stopped()));
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn event_monitor_publishes_stats() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        let peer = UserId::parse("bob@example.org").unwrap();
        let monitor = EventMonitor::new(bus, peer.clone());
        let stats = TransferStats::compute(10, 5, std::time::Duration::from_secs(1));
        monitor.stats(&stats);
        assert_eq!(
            sub.try_recv(),
            Some(SessionEvent::TransferProgress { peer, stats })
        );
        assert!(!monitor.is_cancelled());
        monitor.cancel();
        assert!(monitor.is_cancelled());
    }
}
