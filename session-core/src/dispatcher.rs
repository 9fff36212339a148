//! Reorder buffer for incoming sequenced activities.
//!
//! Activities are released strictly in timestamp order. A missing
//! timestamp stalls everything above it:
//! - after one `gap_timeout` the dispatcher asks for a retransmission of
//!   the missing range, once;
//! - after a second `gap_timeout` on the same gap it gives up and the
//!   session must stop.
//!
//! Redelivered activities (same originator and timestamp) are dropped
//! silently.

use session_types::{TimedActivity, Timestamp, UserId};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::error::SessionConsistencyError;

/// What the caller must do about a stalled gap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GapAction {
    /// Ask the host to resend `from..=to`.
    RequestRetransmit {
        /// First missing timestamp.
        from: Timestamp,
        /// Last missing timestamp.
        to: Timestamp,
    },
    /// The retransmission did not help; stop the session.
    Escalate(SessionConsistencyError),
}

#[derive(Debug, Clone)]
struct Queued(TimedActivity);

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.0.timestamp == other.0.timestamp
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.timestamp.cmp(&other.0.timestamp)
    }
}

#[derive(Debug, Clone, Copy)]
struct GapState {
    from: Timestamp,
    since: Instant,
    retransmit_requested: bool,
}

/// Min-timestamp reorder buffer with duplicate suppression.
#[derive(Debug)]
pub struct Dispatcher {
    next_expected: Timestamp,
    pending: BinaryHeap<Reverse<Queued>>,
    pending_stamps: HashSet<Timestamp>,
    highest_applied: HashMap<UserId, Timestamp>,
    gap: Option<GapState>,
    gap_timeout: Duration,
    duplicates: u64,
}

impl Dispatcher {
    /// A dispatcher expecting the first timestamp of a fresh session.
    pub fn new(gap_timeout: Duration) -> Self {
        Self::starting_at(Timestamp::first(), gap_timeout)
    }

    /// A dispatcher for a late joiner whose snapshot covers everything
    /// below `next`.
    pub fn starting_at(next: Timestamp, gap_timeout: Duration) -> Self {
        Self {
            next_expected: next,
            pending: BinaryHeap::new(),
            pending_stamps: HashSet::new(),
            highest_applied: HashMap::new(),
            gap: None,
            gap_timeout,
            duplicates: 0,
        }
    }

    /// Accept an incoming activity and return everything now ready to
    /// apply, in order.
    pub fn receive(&mut self, activity: TimedActivity, now: Instant) -> Vec<TimedActivity> {
        if self.is_duplicate(&activity) {
            self.duplicates += 1;
            return Vec::new();
        }
        self.pending_stamps.insert(activity.timestamp);
        self.pending.push(Reverse(Queued(activity)));

        let ready = self.drain_ready();
        self.update_gap(now);
        ready
    }

    fn is_duplicate(&self, activity: &TimedActivity) -> bool {
        let timestamp = activity.timestamp;
        if !timestamp.is_sequenced() || timestamp < self.next_expected {
            return true;
        }
        if self.pending_stamps.contains(&timestamp) {
            return true;
        }
        matches!(
            self.highest_applied.get(activity.source()),
            Some(highest) if timestamp <= *highest
        )
    }

    fn drain_ready(&mut self) -> Vec<TimedActivity> {
        let mut ready = Vec::new();
        while let Some(Reverse(Queued(head))) = self.pending.peek() {
            if head.timestamp != self.next_expected {
                break;
            }
            let Some(Reverse(Queued(activity))) = self.pending.pop() else {
                break;
            };
            self.pending_stamps.remove(&activity.timestamp);
            self.highest_applied
                .insert(activity.source().clone(), activity.timestamp);
            self.next_expected = self.next_expected.next();
            ready.push(activity);
        }
        ready
    }

    fn update_gap(&mut self, now: Instant) {
        if self.pending.is_empty() {
            self.gap = None;
            return;
        }
        match self.gap {
            Some(gap) if gap.from == self.next_expected => {}
            _ => {
                self.gap = Some(GapState {
                    from: self.next_expected,
                    since: now,
                    retransmit_requested: false,
                });
            }
        }
    }

    fn lowest_pending(&self) -> Option<Timestamp> {
        self.pending.peek().map(|Reverse(Queued(a))| a.timestamp)
    }

    /// Check the gap timer.
    pub fn poll_gap(&mut self, now: Instant) -> Option<GapAction> {
        let gap = self.gap?;
        if now.duration_since(gap.since) < self.gap_timeout {
            return None;
        }
        let from = gap.from;
        let to = Timestamp::new(self.lowest_pending()?.value().saturating_sub(1));

        if gap.retransmit_requested {
            self.gap = None;
            return Some(GapAction::Escalate(
                SessionConsistencyError::UnresolvedGap { from, to },
            ));
        }
        self.gap = Some(GapState {
            retransmit_requested: true,
            since: now,
            ..gap
        });
        Some(GapAction::RequestRetransmit { from, to })
    }

    /// When the gap timer fires next, if a gap is open.
    pub fn gap_deadline(&self) -> Option<Instant> {
        self.gap.map(|gap| gap.since + self.gap_timeout)
    }

    /// Discard every buffered activity without applying it.
    ///
    /// Returns how many were dropped.
    pub fn abandon(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        self.pending_stamps.clear();
        self.gap = None;
        dropped
    }

    /// The timestamp that will be released next.
    pub fn next_expected(&self) -> Timestamp {
        self.next_expected
    }

    /// Number of buffered activities.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Highest timestamp applied from `user`.
    pub fn highest_applied(&self, user: &UserId) -> Option<Timestamp> {
        self.highest_applied.get(user).copied()
    }

    /// How many redeliveries were suppressed.
    pub fn duplicates_dropped(&self) -> u64 {
        self.duplicates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use session_types::{Activity, ActivityKind, ReferencePointId, ResourcePath, SessionPath};

    const TIMEOUT: Duration = Duration::from_millis(500);

    fn user(name: &str) -> UserId {
        UserId::parse(format!("{name}@example.org")).unwrap()
    }

    fn ta(who: &str, ts: u64) -> TimedActivity {
        TimedActivity::new(
            Activity::new(
                user(who),
                ActivityKind::FolderCreated {
                    path: ResourcePath::new(
                        ReferencePointId::new(),
                        SessionPath::parse(&format!("d{ts}")).unwrap(),
                    ),
                },
            ),
            Timestamp::new(ts),
        )
    }

    fn stamps(activities: &[TimedActivity]) -> Vec<u64> {
        activities.iter().map(|a| a.timestamp.value()).collect()
    }

    // ===== Ordering =====

    #[test]
    fn in_order_delivery_is_released_immediately() {
        let mut d = Dispatcher::new(TIMEOUT);
        let now = Instant::now();
        assert_eq!(stamps(&d.receive(ta("a", 1), now)), vec![1]);
        assert_eq!(stamps(&d.receive(ta("b", 2), now)), vec![2]);
        assert_eq!(d.next_expected(), Timestamp::new(3));
    }

    #[test]
    fn out_of_order_is_reordered() {
        let mut d = Dispatcher::new(TIMEOUT);
        let now = Instant::now();
        assert!(d.receive(ta("a", 3), now).is_empty());
        assert!(d.receive(ta("b", 2), now).is_empty());
        assert_eq!(stamps(&d.receive(ta("a", 1), now)), vec![1, 2, 3]);
        assert_eq!(d.pending_len(), 0);
    }

    #[test]
    fn late_gap_fill_releases_in_order() {
        let mut d = Dispatcher::new(TIMEOUT);
        let now = Instant::now();
        let mut applied = Vec::new();
        for ts in [1, 2, 4] {
            applied.extend(d.receive(ta("a", ts), now));
        }
        assert_eq!(stamps(&applied), vec![1, 2]);
        applied.extend(d.receive(ta("b", 3), now + TIMEOUT / 2));
        assert_eq!(stamps(&applied), vec![1, 2, 3, 4]);
        assert!(d.poll_gap(now + TIMEOUT * 3).is_none());
    }

    // ===== Duplicates =====

    #[test]
    fn redelivery_is_dropped() {
        let mut d = Dispatcher::new(TIMEOUT);
        let now = Instant::now();
        d.receive(ta("a", 1), now);
        assert!(d.receive(ta("a", 1), now).is_empty());
        assert_eq!(d.duplicates_dropped(), 1);
        assert_eq!(d.highest_applied(&user("a")), Some(Timestamp::new(1)));
    }

    #[test]
    fn duplicate_while_buffered_is_dropped() {
        let mut d = Dispatcher::new(TIMEOUT);
        let now = Instant::now();
        d.receive(ta("a", 3), now);
        d.receive(ta("a", 3), now);
        assert_eq!(d.pending_len(), 1);
        assert_eq!(stamps(&d.receive(ta("b", 1), now)), vec![1]);
        assert_eq!(stamps(&d.receive(ta("b", 2), now)), vec![2, 3]);
    }

    #[test]
    fn unsequenced_activity_is_ignored() {
        let mut d = Dispatcher::new(TIMEOUT);
        assert!(d.receive(ta("a", 0), Instant::now()).is_empty());
        assert_eq!(d.pending_len(), 0);
    }

    // ===== Gaps =====

    #[test]
    fn gap_requests_retransmit_once_then_escalates() {
        let mut d = Dispatcher::new(TIMEOUT);
        let t0 = Instant::now();
        let mut applied = Vec::new();
        for ts in [1, 2, 4] {
            applied.extend(d.receive(ta("a", ts), t0));
        }
        assert_eq!(stamps(&applied), vec![1, 2]);

        assert!(d.poll_gap(t0 + TIMEOUT / 2).is_none());
        assert_eq!(
            d.poll_gap(t0 + TIMEOUT),
            Some(GapAction::RequestRetransmit {
                from: Timestamp::new(3),
                to: Timestamp::new(3),
            })
        );
        // Not repeated while waiting for the answer.
        assert!(d.poll_gap(t0 + TIMEOUT + TIMEOUT / 2).is_none());
        assert!(matches!(
            d.poll_gap(t0 + TIMEOUT * 2),
            Some(GapAction::Escalate(SessionConsistencyError::UnresolvedGap { .. }))
        ));
    }

    #[test]
    fn retransmit_range_covers_whole_gap() {
        let mut d = Dispatcher::new(TIMEOUT);
        let t0 = Instant::now();
        d.receive(ta("a", 1), t0);
        d.receive(ta("a", 5), t0);
        d.receive(ta("a", 7), t0);
        assert_eq!(
            d.poll_gap(t0 + TIMEOUT),
            Some(GapAction::RequestRetransmit {
                from: Timestamp::new(2),
                to: Timestamp::new(4),
            })
        );
    }

    #[test]
    fn new_gap_gets_fresh_timer() {
        let mut d = Dispatcher::new(TIMEOUT);
        let t0 = Instant::now();
        d.receive(ta("a", 2), t0);
        d.receive(ta("a", 4), t0);
        assert!(d.poll_gap(t0 + TIMEOUT).is_some());

        // First gap fills, a second one (3) is now open.
        let t1 = t0 + TIMEOUT + Duration::from_millis(10);
        assert_eq!(stamps(&d.receive(ta("b", 1), t1)), vec![1, 2]);
        assert_eq!(d.gap_deadline(), Some(t1 + TIMEOUT));
        assert!(matches!(
            d.poll_gap(t1 + TIMEOUT),
            Some(GapAction::RequestRetransmit { .. })
        ));
    }

    #[test]
    fn no_gap_without_pending() {
        let mut d = Dispatcher::new(TIMEOUT);
        let t0 = Instant::now();
        d.receive(ta("a", 1), t0);
        assert!(d.gap_deadline().is_none());
        assert!(d.poll_gap(t0 + TIMEOUT * 10).is_none());
    }

    // ===== Lifecycle =====

    #[test]
    fn late_joiner_starts_at_snapshot() {
        let mut d = Dispatcher::starting_at(Timestamp::new(10), TIMEOUT);
        let now = Instant::now();
        assert!(d.receive(ta("a", 9), now).is_empty());
        assert_eq!(stamps(&d.receive(ta("a", 10), now)), vec![10]);
    }

    #[test]
    fn abandon_discards_without_applying() {
        let mut d = Dispatcher::new(TIMEOUT);
        let now = Instant::now();
        d.receive(ta("a", 3), now);
        d.receive(ta("a", 4), now);
        assert_eq!(d.abandon(), 2);
        assert_eq!(d.pending_len(), 0);
        assert!(d.gap_deadline().is_none());
        assert_eq!(d.next_expected(), Timestamp::first());
    }
}
