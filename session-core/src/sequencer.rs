//! Host-side timestamp authority and replay buffer.
//!
//! Only the host runs a [`Sequencer`]. Every activity, including the
//! host's own, gets its timestamp here, which makes the host's arrival
//! order the session's single global order.

use session_types::{Activity, TimedActivity, Timestamp};
use std::collections::VecDeque;

/// Hands out consecutive session timestamps.
#[derive(Debug, Clone)]
pub struct Sequencer {
    next: Timestamp,
}

impl Sequencer {
    /// A sequencer for a fresh session.
    pub fn new() -> Self {
        Self {
            next: Timestamp::first(),
        }
    }

    /// The timestamp the next activity will receive.
    pub fn peek_next(&self) -> Timestamp {
        self.next
    }

    /// Stamp an activity with the next timestamp.
    pub fn stamp(&mut self, activity: Activity) -> TimedActivity {
        let timestamp = self.next;
        self.next = self.next.next();
        TimedActivity::new(activity, timestamp)
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

/// Most recent sequenced activities, kept to answer retransmit requests.
#[derive(Debug, Clone)]
pub struct ReplayBuffer {
    entries: VecDeque<TimedActivity>,
    capacity: usize,
}

impl ReplayBuffer {
    /// Create a buffer holding at most `capacity` activities.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    /// Record a sequenced activity, evicting the oldest when full.
    ///
    /// Activities must be pushed in timestamp order.
    pub fn push(&mut self, activity: TimedActivity) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(activity);
    }

    /// The inclusive range `from..=to`, or `None` if any of it is no
    /// longer (or not yet) held.
    pub fn range(&self, from: Timestamp, to: Timestamp) -> Option<Vec<TimedActivity>> {
        let first = self.entries.front()?.timestamp;
        let last = self.entries.back()?.timestamp;
        if from > to || from < first || to > last {
            return None;
        }
        let start = (from.value() - first.value()) as usize;
        let end = (to.value() - first.value()) as usize;
        Some(self.entries.range(start..=end).cloned().collect())
    }

    /// Oldest timestamp still held.
    pub fn oldest(&self) -> Option<Timestamp> {
        self.entries.front().map(|a| a.timestamp)
    }

    /// Number of held activities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use session_types::{ActivityKind, ReferencePointId, ResourcePath, SessionPath, UserId};

    fn activity(n: u64) -> Activity {
        Activity::new(
            UserId::parse("alice@example.org").unwrap(),
            ActivityKind::FolderCreated {
                path: ResourcePath::new(
                    ReferencePointId::new(),
                    SessionPath::parse(&format!("d{n}")).unwrap(),
                ),
            },
        )
    }

    #[test]
    fn stamps_are_consecutive_from_one() {
        let mut seq = Sequencer::new();
        let stamps: Vec<u64> = (0..5)
            .map(|n| seq.stamp(activity(n)).timestamp.value())
            .collect();
        assert_eq!(stamps, vec![1, 2, 3, 4, 5]);
        assert_eq!(seq.peek_next(), Timestamp::new(6));
    }

    fn filled(capacity: usize, count: u64) -> ReplayBuffer {
        let mut seq = Sequencer::new();
        let mut buffer = ReplayBuffer::new(capacity);
        for n in 0..count {
            buffer.push(seq.stamp(activity(n)));
        }
        buffer
    }

    #[test]
    fn range_returns_inclusive_slice() {
        let buffer = filled(10, 6);
        let range = buffer.range(Timestamp::new(2), Timestamp::new(4)).unwrap();
        let stamps: Vec<u64> = range.iter().map(|a| a.timestamp.value()).collect();
        assert_eq!(stamps, vec![2, 3, 4]);
    }

    #[test]
    fn evicted_range_is_unavailable() {
        let buffer = filled(3, 6);
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.oldest(), Some(Timestamp::new(4)));
        assert!(buffer.range(Timestamp::new(3), Timestamp::new(5)).is_none());
        assert!(buffer.range(Timestamp::new(4), Timestamp::new(6)).is_some());
    }

    #[test]
    fn future_range_is_unavailable() {
        let buffer = filled(10, 3);
        assert!(buffer.range(Timestamp::new(2), Timestamp::new(7)).is_none());
        assert!(buffer.range(Timestamp::new(3), Timestamp::new(2)).is_none());
        assert!(ReplayBuffer::new(4)
            .range(Timestamp::new(1), Timestamp::new(1))
            .is_none());
    }

    #[test]
    fn zero_capacity_holds_nothing() {
        let buffer = filled(0, 3);
        assert!(buffer.is_empty());
    }
}
