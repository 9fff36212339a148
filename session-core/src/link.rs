//! Per-peer channel negotiation state machine.
//!
//! Candidates are tried in preference order. When one fails the next one
//! is tried; when all have failed the link backs off and later restarts
//! from the most preferred candidate. A send failure on an established
//! channel resets the link so the next send renegotiates.
//!
//! Like the lifecycle machine this is pure: the transport layer in
//! `session-client` opens channels and runs timers according to the
//! returned actions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Kind of byte-stream channel between two participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelKind {
    /// Plain socket straight to the peer.
    Direct,
    /// Peer-to-peer after NAT traversal.
    HolePunched,
    /// Through an intermediary.
    Relayed,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelKind::Direct => "direct",
            ChannelKind::HolePunched => "hole-punched",
            ChannelKind::Relayed => "relayed",
        };
        f.write_str(name)
    }
}

impl FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(ChannelKind::Direct),
            "hole-punched" => Ok(ChannelKind::HolePunched),
            "relayed" => Ok(ChannelKind::Relayed),
            other => Err(format!("unknown channel kind: {other}")),
        }
    }
}

/// Negotiation state of the link to one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    /// No channel.
    #[default]
    Idle,
    /// Trying a candidate.
    Negotiating {
        /// Index into the candidate list.
        candidate: usize,
        /// Completed rounds without success.
        round: u32,
    },
    /// A channel is up.
    Established {
        /// The kind in use.
        kind: ChannelKind,
    },
    /// Every candidate failed; waiting before the next round.
    Backoff {
        /// Failed rounds so far.
        attempt: u32,
    },
}

/// Inputs to the link machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Someone wants to send.
    ConnectRequested,
    /// The current candidate opened.
    CandidateSucceeded,
    /// The current candidate failed or timed out.
    CandidateFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// A send on the established channel failed.
    SendFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// The backoff delay is over.
    BackoffElapsed,
    /// The link is no longer needed.
    CloseRequested,
}

/// Instructions for the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    /// Open a channel of this kind.
    TryCandidate {
        /// Kind to open.
        kind: ChannelKind,
    },
    /// Drop the current channel.
    DropChannel,
    /// Wait before renegotiating.
    StartBackoffTimer {
        /// How long.
        delay: Duration,
    },
    /// Tell the session about it.
    Notify(LinkNotice),
}

/// Link changes visible to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkNotice {
    /// A channel is up.
    Established {
        /// The kind in use.
        kind: ChannelKind,
    },
    /// Moving on to a less preferred candidate.
    FellBack {
        /// The failed kind.
        from: ChannelKind,
        /// The next kind to try.
        to: ChannelKind,
        /// Why `from` failed.
        error: String,
    },
    /// All candidates failed.
    Exhausted {
        /// Failed rounds so far.
        attempt: u32,
    },
    /// An established channel broke.
    Reset {
        /// The kind that broke.
        kind: ChannelKind,
        /// Error message describing the failure.
        error: String,
    },
}

impl LinkState {
    /// Process an event and return the new state plus actions to execute.
    ///
    /// `candidates` is the preference-ordered list of channel kinds.
    pub fn on_event(self, event: LinkEvent, candidates: &[ChannelKind]) -> (Self, Vec<LinkAction>) {
        match (self, event) {
            (Self::Idle, LinkEvent::ConnectRequested) => Self::begin_round(0, candidates),

            (Self::Negotiating { candidate, .. }, LinkEvent::CandidateSucceeded) => {
                match candidates.get(candidate) {
                    Some(&kind) => (
                        Self::Established { kind },
                        vec![LinkAction::Notify(LinkNotice::Established { kind })],
                    ),
                    None => (Self::Idle, vec![LinkAction::DropChannel]),
                }
            }
            (Self::Negotiating { candidate, round }, LinkEvent::CandidateFailed { error }) => {
                let next = candidate + 1;
                match (candidates.get(candidate), candidates.get(next)) {
                    (Some(&from), Some(&to)) => (
                        Self::Negotiating {
                            candidate: next,
                            round,
                        },
                        vec![
                            LinkAction::Notify(LinkNotice::FellBack { from, to, error }),
                            LinkAction::TryCandidate { kind: to },
                        ],
                    ),
                    _ => Self::exhausted(round.saturating_add(1)),
                }
            }

            (Self::Established { kind }, LinkEvent::SendFailed { error }) => (
                Self::Idle,
                vec![
                    LinkAction::DropChannel,
                    LinkAction::Notify(LinkNotice::Reset { kind, error }),
                ],
            ),

            (Self::Backoff { attempt }, LinkEvent::BackoffElapsed) => {
                Self::begin_round(attempt, candidates)
            }

            (_, LinkEvent::CloseRequested) => (Self::Idle, vec![LinkAction::DropChannel]),

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    fn begin_round(round: u32, candidates: &[ChannelKind]) -> (Self, Vec<LinkAction>) {
        match candidates.first() {
            Some(&kind) => (
                Self::Negotiating {
                    candidate: 0,
                    round,
                },
                vec![LinkAction::TryCandidate { kind }],
            ),
            None => Self::exhausted(round.saturating_add(1)),
        }
    }

    fn exhausted(attempt: u32) -> (Self, Vec<LinkAction>) {
        (
            Self::Backoff { attempt },
            vec![
                LinkAction::Notify(LinkNotice::Exhausted { attempt }),
                LinkAction::StartBackoffTimer {
                    delay: calculate_backoff(attempt),
                },
            ],
        )
    }

    /// The established channel kind, if any.
    pub fn established(&self) -> Option<ChannelKind> {
        match self {
            Self::Established { kind } => Some(*kind),
            _ => None,
        }
    }

    /// Check if waiting out a backoff.
    pub fn is_backing_off(&self) -> bool {
        matches!(self, Self::Backoff { .. })
    }
}

/// Renegotiation delay with jitter.
///
/// Formula: min(30s, 2^attempt seconds) + random(0..500ms)
pub fn calculate_backoff(attempt: u32) -> Duration {
    let base_secs = 2u64.pow(attempt.min(5)).min(30);
    Duration::from_secs(base_secs) + Duration::from_millis(random_jitter_ms())
}

/// Generate random jitter between 0 and 499 milliseconds.
fn random_jitter_ms() -> u64 {
    let mut bytes = [0u8; 8];
    match getrandom::getrandom(&mut bytes) {
        Ok(()) => u64::from_le_bytes(bytes) % 500,
        Err(_) => 0,
    }
}
