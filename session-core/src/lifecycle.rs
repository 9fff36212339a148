//! Session lifecycle state machine.
//!
//! `None → Starting → Running → Stopping → None`. The machine is pure: it
//! takes events and returns the new state plus the actions the session
//! actor must carry out, in order.

use session_types::StopReason;

/// Where the local session is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionLifecycle {
    /// No session.
    #[default]
    None,
    /// Setting up: the starter registers its reference points, a joiner
    /// waits for the host's snapshot.
    Starting,
    /// Replicating activities.
    Running,
    /// Tearing down.
    Stopping {
        /// Why the session is ending.
        reason: StopReason,
    },
}

/// Inputs to the lifecycle machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Local user starts a new session as host.
    StartRequested,
    /// Local user accepted an invitation.
    JoinRequested,
    /// Local setup (or the joiner's snapshot) is complete.
    SetupCompleted,
    /// Setup could not be completed.
    SetupFailed {
        /// What went wrong.
        error: String,
    },
    /// The session must end.
    StopRequested {
        /// Why.
        reason: StopReason,
    },
    /// All resources have been released.
    TeardownCompleted,
}

/// Instructions for the session actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleAction {
    /// Create local session state and register reference points.
    SetUpLocalSession,
    /// Tell the other participants the session ends for us.
    AnnounceEnd {
        /// Reason carried in the notice.
        reason: StopReason,
    },
    /// Drop every queued outgoing send.
    CancelPendingSends,
    /// Discard the reorder buffer without applying it.
    AbandonReorderBuffer,
    /// Release participants, reference points and links.
    ReleaseResources,
    /// Tell subscribers.
    Emit(LifecycleNotice),
}

/// Lifecycle changes visible to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleNotice {
    /// The session is running.
    Started,
    /// Setup failed; no session.
    StartFailed {
        /// What went wrong.
        error: String,
    },
    /// The session is over.
    Stopped {
        /// Why.
        reason: StopReason,
    },
}

impl SessionLifecycle {
    /// Process an event and return the new state plus actions to execute.
    pub fn on_event(self, event: LifecycleEvent) -> (Self, Vec<LifecycleAction>) {
        match (self, event) {
            (Self::None, LifecycleEvent::StartRequested) => {
                (Self::Starting, vec![LifecycleAction::SetUpLocalSession])
            }
            (Self::None, LifecycleEvent::JoinRequested) => (Self::Starting, vec![]),

            (Self::Starting, LifecycleEvent::SetupCompleted) => (
                Self::Running,
                vec![LifecycleAction::Emit(LifecycleNotice::Started)],
            ),
            (Self::Starting, LifecycleEvent::SetupFailed { error }) => (
                Self::None,
                vec![
                    LifecycleAction::CancelPendingSends,
                    LifecycleAction::ReleaseResources,
                    LifecycleAction::Emit(LifecycleNotice::StartFailed { error }),
                ],
            ),

            (Self::Starting | Self::Running, LifecycleEvent::StopRequested { reason }) => {
                let mut actions = Vec::with_capacity(4);
                if reason.announces() {
                    actions.push(LifecycleAction::AnnounceEnd { reason });
                }
                actions.push(LifecycleAction::CancelPendingSends);
                actions.push(LifecycleAction::AbandonReorderBuffer);
                actions.push(LifecycleAction::ReleaseResources);
                (Self::Stopping { reason }, actions)
            }

            (Self::Stopping { reason }, LifecycleEvent::TeardownCompleted) => (
                Self::None,
                vec![LifecycleAction::Emit(LifecycleNotice::Stopped { reason })],
            ),

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Check if a session exists in any phase.
    pub fn is_in_session(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// Check if activities are being replicated.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(state: SessionLifecycle, events: Vec<LifecycleEvent>) -> SessionLifecycle {
        events
            .into_iter()
            .fold(state, |state, event| state.on_event(event).0)
    }

    #[test]
    fn starts_with_no_session() {
        let state = SessionLifecycle::default();
        assert!(!state.is_in_session());
    }

    #[test]
    fn start_sets_up_locally_then_runs() {
        let (state, actions) = SessionLifecycle::None.on_event(LifecycleEvent::StartRequested);
        assert_eq!(state, SessionLifecycle::Starting);
        assert_eq!(actions, vec![LifecycleAction::SetUpLocalSession]);

        let (state, actions) = state.on_event(LifecycleEvent::SetupCompleted);
        assert!(state.is_running());
        assert_eq!(
            actions,
            vec![LifecycleAction::Emit(LifecycleNotice::Started)]
        );
    }

    #[test]
    fn start_only_legal_from_none() {
        let (state, actions) = SessionLifecycle::Running.on_event(LifecycleEvent::StartRequested);
        assert!(state.is_running());
        assert!(actions.is_empty());

        let (state, actions) = SessionLifecycle::Starting.on_event(LifecycleEvent::JoinRequested);
        assert_eq!(state, SessionLifecycle::Starting);
        assert!(actions.is_empty());
    }

    #[test]
    fn leave_announces_and_cleans_up_in_order() {
        let (state, actions) = SessionLifecycle::Running.on_event(LifecycleEvent::StopRequested {
            reason: StopReason::LocalLeave,
        });
        assert_eq!(
            state,
            SessionLifecycle::Stopping {
                reason: StopReason::LocalLeave
            }
        );
        assert_eq!(
            actions,
            vec![
                LifecycleAction::AnnounceEnd {
                    reason: StopReason::LocalLeave
                },
                LifecycleAction::CancelPendingSends,
                LifecycleAction::AbandonReorderBuffer,
                LifecycleAction::ReleaseResources,
            ]
        );
    }

    #[test]
    fn connection_lost_sends_no_notice() {
        let (_, actions) = SessionLifecycle::Running.on_event(LifecycleEvent::StopRequested {
            reason: StopReason::ConnectionLost,
        });
        assert!(!actions
            .iter()
            .any(|a| matches!(a, LifecycleAction::AnnounceEnd { .. })));
        assert!(actions.contains(&LifecycleAction::CancelPendingSends));
    }

    #[test]
    fn stop_from_starting_is_legal() {
        let (state, _) = SessionLifecycle::Starting.on_event(LifecycleEvent::StopRequested {
            reason: StopReason::LocalLeave,
        });
        assert!(matches!(state, SessionLifecycle::Stopping { .. }));
    }

    #[test]
    fn stop_without_session_is_ignored() {
        let (state, actions) = SessionLifecycle::None.on_event(LifecycleEvent::StopRequested {
            reason: StopReason::LocalLeave,
        });
        assert_eq!(state, SessionLifecycle::None);
        assert!(actions.is_empty());
    }

    #[test]
    fn full_cycle_returns_to_none() {
        let state = run(
            SessionLifecycle::None,
            vec![
                LifecycleEvent::JoinRequested,
                LifecycleEvent::SetupCompleted,
                LifecycleEvent::StopRequested {
                    reason: StopReason::HostDissolved,
                },
            ],
        );
        let (state, actions) = state.on_event(LifecycleEvent::TeardownCompleted);
        assert_eq!(state, SessionLifecycle::None);
        assert_eq!(
            actions,
            vec![LifecycleAction::Emit(LifecycleNotice::Stopped {
                reason: StopReason::HostDissolved
            })]
        );
    }

    #[test]
    fn failed_setup_returns_to_none() {
        let (state, actions) = SessionLifecycle::Starting.on_event(LifecycleEvent::SetupFailed {
            error: "snapshot rejected".into(),
        });
        assert_eq!(state, SessionLifecycle::None);
        assert!(actions.iter().any(|a| matches!(
            a,
            LifecycleAction::Emit(LifecycleNotice::StartFailed { .. })
        )));
    }
}
