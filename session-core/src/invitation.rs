//! Pending invitations with deadlines.

use session_types::{InvitationId, UserId};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::InvitationError;

/// An invitation waiting for an answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInvitation {
    /// Invitation handle.
    pub id: InvitationId,
    /// Who was invited.
    pub invitee: UserId,
    /// Who invited.
    pub inviter: UserId,
    /// When the invitation lapses.
    pub deadline: Instant,
}

/// How an invitation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvitationOutcome {
    /// The invitee joined.
    Accepted,
    /// The invitee said no.
    Declined {
        /// Reason given by the invitee.
        reason: String,
    },
    /// No answer before the deadline.
    Expired,
}

/// Invitations issued and not yet answered.
///
/// Answering or expiring an invitation only removes it; the inviter's
/// session is otherwise untouched.
#[derive(Debug)]
pub struct Invitations {
    pending: HashMap<InvitationId, PendingInvitation>,
    timeout: Duration,
}

impl Invitations {
    /// Create an empty table with the given answer timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            timeout,
        }
    }

    /// Issue a new invitation.
    pub fn issue(
        &mut self,
        invitee: UserId,
        inviter: UserId,
        now: Instant,
    ) -> Result<InvitationId, InvitationError> {
        let id = InvitationId::new();
        self.register(id, invitee, inviter, now)?;
        Ok(id)
    }

    /// Track an invitation issued elsewhere (a driver's, seen by the host).
    pub fn register(
        &mut self,
        id: InvitationId,
        invitee: UserId,
        inviter: UserId,
        now: Instant,
    ) -> Result<(), InvitationError> {
        if self.is_pending_for(&invitee) {
            return Err(InvitationError::AlreadyInvited(invitee));
        }
        self.pending.insert(
            id,
            PendingInvitation {
                id,
                invitee,
                inviter,
                deadline: now + self.timeout,
            },
        );
        Ok(())
    }

    /// Remove an answered invitation.
    pub fn resolve(&mut self, id: &InvitationId) -> Option<PendingInvitation> {
        self.pending.remove(id)
    }

    /// Look at a pending invitation.
    pub fn get(&self, id: &InvitationId) -> Option<&PendingInvitation> {
        self.pending.get(id)
    }

    /// Remove and return every invitation past its deadline.
    pub fn expire(&mut self, now: Instant) -> Vec<PendingInvitation> {
        let expired: Vec<InvitationId> = self
            .pending
            .values()
            .filter(|inv| inv.deadline <= now)
            .map(|inv| inv.id)
            .collect();
        expired
            .iter()
            .filter_map(|id| self.pending.remove(id))
            .collect()
    }

    /// Whether `invitee` has an open invitation.
    pub fn is_pending_for(&self, invitee: &UserId) -> bool {
        self.pending.values().any(|inv| &inv.invitee == invitee)
    }

    /// Earliest deadline among pending invitations.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|inv| inv.deadline).min()
    }

    /// Number of pending invitations.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Check if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
