//! Participants, roles and the permission rules around them.
//!
//! There is exactly one host per session. It is fixed when the session is
//! created and never changes role, leaves the set, or gets demoted.

use session_types::{ActivityKind, ParticipantInfo, Role, UserId};

use crate::error::{MembershipError, PermissionError};

/// Session-wide rules that are not implied by roles alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    /// Whether drivers may invite new participants.
    pub allow_driver_invites: bool,
}

impl SessionPolicy {
    /// Role assigned to a participant who accepts an invitation.
    pub const JOINER_ROLE: Role = Role::Observer;
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            allow_driver_invites: true,
        }
    }
}

/// A session member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    /// Network address.
    pub user: UserId,
    /// Current role.
    pub role: Role,
}

impl From<&Participant> for ParticipantInfo {
    fn from(p: &Participant) -> Self {
        ParticipantInfo {
            user: p.user.clone(),
            role: p.role,
        }
    }
}

/// The participant set, in join order. The host is always first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participants {
    members: Vec<Participant>,
}

impl Participants {
    /// A fresh set containing only the host.
    pub fn new(host: UserId) -> Self {
        Self {
            members: vec![Participant {
                user: host,
                role: Role::Host,
            }],
        }
    }

    /// Rebuild the set from a host snapshot.
    pub fn from_snapshot(
        host: &UserId,
        snapshot: &[ParticipantInfo],
    ) -> Result<Self, MembershipError> {
        let hosts: Vec<_> = snapshot.iter().filter(|p| p.role.is_host()).collect();
        if hosts.len() != 1 || &hosts[0].user != host {
            return Err(MembershipError::InvalidSnapshot);
        }
        let mut set = Self::new(host.clone());
        for info in snapshot.iter().filter(|p| !p.role.is_host()) {
            set.add(info.user.clone(), info.role)?;
        }
        Ok(set)
    }

    /// The host.
    pub fn host(&self) -> &UserId {
        &self.members[0].user
    }

    /// Add a non-host participant.
    pub fn add(&mut self, user: UserId, role: Role) -> Result<(), MembershipError> {
        if role.is_host() {
            return Err(MembershipError::HostImmutable);
        }
        if self.contains(&user) {
            return Err(MembershipError::AlreadyMember(user));
        }
        self.members.push(Participant { user, role });
        Ok(())
    }

    /// Remove a non-host participant.
    pub fn remove(&mut self, user: &UserId) -> Result<Participant, MembershipError> {
        if user == self.host() {
            return Err(MembershipError::HostImmutable);
        }
        let index = self
            .members
            .iter()
            .position(|p| &p.user == user)
            .ok_or_else(|| MembershipError::NotMember(user.clone()))?;
        Ok(self.members.remove(index))
    }

    /// Whether `user` is a participant.
    pub fn contains(&self, user: &UserId) -> bool {
        self.members.iter().any(|p| &p.user == user)
    }

    /// Role of `user`, if a participant.
    pub fn role(&self, user: &UserId) -> Option<Role> {
        self.members.iter().find(|p| &p.user == user).map(|p| p.role)
    }

    /// Participants in join order.
    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.members.iter()
    }

    /// Everyone except `user`.
    pub fn others<'a>(&'a self, user: &'a UserId) -> impl Iterator<Item = &'a UserId> + 'a {
        self.members
            .iter()
            .map(|p| &p.user)
            .filter(move |u| *u != user)
    }

    /// Number of participants, host included.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Never true; a session always has its host.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Snapshot for the wire.
    pub fn to_info(&self) -> Vec<ParticipantInfo> {
        self.members.iter().map(ParticipantInfo::from).collect()
    }

    /// Check that `actor` may set `target`'s role to `role`.
    pub fn check_role_change(
        &self,
        actor: &UserId,
        target: &UserId,
        role: Role,
    ) -> Result<(), MembershipError> {
        if actor != self.host() {
            return Err(PermissionError::NotHost {
                operation: "change roles",
            }
            .into());
        }
        if target == self.host() || role.is_host() {
            return Err(PermissionError::HostRoleImmutable.into());
        }
        if !self.contains(target) {
            return Err(MembershipError::NotMember(target.clone()));
        }
        Ok(())
    }

    /// Apply a sequenced role change, returning the previous role.
    pub fn apply_role_change(&mut self, target: &UserId, role: Role) -> Result<Role, MembershipError> {
        if target == self.host() || role.is_host() {
            return Err(MembershipError::HostImmutable);
        }
        let member = self
            .members
            .iter_mut()
            .find(|p| &p.user == target)
            .ok_or_else(|| MembershipError::NotMember(target.clone()))?;
        Ok(std::mem::replace(&mut member.role, role))
    }

    /// Check that `user` may modify shared resources.
    pub fn check_write_access(&self, user: &UserId) -> Result<(), PermissionError> {
        match self.role(user) {
            Some(role) if role.has_write_access() => Ok(()),
            Some(_) => Err(PermissionError::ReadOnly(user.clone())),
            None => Err(PermissionError::NotParticipant(user.clone())),
        }
    }

    /// Check that `user` may invite under `policy`.
    pub fn check_can_invite(
        &self,
        user: &UserId,
        policy: &SessionPolicy,
    ) -> Result<(), PermissionError> {
        match self.role(user) {
            Some(Role::Host) => Ok(()),
            Some(Role::Driver) if policy.allow_driver_invites => Ok(()),
            Some(Role::Driver) => Err(PermissionError::InvitesNotAllowed),
            Some(Role::Observer) => Err(PermissionError::ReadOnly(user.clone())),
            None => Err(PermissionError::NotParticipant(user.clone())),
        }
    }

    /// Check that `user` may originate an activity of this kind.
    ///
    /// Every activity needs write access, including unknown kinds: a build
    /// that cannot interpret an entry cannot vouch that it is read-only.
    pub fn check_origination(
        &self,
        user: &UserId,
        kind: &ActivityKind,
    ) -> Result<(), PermissionError> {
        if kind.is_host_only() && user != self.host() {
            return Err(PermissionError::NotHost {
                operation: "change roles",
            });
        }
        self.check_write_access(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use session_types::{ReferencePointId, ResourcePath, SessionPath};

    fn user(name: &str) -> UserId {
        UserId::parse(format!("{name}@example.org/duet")).unwrap()
    }

    fn session() -> Participants {
        let mut p = Participants::new(user("host"));
        p.add(user("dora"), Role::Driver).unwrap();
        p.add(user("otto"), Role::Observer).unwrap();
        p
    }

    fn edit() -> ActivityKind {
        ActivityKind::FileDeleted {
            path: ResourcePath::new(ReferencePointId::new(), SessionPath::parse("a").unwrap()),
        }
    }

    fn host_count(p: &Participants) -> usize {
        p.iter().filter(|m| m.role.is_host()).count()
    }

    #[test]
    fn host_is_first_and_unique() {
        let p = session();
        assert_eq!(p.host(), &user("host"));
        assert_eq!(p.role(&user("host")), Some(Role::Host));
        assert_eq!(host_count(&p), 1);
        let order: Vec<_> = p.iter().map(|m| m.user.clone()).collect();
        assert_eq!(order, vec![user("host"), user("dora"), user("otto")]);
    }

    #[test]
    fn cannot_add_second_host_or_duplicate() {
        let mut p = session();
        assert_eq!(
            p.add(user("eve"), Role::Host),
            Err(MembershipError::HostImmutable)
        );
        assert_eq!(
            p.add(user("dora"), Role::Observer),
            Err(MembershipError::AlreadyMember(user("dora")))
        );
    }

    #[test]
    fn host_cannot_be_removed() {
        let mut p = session();
        assert_eq!(p.remove(&user("host")), Err(MembershipError::HostImmutable));
        assert!(p.remove(&user("otto")).is_ok());
        assert_eq!(
            p.remove(&user("otto")),
            Err(MembershipError::NotMember(user("otto")))
        );
    }

    #[test]
    fn only_host_changes_roles() {
        let p = session();
        assert!(p
            .check_role_change(&user("host"), &user("otto"), Role::Driver)
            .is_ok());
        assert!(matches!(
            p.check_role_change(&user("dora"), &user("otto"), Role::Driver),
            Err(MembershipError::Permission(PermissionError::NotHost { .. }))
        ));
    }

    #[test]
    fn host_role_is_immutable() {
        let mut p = session();
        assert!(matches!(
            p.check_role_change(&user("host"), &user("host"), Role::Observer),
            Err(MembershipError::Permission(PermissionError::HostRoleImmutable))
        ));
        assert!(matches!(
            p.check_role_change(&user("host"), &user("dora"), Role::Host),
            Err(MembershipError::Permission(PermissionError::HostRoleImmutable))
        ));
        assert_eq!(
            p.apply_role_change(&user("host"), Role::Observer),
            Err(MembershipError::HostImmutable)
        );
    }

    #[test]
    fn exactly_one_host_after_any_role_changes() {
        let mut p = session();
        let targets = [user("host"), user("dora"), user("otto")];
        let roles = [Role::Host, Role::Driver, Role::Observer];
        for (i, target) in targets.iter().cycle().take(12).enumerate() {
            let _ = p.apply_role_change(target, roles[i % 3]);
            assert_eq!(host_count(&p), 1);
            assert_eq!(p.role(&user("host")), Some(Role::Host));
        }
    }

    #[test]
    fn apply_role_change_returns_previous() {
        let mut p = session();
        assert_eq!(
            p.apply_role_change(&user("otto"), Role::Driver),
            Ok(Role::Observer)
        );
        assert_eq!(p.role(&user("otto")), Some(Role::Driver));
    }

    #[test]
    fn observer_cannot_originate_edits() {
        let p = session();
        assert_eq!(
            p.check_origination(&user("otto"), &edit()),
            Err(PermissionError::ReadOnly(user("otto")))
        );
        assert!(p.check_origination(&user("dora"), &edit()).is_ok());
        assert!(p.check_origination(&user("host"), &edit()).is_ok());
    }

    #[test]
    fn observers_cannot_originate_unknown_kinds() {
        let p = session();
        let kind = ActivityKind::Unknown {
            tag: "cursor".into(),
            path: None,
            payload: vec![1, 2],
        };
        assert_eq!(
            p.check_origination(&user("otto"), &kind),
            Err(PermissionError::ReadOnly(user("otto")))
        );
        assert!(p.check_origination(&user("dora"), &kind).is_ok());
        assert_eq!(
            p.check_origination(&user("mallory"), &kind),
            Err(PermissionError::NotParticipant(user("mallory")))
        );
    }

    #[test]
    fn drivers_cannot_originate_role_changes() {
        let p = session();
        let kind = ActivityKind::RoleChanged {
            user: user("otto"),
            role: Role::Driver,
        };
        assert!(matches!(
            p.check_origination(&user("dora"), &kind),
            Err(PermissionError::NotHost { .. })
        ));
    }

    #[test]
    fn invite_policy() {
        let p = session();
        let open = SessionPolicy::default();
        let closed = SessionPolicy {
            allow_driver_invites: false,
        };
        assert!(p.check_can_invite(&user("host"), &closed).is_ok());
        assert!(p.check_can_invite(&user("dora"), &open).is_ok());
        assert_eq!(
            p.check_can_invite(&user("dora"), &closed),
            Err(PermissionError::InvitesNotAllowed)
        );
        assert!(matches!(
            p.check_can_invite(&user("otto"), &open),
            Err(PermissionError::ReadOnly(_))
        ));
        assert!(matches!(
            p.check_can_invite(&user("nobody"), &open),
            Err(PermissionError::NotParticipant(_))
        ));
    }

    #[test]
    fn snapshot_roundtrip() {
        let p = session();
        let restored = Participants::from_snapshot(&user("host"), &p.to_info()).unwrap();
        assert_eq!(restored, p);
    }

    #[test]
    fn snapshot_with_wrong_host_rejected() {
        let p = session();
        assert_eq!(
            Participants::from_snapshot(&user("dora"), &p.to_info()),
            Err(MembershipError::InvalidSnapshot)
        );
    }

    #[test]
    fn others_excludes_self() {
        let p = session();
        let me = user("dora");
        let others: Vec<_> = p.others(&me).cloned().collect();
        assert_eq!(others, vec![user("host"), user("otto")]);
    }
}
