//! The activity model: replicated operations on a session.

use serde::{Deserialize, Serialize};

use crate::{ReferencePointId, ResourcePath, Role, SessionPath, Timestamp, UserId};

/// One atomic, immutable operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityKind {
    /// Replace `replaced_len` bytes at `offset` with `text`.
    TextEdit {
        /// File being edited.
        path: ResourcePath,
        /// Byte offset of the replaced range.
        offset: u64,
        /// Length of the replaced range.
        replaced_len: u64,
        /// Replacement bytes.
        text: String,
    },
    /// A file appeared with the given content.
    FileCreated {
        /// New file.
        path: ResourcePath,
        /// Initial content.
        content: Vec<u8>,
    },
    /// A file was deleted.
    FileDeleted {
        /// Deleted file.
        path: ResourcePath,
    },
    /// A file was moved or renamed.
    FileMoved {
        /// Old location.
        from: ResourcePath,
        /// New location.
        to: ResourcePath,
    },
    /// A folder was created.
    FolderCreated {
        /// New folder.
        path: ResourcePath,
    },
    /// A folder was deleted, along with its contents.
    FolderDeleted {
        /// Deleted folder.
        path: ResourcePath,
    },
    /// The host changed a participant's role.
    RoleChanged {
        /// Affected participant.
        user: UserId,
        /// The new role.
        role: Role,
    },
    /// A reference point joined the session, with its full content.
    ReferencePointAdded {
        /// Session handle of the new reference point.
        id: ReferencePointId,
        /// Human-readable name.
        name: String,
        /// Folders below the root, parents before children.
        folders: Vec<SessionPath>,
        /// Files and their bytes.
        files: Vec<(SessionPath, Vec<u8>)>,
    },
    /// An entry this build cannot interpret, kept verbatim.
    Unknown {
        /// Wire type tag.
        tag: String,
        /// Target, if the entry carried one.
        path: Option<ResourcePath>,
        /// Undecoded payload bytes.
        payload: Vec<u8>,
    },
}

impl ActivityKind {
    /// The resource this activity targets, if any.
    pub fn target(&self) -> Option<&ResourcePath> {
        match self {
            ActivityKind::TextEdit { path, .. }
            | ActivityKind::FileCreated { path, .. }
            | ActivityKind::FileDeleted { path }
            | ActivityKind::FolderCreated { path }
            | ActivityKind::FolderDeleted { path } => Some(path),
            ActivityKind::FileMoved { from, .. } => Some(from),
            ActivityKind::Unknown { path, .. } => path.as_ref(),
            ActivityKind::RoleChanged { .. } | ActivityKind::ReferencePointAdded { .. } => None,
        }
    }

    /// Whether only the host may originate this activity.
    pub fn is_host_only(&self) -> bool {
        matches!(self, ActivityKind::RoleChanged { .. })
    }

    /// Whether this activity changes the shared resource tree.
    pub fn touches_resources(&self) -> bool {
        !matches!(
            self,
            ActivityKind::RoleChanged { .. } | ActivityKind::Unknown { .. }
        )
    }
}

/// An activity together with the participant that originated it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    /// Originating participant.
    pub source: UserId,
    /// The operation.
    pub kind: ActivityKind,
}

impl Activity {
    /// Create an activity.
    pub fn new(source: UserId, kind: ActivityKind) -> Self {
        Self { source, kind }
    }
}

/// An activity stamped by the host's sequencer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedActivity {
    /// The activity.
    pub activity: Activity,
    /// Session-wide logical timestamp.
    pub timestamp: Timestamp,
}

impl TimedActivity {
    /// Stamp an activity.
    pub fn new(activity: Activity, timestamp: Timestamp) -> Self {
        Self {
            activity,
            timestamp,
        }
    }

    /// An activity that has not been sequenced yet.
    pub fn unsequenced(activity: Activity) -> Self {
        Self::new(activity, Timestamp::zero())
    }

    /// The duplicate-suppression key.
    pub fn key(&self) -> (&UserId, Timestamp) {
        (&self.activity.source, self.timestamp)
    }

    /// Originating participant.
    pub fn source(&self) -> &UserId {
        &self.activity.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserId {
        UserId::parse("alice@example.org/duet").unwrap()
    }

    fn file(name: &str) -> ResourcePath {
        ResourcePath::new(ReferencePointId::new(), SessionPath::parse(name).unwrap())
    }

    #[test]
    fn target_of_move_is_source_location() {
        let from = file("a.txt");
        let kind = ActivityKind::FileMoved {
            from: from.clone(),
            to: file("b.txt"),
        };
        assert_eq!(kind.target(), Some(&from));
    }

    #[test]
    fn role_change_is_host_only_and_has_no_target() {
        let kind = ActivityKind::RoleChanged {
            user: user(),
            role: Role::Driver,
        };
        assert!(kind.is_host_only());
        assert!(kind.target().is_none());
        assert!(!kind.touches_resources());
    }

    #[test]
    fn timed_activity_key() {
        let ta = TimedActivity::new(
            Activity::new(user(), ActivityKind::FolderCreated { path: file("d") }),
            Timestamp::new(7),
        );
        assert_eq!(ta.key(), (&user(), Timestamp::new(7)));
        assert!(!TimedActivity::unsequenced(ta.activity.clone())
            .timestamp
            .is_sequenced());
    }
}
