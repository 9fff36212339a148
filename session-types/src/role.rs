//! Participant roles.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What a participant may do inside a session.
///
/// The host is always a driver; its role never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Started the session and sequences every activity.
    Host,
    /// Read-write participant.
    Driver,
    /// Read-only participant.
    Observer,
}

impl Role {
    /// Whether this role may originate editing activities.
    pub fn has_write_access(&self) -> bool {
        matches!(self, Role::Host | Role::Driver)
    }

    /// Whether this is the host role.
    pub fn is_host(&self) -> bool {
        matches!(self, Role::Host)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Host => "host",
            Role::Driver => "driver",
            Role::Observer => "observer",
        };
        f.write_str(name)
    }
}
