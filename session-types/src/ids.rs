//! Identity and ordering types for Duet sessions.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::WireError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(uuid::Uuid);

        impl $name {
            /// Create a new random identifier.
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            /// Create an identifier from raw bytes.
            pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
                uuid::Uuid::from_slice(bytes).ok().map(Self)
            }

            /// Get the raw bytes of this identifier.
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.0.to_string()[..8])
            }
        }
    };
}

uuid_id!(
    /// A unique identifier for one collaborative session.
    SessionId
);

uuid_id!(
    /// A unique identifier for a pending invitation.
    InvitationId
);

uuid_id!(
    /// A unique identifier for a bulk transfer on a byte-stream channel.
    TransferId
);

uuid_id!(
    /// Session-scoped handle of a shared reference point.
    ///
    /// Opaque: it never encodes a host path.
    ReferencePointId
);

/// A participant's network address (a JID such as `alice@example.org/duet`).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    /// Parse and validate a JID of the form `local@domain[/resource]`.
    pub fn parse(jid: impl Into<String>) -> Result<Self, WireError> {
        let jid = jid.into();
        let bare = jid.split('/').next().unwrap_or_default();
        let valid = match bare.split_once('@') {
            Some((local, domain)) => {
                !local.is_empty() && !domain.is_empty() && !domain.contains('@')
            }
            None => false,
        };
        if !valid || jid.chars().any(char::is_whitespace) || jid.ends_with('/') {
            return Err(WireError::InvalidUserId(jid));
        }
        Ok(Self(jid))
    }

    /// The full address as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The address without its resource part.
    pub fn bare(&self) -> &str {
        match self.0.split_once('/') {
            Some((bare, _)) => bare,
            None => &self.0,
        }
    }
}

impl TryFrom<String> for UserId {
    type Error = WireError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> Self {
        id.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", self.0)
    }
}

/// Session-wide logical timestamp assigned by the host's sequencer.
///
/// Sequenced activities start at 1; 0 marks an activity that has not
/// been sequenced yet.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Create a timestamp with the given value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// The unsequenced marker.
    pub fn zero() -> Self {
        Self(0)
    }

    /// The first timestamp a sequencer hands out.
    pub fn first() -> Self {
        Self(1)
    }

    /// Get the raw value.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// Whether the sequencer has stamped this value.
    pub fn is_sequenced(&self) -> bool {
        self.0 != 0
    }

    /// Get the next timestamp.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}
