//! Error types for the Duet wire format.

use thiserror::Error;

/// Errors that can occur while encoding or decoding wire data.
#[derive(Debug, Error)]
pub enum WireError {
    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// An activity batch could not be interpreted
    #[error(transparent)]
    Malformed(#[from] MalformedActivityError),

    /// Invalid protocol version
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Invalid data format
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// A participant address is not a valid JID
    #[error("invalid user id: {0:?}")]
    InvalidUserId(String),

    /// A resource path is not a valid reference-point-relative path
    #[error(transparent)]
    InvalidPath(#[from] PathError),
}

/// An activity batch, or one entry of it, could not be decoded.
///
/// Entries with an unknown type tag are *not* malformed; they are kept
/// verbatim so they survive re-serialization.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedActivityError {
    /// The envelope itself is missing required fields or is truncated.
    #[error("malformed activity envelope: {0}")]
    Envelope(String),

    /// A known activity type carried a payload that does not decode.
    #[error("malformed activity #{index} ({tag}): {reason}")]
    Entry {
        /// Position of the entry inside the batch.
        index: usize,
        /// The activity type tag.
        tag: String,
        /// What was wrong with it.
        reason: String,
    },
}

/// A reference-point-relative path was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    /// Absolute paths cannot be shared.
    #[error("path must be relative to a reference point: {0:?}")]
    Absolute(String),

    /// Empty segments (`a//b`) are not allowed.
    #[error("path contains an empty segment: {0:?}")]
    EmptySegment(String),

    /// `.` and `..` would escape or alias the reference point.
    #[error("path contains a relative segment {0:?}")]
    DotSegment(String),

    /// A segment contains a separator or NUL.
    #[error("invalid character in path segment {0:?}")]
    InvalidCharacter(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = WireError::UnsupportedVersion(9);
        assert_eq!(err.to_string(), "unsupported protocol version: 9");
    }

    #[test]
    fn malformed_entry_display_names_tag() {
        let err = MalformedActivityError::Entry {
            index: 2,
            tag: "edit".into(),
            reason: "missing path".into(),
        };
        assert_eq!(err.to_string(), "malformed activity #2 (edit): missing path");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<WireError>();
        assert_send_sync::<MalformedActivityError>();
    }
}
