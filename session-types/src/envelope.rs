//! Batched activity envelope.
//!
//! On the wire a batch looks like:
//!
//! ```text
//! { version, session_id, base_timestamp,
//!   activities: [ { originator, timestamp_offset, tag, path?, payload } ] }
//! ```
//!
//! `base_timestamp` is the timestamp of the first activity; every entry
//! stores its distance from it. Unsequenced submissions use base 0 and
//! zero offsets.

use serde::{Deserialize, Serialize};

use crate::registry::EncodedActivity;
use crate::{
    Activity, ActivityRegistry, MalformedActivityError, ReferencePointId, ResourcePath,
    SessionId, SessionPath, TimedActivity, Timestamp, UserId, WireError,
};

/// Current envelope format version.
pub const PROTOCOL_VERSION: u8 = 1;

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    version: u8,
    session_id: SessionId,
    base_timestamp: u64,
    activities: Vec<WireEntry>,
}

#[derive(Serialize, Deserialize)]
struct WireEntry {
    originator: String,
    timestamp_offset: u64,
    tag: String,
    path: Option<WirePath>,
    #[serde(default)]
    payload: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct WirePath {
    reference_point: ReferencePointId,
    segments: Vec<String>,
}

/// A batch of timed activities for one session.
///
/// Two envelopes are equal when their activity lists are equal.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Session the batch belongs to.
    pub session_id: SessionId,
    /// Activities in session order.
    pub activities: Vec<TimedActivity>,
}

impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        self.activities == other.activities
    }
}

impl Eq for Envelope {}

impl Envelope {
    /// Create an envelope.
    pub fn new(session_id: SessionId, activities: Vec<TimedActivity>) -> Self {
        Self {
            session_id,
            activities,
        }
    }

    /// Timestamp of the first activity, zero for an empty batch.
    pub fn base_timestamp(&self) -> Timestamp {
        self.activities
            .first()
            .map(|a| a.timestamp)
            .unwrap_or_default()
    }

    /// Encode with the given registry.
    pub fn encode(&self, registry: &ActivityRegistry) -> Result<Vec<u8>, WireError> {
        let base = self.base_timestamp().value();
        let mut activities = Vec::with_capacity(self.activities.len());
        for timed in &self.activities {
            let timestamp_offset = timed.timestamp.value().checked_sub(base).ok_or_else(|| {
                WireError::InvalidData(format!(
                    "timestamp {} precedes batch base {base}",
                    timed.timestamp
                ))
            })?;
            let encoded = registry.encode(&timed.activity.kind)?;
            activities.push(WireEntry {
                originator: timed.activity.source.to_string(),
                timestamp_offset,
                tag: encoded.tag,
                path: encoded.path.map(|p| WirePath {
                    reference_point: p.reference_point,
                    segments: p.path.into(),
                }),
                payload: encoded.payload,
            });
        }
        let wire = WireEnvelope {
            version: PROTOCOL_VERSION,
            session_id: self.session_id,
            base_timestamp: base,
            activities,
        };
        rmp_serde::to_vec_named(&wire).map_err(WireError::Serialization)
    }

    /// Decode with the given registry.
    ///
    /// Entries with unregistered tags are preserved as
    /// [`ActivityKind::Unknown`](crate::ActivityKind::Unknown).
    pub fn decode(bytes: &[u8], registry: &ActivityRegistry) -> Result<Self, WireError> {
        let wire: WireEnvelope = rmp_serde::from_slice(bytes)
            .map_err(|e| MalformedActivityError::Envelope(e.to_string()))?;
        if wire.version != PROTOCOL_VERSION {
            return Err(WireError::UnsupportedVersion(wire.version));
        }

        let mut activities = Vec::with_capacity(wire.activities.len());
        for (index, entry) in wire.activities.into_iter().enumerate() {
            let tag = entry.tag.clone();
            let malformed = |reason: String| MalformedActivityError::Entry {
                index,
                tag: tag.clone(),
                reason,
            };

            let source = UserId::parse(entry.originator).map_err(|e| malformed(e.to_string()))?;
            let timestamp = wire
                .base_timestamp
                .checked_add(entry.timestamp_offset)
                .map(Timestamp::new)
                .ok_or_else(|| malformed("timestamp overflow".into()))?;
            let path = match entry.path {
                Some(raw) => {
                    let path = SessionPath::from_segments(raw.segments)
                        .map_err(|e| malformed(e.to_string()))?;
                    Some(ResourcePath::new(raw.reference_point, path))
                }
                None => None,
            };
            let kind = registry
                .decode(EncodedActivity {
                    tag: entry.tag,
                    path,
                    payload: entry.payload,
                })
                .map_err(malformed)?;

            activities.push(TimedActivity::new(Activity::new(source, kind), timestamp));
        }

        Ok(Self {
            session_id: wire.session_id,
            activities,
        })
    }
}
