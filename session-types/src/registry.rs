//! Immutable mapping from activity type tag to codec.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::{ActivityKind, ReferencePointId, ResourcePath, Role, SessionPath, UserId, WireError};

/// Wire type tags of the built-in activities.
pub mod tags {
    /// [`ActivityKind::TextEdit`](crate::ActivityKind::TextEdit)
    pub const TEXT_EDIT: &str = "edit";
    /// [`ActivityKind::FileCreated`](crate::ActivityKind::FileCreated)
    pub const FILE_CREATED: &str = "file.create";
    /// [`ActivityKind::FileDeleted`](crate::ActivityKind::FileDeleted)
    pub const FILE_DELETED: &str = "file.delete";
    /// [`ActivityKind::FileMoved`](crate::ActivityKind::FileMoved)
    pub const FILE_MOVED: &str = "file.move";
    /// [`ActivityKind::FolderCreated`](crate::ActivityKind::FolderCreated)
    pub const FOLDER_CREATED: &str = "folder.create";
    /// [`ActivityKind::FolderDeleted`](crate::ActivityKind::FolderDeleted)
    pub const FOLDER_DELETED: &str = "folder.delete";
    /// [`ActivityKind::RoleChanged`](crate::ActivityKind::RoleChanged)
    pub const ROLE_CHANGED: &str = "role.change";
    /// [`ActivityKind::ReferencePointAdded`](crate::ActivityKind::ReferencePointAdded)
    pub const REFERENCE_POINT_ADDED: &str = "refpoint.add";
}

/// Encodes an activity's payload.
pub type EncodeFn = fn(&ActivityKind) -> Result<Vec<u8>, String>;

/// Rebuilds an activity from its target path and payload.
pub type DecodeFn = fn(Option<ResourcePath>, &[u8]) -> Result<ActivityKind, String>;

/// Payload codec for one activity type.
#[derive(Clone, Copy)]
pub struct ActivityCodec {
    /// Payload encoder.
    pub encode: EncodeFn,
    /// Payload decoder.
    pub decode: DecodeFn,
}

/// One encoded entry, before it is placed in an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EncodedActivity {
    pub tag: String,
    pub path: Option<ResourcePath>,
    pub payload: Vec<u8>,
}

/// Tag → codec table.
///
/// Built once at startup and shared by reference; there is no way to
/// register a codec on an existing registry.
#[derive(Clone)]
pub struct ActivityRegistry {
    codecs: HashMap<&'static str, ActivityCodec>,
}

impl ActivityRegistry {
    /// Build a registry from an explicit codec list.
    pub fn with_codecs(codecs: impl IntoIterator<Item = (&'static str, ActivityCodec)>) -> Self {
        Self {
            codecs: codecs.into_iter().collect(),
        }
    }

    /// Registry with every built-in activity type.
    pub fn standard() -> Self {
        Self::with_codecs([
            (
                tags::TEXT_EDIT,
                ActivityCodec {
                    encode: encode_text_edit,
                    decode: decode_text_edit,
                },
            ),
            (
                tags::FILE_CREATED,
                ActivityCodec {
                    encode: encode_file_created,
                    decode: decode_file_created,
                },
            ),
            (
                tags::FILE_DELETED,
                ActivityCodec {
                    encode: encode_empty,
                    decode: decode_file_deleted,
                },
            ),
            (
                tags::FILE_MOVED,
                ActivityCodec {
                    encode: encode_file_moved,
                    decode: decode_file_moved,
                },
            ),
            (
                tags::FOLDER_CREATED,
                ActivityCodec {
                    encode: encode_empty,
                    decode: decode_folder_created,
                },
            ),
            (
                tags::FOLDER_DELETED,
                ActivityCodec {
                    encode: encode_empty,
                    decode: decode_folder_deleted,
                },
            ),
            (
                tags::ROLE_CHANGED,
                ActivityCodec {
                    encode: encode_role_changed,
                    decode: decode_role_changed,
                },
            ),
            (
                tags::REFERENCE_POINT_ADDED,
                ActivityCodec {
                    encode: encode_reference_point_added,
                    decode: decode_reference_point_added,
                },
            ),
        ])
    }

    /// A copy of this registry without `tag`, as an older build would have it.
    pub fn without(mut self, tag: &str) -> Self {
        self.codecs.remove(tag);
        self
    }

    /// Whether a codec exists for `tag`.
    pub fn knows(&self, tag: &str) -> bool {
        self.codecs.contains_key(tag)
    }

    /// Wire tag of a built-in kind, or the preserved tag of an unknown one.
    pub fn tag_of(kind: &ActivityKind) -> &str {
        match kind {
            ActivityKind::TextEdit { .. } => tags::TEXT_EDIT,
            ActivityKind::FileCreated { .. } => tags::FILE_CREATED,
            ActivityKind::FileDeleted { .. } => tags::FILE_DELETED,
            ActivityKind::FileMoved { .. } => tags::FILE_MOVED,
            ActivityKind::FolderCreated { .. } => tags::FOLDER_CREATED,
            ActivityKind::FolderDeleted { .. } => tags::FOLDER_DELETED,
            ActivityKind::RoleChanged { .. } => tags::ROLE_CHANGED,
            ActivityKind::ReferencePointAdded { .. } => tags::REFERENCE_POINT_ADDED,
            ActivityKind::Unknown { tag, .. } => tag,
        }
    }

    pub(crate) fn encode(&self, kind: &ActivityKind) -> Result<EncodedActivity, WireError> {
        if let ActivityKind::Unknown { tag, path, payload } = kind {
            return Ok(EncodedActivity {
                tag: tag.clone(),
                path: path.clone(),
                payload: payload.clone(),
            });
        }
        let tag = Self::tag_of(kind);
        let codec = self
            .codecs
            .get(tag)
            .ok_or_else(|| WireError::InvalidData(format!("no codec registered for {tag:?}")))?;
        let payload = (codec.encode)(kind).map_err(WireError::InvalidData)?;
        Ok(EncodedActivity {
            tag: tag.to_string(),
            path: kind.target().cloned(),
            payload,
        })
    }

    /// Decode one entry. Unregistered tags come back as
    /// [`ActivityKind::Unknown`]; a failing codec yields the reason.
    pub(crate) fn decode(&self, entry: EncodedActivity) -> Result<ActivityKind, String> {
        match self.codecs.get(entry.tag.as_str()) {
            Some(codec) => (codec.decode)(entry.path, &entry.payload),
            None => Ok(ActivityKind::Unknown {
                tag: entry.tag,
                path: entry.path,
                payload: entry.payload,
            }),
        }
    }
}

impl fmt::Debug for ActivityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<_> = self.codecs.keys().collect();
        tags.sort();
        f.debug_struct("ActivityRegistry").field("tags", &tags).finish()
    }
}

// ===== Built-in codecs =====

#[derive(Serialize, Deserialize)]
struct TextEditPayload {
    offset: u64,
    replaced_len: u64,
    text: String,
}

#[derive(Serialize, Deserialize)]
struct FileCreatedPayload {
    content: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct FileMovedPayload {
    to: ResourcePath,
}

#[derive(Serialize, Deserialize)]
struct RoleChangedPayload {
    user: UserId,
    role: Role,
}

#[derive(Serialize, Deserialize)]
struct ReferencePointAddedPayload {
    id: ReferencePointId,
    name: String,
    folders: Vec<SessionPath>,
    files: Vec<(SessionPath, Vec<u8>)>,
}

fn pack<T: Serialize>(value: &T) -> Result<Vec<u8>, String> {
    rmp_serde::to_vec_named(value).map_err(|e| e.to_string())
}

fn unpack<T: DeserializeOwned>(payload: &[u8]) -> Result<T, String> {
    rmp_serde::from_slice(payload).map_err(|e| e.to_string())
}

fn require_path(path: Option<ResourcePath>) -> Result<ResourcePath, String> {
    path.ok_or_else(|| "missing target path".to_string())
}

fn mismatch() -> String {
    "codec does not handle this activity kind".to_string()
}

fn encode_empty(_: &ActivityKind) -> Result<Vec<u8>, String> {
    Ok(Vec::new())
}

fn encode_text_edit(kind: &ActivityKind) -> Result<Vec<u8>, String> {
    match kind {
        ActivityKind::TextEdit {
            offset,
            replaced_len,
            text,
            ..
        } => pack(&TextEditPayload {
            offset: *offset,
            replaced_len: *replaced_len,
            text: text.clone(),
        }),
        _ => Err(mismatch()),
    }
}

fn decode_text_edit(path: Option<ResourcePath>, payload: &[u8]) -> Result<ActivityKind, String> {
    let path = require_path(path)?;
    let p: TextEditPayload = unpack(payload)?;
    Ok(ActivityKind::TextEdit {
        path,
        offset: p.offset,
        replaced_len: p.replaced_len,
        text: p.text,
    })
}

fn encode_file_created(kind: &ActivityKind) -> Result<Vec<u8>, String> {
    match kind {
        ActivityKind::FileCreated { content, .. } => pack(&FileCreatedPayload {
            content: content.clone(),
        }),
        _ => Err(mismatch()),
    }
}

fn decode_file_created(path: Option<ResourcePath>, payload: &[u8]) -> Result<ActivityKind, String> {
    let path = require_path(path)?;
    let p: FileCreatedPayload = unpack(payload)?;
    Ok(ActivityKind::FileCreated {
        path,
        content: p.content,
    })
}

fn decode_file_deleted(path: Option<ResourcePath>, _: &[u8]) -> Result<ActivityKind, String> {
    Ok(ActivityKind::FileDeleted {
        path: require_path(path)?,
    })
}

fn encode_file_moved(kind: &ActivityKind) -> Result<Vec<u8>, String> {
    match kind {
        ActivityKind::FileMoved { to, .. } => pack(&FileMovedPayload { to: to.clone() }),
        _ => Err(mismatch()),
    }
}

fn decode_file_moved(path: Option<ResourcePath>, payload: &[u8]) -> Result<ActivityKind, String> {
    let from = require_path(path)?;
    let p: FileMovedPayload = unpack(payload)?;
    Ok(ActivityKind::FileMoved { from, to: p.to })
}

fn decode_folder_created(path: Option<ResourcePath>, _: &[u8]) -> Result<ActivityKind, String> {
    Ok(ActivityKind::FolderCreated {
        path: require_path(path)?,
    })
}

fn decode_folder_deleted(path: Option<ResourcePath>, _: &[u8]) -> Result<ActivityKind, String> {
    Ok(ActivityKind::FolderDeleted {
        path: require_path(path)?,
    })
}

fn encode_role_changed(kind: &ActivityKind) -> Result<Vec<u8>, String> {
    match kind {
        ActivityKind::RoleChanged { user, role } => pack(&RoleChangedPayload {
            user: user.clone(),
            role: *role,
        }),
        _ => Err(mismatch()),
    }
}

fn decode_role_changed(_: Option<ResourcePath>, payload: &[u8]) -> Result<ActivityKind, String> {
    let p: RoleChangedPayload = unpack(payload)?;
    Ok(ActivityKind::RoleChanged {
        user: p.user,
        role: p.role,
    })
}

fn encode_reference_point_added(kind: &ActivityKind) -> Result<Vec<u8>, String> {
    match kind {
        ActivityKind::ReferencePointAdded {
            id,
            name,
            folders,
            files,
        } => pack(&ReferencePointAddedPayload {
            id: *id,
            name: name.clone(),
            folders: folders.clone(),
            files: files.clone(),
        }),
        _ => Err(mismatch()),
    }
}

fn decode_reference_point_added(
    _: Option<ResourcePath>,
    payload: &[u8],
) -> Result<ActivityKind, String> {
    let p: ReferencePointAddedPayload = unpack(payload)?;
    Ok(ActivityKind::ReferencePointAdded {
        id: p.id,
        name: p.name,
        folders: p.folders,
        files: p.files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str) -> ResourcePath {
        ResourcePath::new(ReferencePointId::new(), SessionPath::parse(name).unwrap())
    }

    fn roundtrip(registry: &ActivityRegistry, kind: &ActivityKind) -> ActivityKind {
        let encoded = registry.encode(kind).unwrap();
        registry.decode(encoded).unwrap()
    }

    #[test]
    fn standard_registry_knows_builtin_tags() {
        let registry = ActivityRegistry::standard();
        for tag in [
            tags::TEXT_EDIT,
            tags::FILE_CREATED,
            tags::FILE_DELETED,
            tags::FILE_MOVED,
            tags::FOLDER_CREATED,
            tags::FOLDER_DELETED,
            tags::ROLE_CHANGED,
            tags::REFERENCE_POINT_ADDED,
        ] {
            assert!(registry.knows(tag), "missing {tag}");
        }
    }

    #[test]
    fn text_edit_carries_path_outside_payload() {
        let registry = ActivityRegistry::standard();
        let kind = ActivityKind::TextEdit {
            path: file("src/lib.rs"),
            offset: 3,
            replaced_len: 1,
            text: "xyz".into(),
        };
        let encoded = registry.encode(&kind).unwrap();
        assert_eq!(encoded.tag, tags::TEXT_EDIT);
        assert_eq!(encoded.path.as_ref(), kind.target());
        assert_eq!(registry.decode(encoded).unwrap(), kind);
    }

    #[test]
    fn move_keeps_both_ends() {
        let registry = ActivityRegistry::standard();
        let kind = ActivityKind::FileMoved {
            from: file("a.txt"),
            to: file("b/a.txt"),
        };
        assert_eq!(roundtrip(&registry, &kind), kind);
    }

    #[test]
    fn reference_point_added_roundtrip() {
        let registry = ActivityRegistry::standard();
        let kind = ActivityKind::ReferencePointAdded {
            id: ReferencePointId::new(),
            name: "project".into(),
            folders: vec![SessionPath::parse("src").unwrap()],
            files: vec![(SessionPath::parse("src/a.rs").unwrap(), b"fn a() {}".to_vec())],
        };
        assert_eq!(roundtrip(&registry, &kind), kind);
    }

    #[test]
    fn unregistered_tag_decodes_as_unknown() {
        let newer = ActivityRegistry::standard();
        let older = ActivityRegistry::standard().without(tags::TEXT_EDIT);
        let kind = ActivityKind::TextEdit {
            path: file("x"),
            offset: 0,
            replaced_len: 0,
            text: "hi".into(),
        };
        let encoded = newer.encode(&kind).unwrap();
        let decoded = older.decode(encoded.clone()).unwrap();
        match &decoded {
            ActivityKind::Unknown { tag, path, payload } => {
                assert_eq!(tag, tags::TEXT_EDIT);
                assert_eq!(path.as_ref(), encoded.path.as_ref());
                assert_eq!(payload, &encoded.payload);
            }
            other => panic!("expected Unknown, got {other:?}"),
        }
        // An older build re-emits the entry byte for byte.
        assert_eq!(older.encode(&decoded).unwrap(), encoded);
    }

    #[test]
    fn bad_payload_reports_reason() {
        let registry = ActivityRegistry::standard();
        let entry = EncodedActivity {
            tag: tags::FILE_MOVED.into(),
            path: Some(file("a")),
            payload: vec![0xc1],
        };
        assert!(registry.decode(entry).is_err());
    }

    #[test]
    fn missing_path_reports_reason() {
        let registry = ActivityRegistry::standard();
        let entry = EncodedActivity {
            tag: tags::FILE_DELETED.into(),
            path: None,
            payload: vec![],
        };
        assert_eq!(registry.decode(entry).unwrap_err(), "missing target path");
    }

    #[test]
    fn encoding_without_codec_fails() {
        let registry = ActivityRegistry::standard().without(tags::FOLDER_CREATED);
        let kind = ActivityKind::FolderCreated { path: file("d") };
        assert!(matches!(
            registry.encode(&kind),
            Err(WireError::InvalidData(_))
        ));
    }
}
