//! Resource variants and reference-point addressing.
//!
//! A [`ReferencePointRegistry`] maps each shared reference point to the
//! host directory backing it on this replica. Resolution goes both ways:
//! `(reference point, relative path)` to a host path, and a host path back
//! to `(reference point, relative path)` when it lies under a shared root.

use session_types::{ReferencePointId, ResourcePath, SessionPath};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use crate::error::ResourceError;

/// A shared resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    /// A regular file.
    File {
        /// Where it lives.
        path: ResourcePath,
    },
    /// A folder below a reference point.
    Folder {
        /// Where it lives.
        path: ResourcePath,
    },
    /// The root of a shared tree.
    ReferencePoint {
        /// Session handle.
        id: ReferencePointId,
    },
}

impl Resource {
    /// Classify an addressed resource. The empty path is the reference
    /// point itself, whatever `is_folder` says.
    pub fn classify(path: ResourcePath, is_folder: bool) -> Self {
        if path.is_reference_point() {
            Resource::ReferencePoint {
                id: path.reference_point,
            }
        } else if is_folder {
            Resource::Folder { path }
        } else {
            Resource::File { path }
        }
    }

    /// The address of this resource.
    pub fn resource_path(&self) -> ResourcePath {
        match self {
            Resource::File { path } | Resource::Folder { path } => path.clone(),
            Resource::ReferencePoint { id } => ResourcePath::reference_point_root(*id),
        }
    }

    /// Fails for reference points, which are never deleted as a unit.
    pub fn ensure_deletable(&self) -> Result<(), ResourceError> {
        match self {
            Resource::ReferencePoint { id } => Err(ResourceError::ReferencePointDeletion(*id)),
            Resource::File { .. } | Resource::Folder { .. } => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    root: PathBuf,
}

/// Shared reference points and their host roots.
#[derive(Debug, Clone, Default)]
pub struct ReferencePointRegistry {
    entries: HashMap<ReferencePointId, Entry>,
}

impl ReferencePointRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Share a reference point backed by `root`.
    pub fn register(
        &mut self,
        id: ReferencePointId,
        name: impl Into<String>,
        root: impl Into<PathBuf>,
    ) -> Result<(), ResourceError> {
        if self.entries.contains_key(&id) {
            return Err(ResourceError::DuplicateReferencePoint(id));
        }
        self.entries.insert(
            id,
            Entry {
                name: name.into(),
                root: root.into(),
            },
        );
        Ok(())
    }

    /// Host path of a shared resource.
    pub fn resolve(&self, resource: &ResourcePath) -> Result<PathBuf, ResourceError> {
        let entry = self
            .entries
            .get(&resource.reference_point)
            .ok_or(ResourceError::UnknownReferencePoint(resource.reference_point))?;
        let mut path = entry.root.clone();
        for segment in resource.path.segments() {
            path.push(segment);
        }
        Ok(path)
    }

    /// Session address of a host path, or `None` when it is not under any
    /// shared root. When roots nest, the deepest one wins.
    pub fn locate(&self, host_path: &Path) -> Option<ResourcePath> {
        let (id, rest) = self
            .entries
            .iter()
            .filter_map(|(id, entry)| {
                host_path
                    .strip_prefix(&entry.root)
                    .ok()
                    .map(|rest| (id, entry.root.components().count(), rest))
            })
            .max_by_key(|(_, depth, _)| *depth)
            .map(|(id, _, rest)| (*id, rest))?;
        let path = relative_to_session_path(rest).ok()?;
        Some(ResourcePath::new(id, path))
    }

    /// Display name of a reference point.
    pub fn name(&self, id: &ReferencePointId) -> Option<&str> {
        self.entries.get(id).map(|e| e.name.as_str())
    }

    /// Host root of a reference point.
    pub fn root(&self, id: &ReferencePointId) -> Option<&Path> {
        self.entries.get(id).map(|e| e.root.as_path())
    }

    /// Whether `id` is shared.
    pub fn contains(&self, id: &ReferencePointId) -> bool {
        self.entries.contains_key(id)
    }

    /// Shared reference point ids.
    pub fn ids(&self) -> Vec<ReferencePointId> {
        let mut ids: Vec<_> = self.entries.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Number of shared reference points.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is shared.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Release every reference point.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Convert a relative host path into segments.
pub fn relative_to_session_path(rest: &Path) -> Result<SessionPath, ResourceError> {
    let mut segments = Vec::new();
    for component in rest.components() {
        match component {
            Component::Normal(part) => match part.to_str() {
                Some(text) => segments.push(text.to_string()),
                None => return Err(ResourceError::Unrepresentable(rest.to_path_buf())),
            },
            Component::CurDir => {}
            _ => return Err(ResourceError::Unrepresentable(rest.to_path_buf())),
        }
    }
    Ok(SessionPath::from_segments(segments)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (ReferencePointRegistry, ReferencePointId, ReferencePointId) {
        let outer = ReferencePointId::new();
        let inner = ReferencePointId::new();
        let mut reg = ReferencePointRegistry::new();
        reg.register(outer, "workspace", "/work").unwrap();
        reg.register(inner, "lib", "/work/lib").unwrap();
        (reg, outer, inner)
    }

    #[test]
    fn resolve_joins_segments_under_root() {
        let (reg, outer, _) = registry();
        let rp = ResourcePath::new(outer, SessionPath::parse("src/main.rs").unwrap());
        assert_eq!(reg.resolve(&rp).unwrap(), PathBuf::from("/work/src/main.rs"));
    }

    #[test]
    fn resolve_unknown_reference_point_fails() {
        let (reg, _, _) = registry();
        let stranger = ReferencePointId::new();
        assert_eq!(
            reg.resolve(&ResourcePath::reference_point_root(stranger)),
            Err(ResourceError::UnknownReferencePoint(stranger))
        );
    }

    #[test]
    fn locate_prefers_deepest_root() {
        let (reg, outer, inner) = registry();
        let found = reg.locate(Path::new("/work/lib/a.rs")).unwrap();
        assert_eq!(found.reference_point, inner);
        assert_eq!(found.path, SessionPath::parse("a.rs").unwrap());

        let found = reg.locate(Path::new("/work/readme")).unwrap();
        assert_eq!(found.reference_point, outer);
    }

    #[test]
    fn locate_outside_roots_is_none() {
        let (reg, _, _) = registry();
        assert!(reg.locate(Path::new("/elsewhere/file")).is_none());
        assert!(reg.locate(Path::new("/workshop/file")).is_none());
    }

    #[test]
    fn locate_root_itself_is_reference_point() {
        let (reg, outer, _) = registry();
        let found = reg.locate(Path::new("/work")).unwrap();
        assert_eq!(found, ResourcePath::reference_point_root(outer));
    }

    #[test]
    fn resolve_then_locate_roundtrip() {
        let (reg, outer, _) = registry();
        let rp = ResourcePath::new(outer, SessionPath::parse("docs/guide.md").unwrap());
        assert_eq!(reg.locate(&reg.resolve(&rp).unwrap()), Some(rp));
    }

    #[test]
    fn duplicate_registration_rejected() {
        let (mut reg, outer, _) = registry();
        assert_eq!(
            reg.register(outer, "again", "/again"),
            Err(ResourceError::DuplicateReferencePoint(outer))
        );
    }

    #[test]
    fn reference_point_is_never_deletable() {
        let id = ReferencePointId::new();
        let resource = Resource::classify(ResourcePath::reference_point_root(id), true);
        assert_eq!(resource, Resource::ReferencePoint { id });
        assert_eq!(
            resource.ensure_deletable(),
            Err(ResourceError::ReferencePointDeletion(id))
        );
    }

    #[test]
    fn files_and_folders_are_deletable() {
        let id = ReferencePointId::new();
        let path = ResourcePath::new(id, SessionPath::parse("a").unwrap());
        let file = Resource::classify(path.clone(), false);
        let folder = Resource::classify(path.clone(), true);
        assert!(matches!(file, Resource::File { .. }));
        assert!(matches!(folder, Resource::Folder { .. }));
        assert!(file.ensure_deletable().is_ok());
        assert!(folder.ensure_deletable().is_ok());
        assert_eq!(folder.resource_path(), path);
    }

    #[test]
    fn clear_releases_everything() {
        let (mut reg, outer, _) = registry();
        reg.clear();
        assert!(reg.is_empty());
        assert!(!reg.contains(&outer));
    }
}
