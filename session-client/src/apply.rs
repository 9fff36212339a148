//! Applies sequenced activities to the host file system.

use crate::host::HostFileSystem;
use session_core::{ReferencePointRegistry, Resource, ResourceError};
use session_types::{ActivityKind, ResourcePath};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Why an activity could not be applied.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The activity contradicts the shared reference points.
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// The host refused the change.
    #[error("host I/O failed on {path}: {source}")]
    Io {
        /// Host path involved.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
}

impl ApplyError {
    /// Whether local session state can no longer be trusted.
    ///
    /// Host I/O failures only lose the one activity; reference-point
    /// contradictions mean this replica disagrees with the session.
    pub fn is_state_corruption(&self) -> bool {
        matches!(self, ApplyError::Resource(_))
    }
}

fn io_error(path: &std::path::Path) -> impl FnOnce(io::Error) -> ApplyError + '_ {
    move |source| ApplyError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Maps activities onto a [`HostFileSystem`].
#[derive(Clone)]
pub struct ActivityApplier {
    fs: Arc<dyn HostFileSystem>,
}

impl std::fmt::Debug for ActivityApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityApplier").finish_non_exhaustive()
    }
}

impl ActivityApplier {
    /// Create an applier writing through `fs`.
    pub fn new(fs: Arc<dyn HostFileSystem>) -> Self {
        Self { fs }
    }

    /// Apply one activity.
    ///
    /// Role changes only affect membership and are not handled here.
    /// Unknown activities are skipped.
    pub fn apply(
        &self,
        kind: &ActivityKind,
        registry: &ReferencePointRegistry,
    ) -> Result<(), ApplyError> {
        match kind {
            ActivityKind::TextEdit {
                path,
                offset,
                replaced_len,
                text,
            } => {
                let host = registry.resolve(path)?;
                let mut content = self.fs.read(&host).map_err(io_error(&host))?;
                splice(&mut content, *offset, *replaced_len, text.as_bytes());
                self.fs.write(&host, &content).map_err(io_error(&host))
            }
            ActivityKind::FileCreated { path, content } => {
                let host = registry.resolve(path)?;
                self.fs.write(&host, content).map_err(io_error(&host))
            }
            ActivityKind::FileDeleted { path } => {
                let host = self.deletable(path, false, registry)?;
                self.fs.delete(&host).map_err(io_error(&host))
            }
            ActivityKind::FileMoved { from, to } => {
                let source = self.deletable(from, false, registry)?;
                let target = registry.resolve(to)?;
                let content = self.fs.read(&source).map_err(io_error(&source))?;
                self.fs.write(&target, &content).map_err(io_error(&target))?;
                self.fs.delete(&source).map_err(io_error(&source))
            }
            ActivityKind::FolderCreated { path } => {
                let host = registry.resolve(path)?;
                self.fs.create_folder(&host).map_err(io_error(&host))
            }
            ActivityKind::FolderDeleted { path } => {
                let host = self.deletable(path, true, registry)?;
                self.fs.delete(&host).map_err(io_error(&host))
            }
            ActivityKind::ReferencePointAdded {
                id, folders, files, ..
            } => {
                let root = ResourcePath::reference_point_root(*id);
                let host = registry.resolve(&root)?;
                self.fs.create_folder(&host).map_err(io_error(&host))?;
                for folder in folders {
                    let host = registry.resolve(&ResourcePath::new(*id, folder.clone()))?;
                    self.fs.create_folder(&host).map_err(io_error(&host))?;
                }
                for (file, content) in files {
                    let host = registry.resolve(&ResourcePath::new(*id, file.clone()))?;
                    self.fs.write(&host, content).map_err(io_error(&host))?;
                }
                Ok(())
            }
            ActivityKind::RoleChanged { .. } => Ok(()),
            ActivityKind::Unknown { tag, .. } => {
                debug!(%tag, "Skipping unknown activity");
                Ok(())
            }
        }
    }

    fn deletable(
        &self,
        path: &ResourcePath,
        is_folder: bool,
        registry: &ReferencePointRegistry,
    ) -> Result<PathBuf, ApplyError> {
        Resource::classify(path.clone(), is_folder).ensure_deletable()?;
        Ok(registry.resolve(path)?)
    }

    /// Refresh the host's view below every shared root.
    pub fn refresh_all(&self, registry: &ReferencePointRegistry) {
        for id in registry.ids() {
            if let Some(root) = registry.root(&id) {
                if let Err(e) = self.fs.refresh(root) {
                    debug!(root = %root.display(), error = %e, "Refresh failed");
                }
            }
        }
    }
}

/// Replace `replaced_len` bytes at `offset` with `text`. Both are clamped
/// to the current content.
fn splice(content: &mut Vec<u8>, offset: u64, replaced_len: u64, text: &[u8]) {
    let len = content.len();
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(len);
    let end = start
        .saturating_add(usize::try_from(replaced_len).unwrap_or(usize::MAX))
        .min(len);
    content.splice(start..end, text.iter().copied());
}
