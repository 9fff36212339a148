//! Host file-system collaborator.
//!
//! The session never touches files directly. It reads and writes through a
//! [`HostFileSystem`], which an embedding editor implements over its own
//! resource model. Two implementations ship here: [`MemoryFileSystem`] for
//! tests and simulation, and [`LocalFileSystem`] over `std::fs`.

use session_types::SessionPath;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// What happened to a local resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Content changed.
    Modified,
    /// Resource appeared.
    Created,
    /// Resource vanished.
    Deleted,
}

/// A change made by the local user, outside the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalChange {
    /// Host path of the resource.
    pub path: PathBuf,
    /// What happened.
    pub kind: ChangeKind,
}

/// One entry of a folder listing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DirEntry {
    /// Entry name.
    pub name: String,
    /// Whether it is a folder.
    pub is_folder: bool,
}

/// File access provided by the host environment.
pub trait HostFileSystem: Send + Sync {
    /// Whether a file or folder exists at `path`.
    fn exists(&self, path: &Path) -> bool;

    /// Whether `path` is a folder.
    fn is_folder(&self, path: &Path) -> bool;

    /// Read a whole file.
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Replace a file's content, creating it and its parents if needed.
    fn write(&self, path: &Path, content: &[u8]) -> io::Result<()>;

    /// Remove a file, or a folder with everything below it. Missing
    /// resources are not an error.
    fn delete(&self, path: &Path) -> io::Result<()>;

    /// Create a folder and its parents.
    fn create_folder(&self, path: &Path) -> io::Result<()>;

    /// Immediate children of a folder, sorted by name.
    fn list(&self, path: &Path) -> io::Result<Vec<DirEntry>>;

    /// Re-sync any cached view with the backing store.
    fn refresh(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    /// Changes made by the local user, if the host reports them.
    fn subscribe_changes(&self) -> Option<mpsc::UnboundedReceiver<LocalChange>> {
        None
    }
}

/// Shared content of a tree below a root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeSnapshot {
    /// Folders, parents before children.
    pub folders: Vec<SessionPath>,
    /// Files and their content.
    pub files: Vec<(SessionPath, Vec<u8>)>,
}

impl TreeSnapshot {
    /// Number of files.
    pub fn file_count(&self) -> u64 {
        self.files.len() as u64
    }

    /// Sum of file sizes.
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|(_, content)| content.len() as u64).sum()
    }
}

/// Walk everything below `root`.
pub fn snapshot_tree(fs: &dyn HostFileSystem, root: &Path) -> io::Result<TreeSnapshot> {
    let mut snapshot = TreeSnapshot::default();
    walk(fs, root, &SessionPath::root(), &mut snapshot)?;
    Ok(snapshot)
}

fn walk(
    fs: &dyn HostFileSystem,
    dir: &Path,
    relative: &SessionPath,
    snapshot: &mut TreeSnapshot,
) -> io::Result<()> {
    for entry in fs.list(dir)? {
        let child = relative
            .join(&entry.name)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let host = dir.join(&entry.name);
        if entry.is_folder {
            snapshot.folders.push(child.clone());
            walk(fs, &host, &child, snapshot)?;
        } else {
            snapshot.files.push((child, fs.read(&host)?));
        }
    }
    Ok(())
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{} not found", path.display()))
}

#[derive(Debug, Default)]
struct MemoryTree {
    files: BTreeMap<PathBuf, Vec<u8>>,
    folders: BTreeSet<PathBuf>,
    watchers: Vec<mpsc::UnboundedSender<LocalChange>>,
}

impl MemoryTree {
    fn add_parents(&mut self, path: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir.as_os_str().is_empty() || !self.folders.insert(dir.to_path_buf()) {
                break;
            }
            current = dir.parent();
        }
    }

    fn notify(&mut self, change: LocalChange) {
        self.watchers.retain(|tx| tx.send(change.clone()).is_ok());
    }
}

/// In-memory file system. Clones share the same tree.
#[derive(Debug, Clone, Default)]
pub struct MemoryFileSystem {
    tree: Arc<Mutex<MemoryTree>>,
}

impl MemoryFileSystem {
    /// Create an empty file system.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryTree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write as the local user would, notifying subscribers.
    pub fn edit_locally(&self, path: &Path, content: &[u8]) {
        let mut tree = self.lock();
        let kind = if tree.files.contains_key(path) {
            ChangeKind::Modified
        } else {
            ChangeKind::Created
        };
        tree.add_parents(path);
        tree.files.insert(path.to_path_buf(), content.to_vec());
        tree.notify(LocalChange {
            path: path.to_path_buf(),
            kind,
        });
    }

    /// Delete as the local user would, notifying subscribers.
    pub fn delete_locally(&self, path: &Path) {
        let mut tree = self.lock();
        if tree.files.remove(path).is_some() {
            tree.notify(LocalChange {
                path: path.to_path_buf(),
                kind: ChangeKind::Deleted,
            });
        }
    }

    /// Every file below `root`, keyed by `/`-separated relative path.
    pub fn tree(&self, root: &Path) -> BTreeMap<String, Vec<u8>> {
        let tree = self.lock();
        tree.files
            .iter()
            .filter_map(|(path, content)| {
                let rest = path.strip_prefix(root).ok()?;
                let key: Vec<String> = rest
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                Some((key.join("/"), content.clone()))
            })
            .collect()
    }
}

impl HostFileSystem for MemoryFileSystem {
    fn exists(&self, path: &Path) -> bool {
        let tree = self.lock();
        tree.files.contains_key(path) || tree.folders.contains(path)
    }

    fn is_folder(&self, path: &Path) -> bool {
        self.lock().folders.contains(path)
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.lock()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| not_found(path))
    }

    fn write(&self, path: &Path, content: &[u8]) -> io::Result<()> {
        let mut tree = self.lock();
        if tree.folders.contains(path) {
            return Err(io::Error::other(format!("{} is a folder", path.display())));
        }
        tree.add_parents(path);
        tree.files.insert(path.to_path_buf(), content.to_vec());
        Ok(())
    }

    fn delete(&self, path: &Path) -> io::Result<()> {
        let mut tree = self.lock();
        if tree.files.remove(path).is_some() {
            return Ok(());
        }
        if tree.folders.contains(path) {
            tree.files.retain(|p, _| !p.starts_with(path));
            tree.folders.retain(|p| !p.starts_with(path));
        }
        Ok(())
    }

    fn create_folder(&self, path: &Path) -> io::Result<()> {
        let mut tree = self.lock();
        if tree.files.contains_key(path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} is a file", path.display()),
            ));
        }
        tree.add_parents(path);
        tree.folders.insert(path.to_path_buf());
        Ok(())
    }

    fn list(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let tree = self.lock();
        if !tree.folders.contains(path) {
            return Err(not_found(path));
        }
        let name_of = |p: &Path| {
            (p.parent() == Some(path))
                .then(|| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .flatten()
        };
        let mut entries: Vec<DirEntry> = tree
            .folders
            .iter()
            .filter_map(|p| name_of(p).map(|name| DirEntry { name, is_folder: true }))
            .chain(tree.files.keys().filter_map(|p| {
                name_of(p).map(|name| DirEntry {
                    name,
                    is_folder: false,
                })
            }))
            .collect();
        entries.sort();
        Ok(entries)
    }

    fn subscribe_changes(&self) -> Option<mpsc::UnboundedReceiver<LocalChange>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().watchers.push(tx);
        Some(rx)
    }
}

/// File system backed by the local disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    /// Create a local file system handle.
    pub fn new() -> Self {
        Self
    }
}

impl HostFileSystem for LocalFileSystem {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_folder(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn write(&self, path: &Path, content: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)
    }

    fn delete(&self, path: &Path) -> io::Result<()> {
        let result = if path.is_dir() {
            std::fs::remove_dir_all(path)
        } else {
            std::fs::remove_file(path)
        };
        match result {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn create_folder(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn list(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_folder: entry.file_type()?.is_dir(),
            });
        }
        entries.sort();
        Ok(entries)
    }
}
