//! Filesystem Snapshot
//!
//! The graph builder and staleness checker see the filesystem only through
//! a single snapshot of `(path, modification time)` pairs taken before the
//! run starts. Changes made while the run is in progress are not observed.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use globset::Glob;
use log::{debug, info};

use crate::error::SystemError;

/// Provider of filesystem listings.
pub trait SnapshotSource: Send + Sync {
    /// Lists the paths matching a glob, sorted, with their modification
    /// times. Must reflect the filesystem at call time.
    fn list(&self, pattern: &str) -> Result<Vec<(PathBuf, SystemTime)>, SystemError>;
}

/// Frozen view of the files known to the run.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    entries: BTreeMap<PathBuf, SystemTime>,
}

impl Snapshot {
    /// Takes a snapshot of everything the source can see.
    pub fn capture(source: &dyn SnapshotSource) -> Result<Self, SystemError> {
        let snapshot = Self::from_entries(source.list("**")?);
        info!("Filesystem snapshot: {} files", snapshot.len());
        Ok(snapshot)
    }

    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (PathBuf, SystemTime)>,
    {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Modification time of a path, if it existed when the snapshot was taken.
    pub fn mtime(&self, path: &Path) -> Option<SystemTime> {
        self.entries.get(path).copied()
    }

    /// Paths in sorted order.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.entries.keys().map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Lists files below a directory. Paths are reported relative to it.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Symbolic links are followed. `ancestors` holds the canonical paths
    /// of the directories above `dir`, so that a link back up is not
    /// descended into again.
    fn walk(
        &self,
        dir: &Path,
        ancestors: &mut Vec<PathBuf>,
        out: &mut Vec<(PathBuf, SystemTime)>,
    ) -> Result<(), SystemError> {
        let canonical = fs::canonicalize(dir)?;
        if ancestors.contains(&canonical) {
            debug!("Not following directory cycle at {}", dir.display());
            return Ok(());
        }
        ancestors.push(canonical);

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let metadata = match fs::metadata(&path) {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("Skipping dangling link {}", path.display());
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if metadata.is_dir() {
                self.walk(&path, ancestors, out)?;
            } else {
                let relative = path.strip_prefix(&self.root).unwrap_or(&path).to_path_buf();
                out.push((relative, metadata.modified()?));
            }
        }

        ancestors.pop();
        Ok(())
    }
}

impl SnapshotSource for DirectorySource {
    fn list(&self, pattern: &str) -> Result<Vec<(PathBuf, SystemTime)>, SystemError> {
        if !self.root.is_dir() {
            return Err(SystemError::SnapshotUnavailable(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }

        let matcher = Glob::new(pattern)
            .map_err(|e| SystemError::SnapshotUnavailable(e.to_string()))?
            .compile_matcher();

        let mut entries = Vec::new();
        self.walk(&self.root, &mut Vec::new(), &mut entries)
            .map_err(|e| SystemError::SnapshotUnavailable(e.to_string()))?;

        entries.retain(|(path, _)| matcher.is_match(path));
        entries.sort();

        debug!(
            "Listed {} files under {} matching '{}'",
            entries.len(),
            self.root.display(),
            pattern
        );
        Ok(entries)
    }
}

/// In-memory listing, for tests and dry runs over synthetic layouts.
#[derive(Debug, Default)]
pub struct MemorySource {
    entries: Mutex<BTreeMap<PathBuf, SystemTime>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a file with the given modification time.
    pub fn add(&self, path: impl Into<PathBuf>, modified: SystemTime) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(path.into(), modified);
        }
    }

    pub fn remove(&self, path: &Path) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(path);
        }
    }
}

impl SnapshotSource for MemorySource {
    fn list(&self, pattern: &str) -> Result<Vec<(PathBuf, SystemTime)>, SystemError> {
        let matcher = Glob::new(pattern)
            .map_err(|e| SystemError::SnapshotUnavailable(e.to_string()))?
            .compile_matcher();

        let entries = self
            .entries
            .lock()
            .map_err(|_| SystemError::SnapshotUnavailable("listing lock poisoned".into()))?;

        Ok(entries
            .iter()
            .filter(|(path, _)| matcher.is_match(path))
            .map(|(path, time)| (path.clone(), *time))
            .collect())
    }
}
