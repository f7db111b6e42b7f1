//! Pending change tracking between flushes.
//!
//! The aggregator keeps three sets of paths relative to the watched root.
//! A path lives in at most one of them, so a file created and removed within
//! the same window cancels out instead of showing up twice.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Pending changes, keyed by path relative to the watched root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Files that did not exist when they were first seen.
    pub created: BTreeSet<PathBuf>,

    /// Pre-existing files whose content changed.
    pub changed: BTreeSet<PathBuf>,

    /// Pre-existing files that were removed.
    pub deleted: BTreeSet<PathBuf>,
}

impl ChangeSet {
    /// Check if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.changed.is_empty() && self.deleted.is_empty()
    }

    /// Total number of pending paths.
    pub fn len(&self) -> usize {
        self.created.len() + self.changed.len() + self.deleted.len()
    }
}

/// Collects file changes and reports them on flush.
///
/// All operations take `&self` and may be called from any thread.
#[derive(Debug)]
pub struct ChangeAggregator {
    /// Root the relative paths are resolved against on flush.
    root: PathBuf,

    /// Pending changes.
    pending: Mutex<ChangeSet>,
}

impl ChangeAggregator {
    /// Create an empty aggregator for the given root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            pending: Mutex::new(ChangeSet::default()),
        }
    }

    /// Record a created file.
    pub fn add_created(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let mut pending = self.lock();

        if pending.deleted.remove(&path) {
            // Removed and created again: the file was replaced.
            pending.changed.insert(path);
        } else if !pending.changed.contains(&path) {
            pending.created.insert(path);
        }
    }

    /// Record a modified file.
    pub fn add_changed(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let mut pending = self.lock();

        if pending.created.contains(&path) {
            return;
        }
        pending.deleted.remove(&path);
        pending.changed.insert(path);
    }

    /// Record a deleted file.
    pub fn add_deleted(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let mut pending = self.lock();

        if pending.created.remove(&path) {
            return;
        }
        pending.changed.remove(&path);
        pending.deleted.insert(path);
    }

    /// Carry a tracked entry over to its new name.
    ///
    /// The entry keeps its category. Renaming a path that is not tracked is
    /// not recorded.
    pub fn rename(&self, old: impl AsRef<Path>, new: impl Into<PathBuf>) {
        let old = old.as_ref();
        let new = new.into();
        let mut pending = self.lock();
        let pending = &mut *pending;

        if pending.created.remove(old) {
            pending.changed.remove(&new);
            pending.deleted.remove(&new);
            pending.created.insert(new);
        } else if pending.changed.remove(old) {
            pending.created.remove(&new);
            pending.deleted.remove(&new);
            pending.changed.insert(new);
        }
    }

    /// Copy of the pending changes.
    pub fn snapshot(&self) -> ChangeSet {
        self.lock().clone()
    }

    /// Check if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Take every pending change, drop entries the file system no longer
    /// agrees with, and return the rest.
    ///
    /// Created and changed files must still exist; deleted files must still
    /// be gone. The pending sets are empty afterwards.
    pub fn flush(&self) -> Summary {
        let pending = std::mem::take(&mut *self.lock());
        if pending.is_empty() {
            return Summary::default();
        }

        Summary {
            created: pending
                .created
                .into_iter()
                .filter(|path| self.exists(path))
                .collect(),
            changed: pending
                .changed
                .into_iter()
                .filter(|path| self.exists(path))
                .collect(),
            deleted: pending
                .deleted
                .into_iter()
                .filter(|path| !self.exists(path))
                .collect(),
        }
    }

    fn exists(&self, relative: &Path) -> bool {
        self.root.join(relative).exists()
    }

    fn lock(&self) -> MutexGuard<'_, ChangeSet> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Changes that survived a flush, sorted by path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Summary {
    pub created: Vec<PathBuf>,
    pub changed: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
}

impl Summary {
    /// Check if the summary has no entries.
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.changed.is_empty() && self.deleted.is_empty()
    }

    /// One labelled, newline separated block per non-empty category.
    pub fn sections(&self) -> Vec<String> {
        [
            ("Added files", &self.created),
            ("Changed files", &self.changed),
            ("Deleted files", &self.deleted),
        ]
        .into_iter()
        .filter(|(_, paths)| !paths.is_empty())
        .map(|(label, paths)| {
            let lines: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
            format!("{label}:\n{}", lines.join("\n"))
        })
        .collect()
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sections().join("\n"))
    }
}
