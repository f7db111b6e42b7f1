//! File events delivered by the notification source.

use std::fmt;
use std::path::{Path, PathBuf};

use notify::EventKind;
use notify::event::{CreateKind, MetadataKind, ModifyKind, RemoveKind, RenameMode};

/// A raw file system event with absolute paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    /// A file was created.
    Created { path: PathBuf },

    /// A file's content changed.
    Changed { path: PathBuf },

    /// A file was removed.
    Deleted { path: PathBuf },

    /// A file was renamed within the watched tree.
    Renamed { from: PathBuf, to: PathBuf },
}

impl FileEvent {
    pub fn created(path: impl Into<PathBuf>) -> Self {
        Self::Created { path: path.into() }
    }

    pub fn changed(path: impl Into<PathBuf>) -> Self {
        Self::Changed { path: path.into() }
    }

    pub fn deleted(path: impl Into<PathBuf>) -> Self {
        Self::Deleted { path: path.into() }
    }

    pub fn renamed(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        Self::Renamed {
            from: from.into(),
            to: to.into(),
        }
    }

    /// The kind of event.
    pub fn kind(&self) -> FileEventKind {
        match self {
            Self::Created { .. } => FileEventKind::Created,
            Self::Changed { .. } => FileEventKind::Changed,
            Self::Deleted { .. } => FileEventKind::Deleted,
            Self::Renamed { .. } => FileEventKind::Renamed,
        }
    }

    /// The path the event leaves behind (the new name for renames).
    pub fn path(&self) -> &Path {
        match self {
            Self::Created { path } | Self::Changed { path } | Self::Deleted { path } => path,
            Self::Renamed { to, .. } => to,
        }
    }

    /// Translate a notify event.
    ///
    /// Events the backend marks as folder events are dropped; a removed
    /// directory can no longer be recognized from its path.
    ///
    /// Backends that report a rename as separate `From`/`To` halves also
    /// report the paired `Both` event, so only the pair is kept. Renames of
    /// unknown direction are classified by whether the path still exists.
    pub fn from_notify(event: notify::Event) -> Vec<Self> {
        let notify::Event { kind, paths, .. } = event;

        match kind {
            EventKind::Create(CreateKind::Folder) | EventKind::Remove(RemoveKind::Folder) => {
                Vec::new()
            }
            EventKind::Create(_) => paths.into_iter().map(Self::created).collect(),
            EventKind::Remove(_) => paths.into_iter().map(Self::deleted).collect(),
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match paths.as_slice() {
                [from, to] => vec![Self::renamed(from, to)],
                _ => Vec::new(),
            },
            EventKind::Modify(ModifyKind::Name(RenameMode::From | RenameMode::To)) => Vec::new(),
            EventKind::Modify(ModifyKind::Name(_)) => paths
                .into_iter()
                .map(|path| {
                    if path.exists() {
                        Self::created(path)
                    } else {
                        Self::deleted(path)
                    }
                })
                .collect(),
            EventKind::Modify(ModifyKind::Metadata(
                MetadataKind::WriteTime | MetadataKind::Any,
            ))
            | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any | ModifyKind::Other) => {
                paths.into_iter().map(Self::changed).collect()
            }
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for FileEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Renamed { from, to } => {
                write!(f, "renamed: {} -> {}", from.display(), to.display())
            }
            other => write!(f, "{}: {}", other.kind(), other.path().display()),
        }
    }
}

/// Kind of file event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    Created,
    Changed,
    Deleted,
    Renamed,
}

impl fmt::Display for FileEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Changed => "changed",
            Self::Deleted => "deleted",
            Self::Renamed => "renamed",
        })
    }
}
