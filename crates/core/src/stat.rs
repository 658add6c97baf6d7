//! Change stream data model: entries, their metadata, and path ordering

use std::cmp::Ordering;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Kind of change in a change stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Create or replace the path
    Add,
    /// Remove the path
    Delete,
}

/// Opaque token identifying the storage behind a regular file.
///
/// Two entries with the same identity share content, so the second one can be
/// materialized as a hard link instead of transferring bytes again.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentIdentity {
    /// Device and inode on the host that produced the stream
    Inode { dev: u64, ino: u64 },
    /// Storage is shared with an earlier path of the same stream
    HardLink(PathBuf),
}

/// Metadata carried by every entry of a change stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileInfo {
    Directory {
        mode: u32,
    },
    File {
        mode: u32,
        size: u64,
        /// Modification time, nanoseconds since the UNIX epoch
        modified: i64,
        identity: ContentIdentity,
    },
    Symlink {
        /// Literal link target, never resolved
        target: PathBuf,
    },
    /// Marker for a path that no longer exists
    Removed,
}

impl FileInfo {
    #[must_use]
    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Directory { .. })
    }

    #[must_use]
    pub fn is_file(&self) -> bool {
        matches!(self, Self::File { .. })
    }

    /// Permission bits (symlinks report 0o777)
    #[must_use]
    pub fn mode(&self) -> u32 {
        match self {
            Self::Directory { mode } | Self::File { mode, .. } => *mode,
            Self::Symlink { .. } => 0o777,
            Self::Removed => 0,
        }
    }

    /// Short name of the entry type, as printed in listings
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Directory { .. } => "dir",
            Self::File { .. } => "file",
            Self::Symlink { .. } => "symlink",
            Self::Removed => "removed",
        }
    }

    /// Whether both entries have the same on-disk type
    #[must_use]
    pub fn same_type(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// A single entry of a tree listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    /// Slash-separated path relative to the tree root
    pub path: PathBuf,
    pub info: FileInfo,
}

impl Stat {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, info: FileInfo) -> Self {
        Self {
            path: path.into(),
            info,
        }
    }
}

/// One operation of a change stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub kind: ChangeKind,
    pub path: PathBuf,
    pub info: FileInfo,
}

impl Change {
    #[must_use]
    pub fn add(stat: Stat) -> Self {
        Self {
            kind: ChangeKind::Add,
            path: stat.path,
            info: stat.info,
        }
    }

    #[must_use]
    pub fn delete(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: ChangeKind::Delete,
            path: path.into(),
            info: FileInfo::Removed,
        }
    }
}

/// Compare two stream paths.
///
/// Ordering is component-wise, which matches a depth-first traversal with
/// entries sorted by name: `a` < `a/b` < `a-b`.
#[must_use]
pub fn compare_paths(a: &Path, b: &Path) -> Ordering {
    a.cmp(b)
}

/// Ensure `next` sorts strictly after `previous`.
///
/// # Errors
/// Returns [`SyncError::OutOfOrder`] when the ordering contract is violated
pub fn ensure_ascending(previous: Option<&Path>, next: &Path) -> Result<()> {
    match previous {
        Some(prev) if compare_paths(prev, next) != Ordering::Less => Err(SyncError::OutOfOrder {
            previous: prev.to_path_buf(),
            path: next.to_path_buf(),
        }),
        _ => Ok(()),
    }
}

/// Check that a path received from a peer stays inside the tree root.
///
/// # Errors
/// Returns a protocol error for empty, absolute or parent-relative paths
pub fn validate_relative(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(SyncError::protocol("empty path"));
    }
    if path
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(SyncError::protocol(format!(
            "path escapes tree root: {}",
            path.display()
        )));
    }
    Ok(())
}
