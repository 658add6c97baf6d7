//! Snapshot: the sorted listing of a tree at the end of a sync round

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use rkyv::rancor::Error as RkyvError;
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};
use tracing::debug;

use crate::diff::Differ;
use crate::error::{Result, SyncError};
use crate::stat::{ContentIdentity, FileInfo, Stat, ensure_ascending};

/// On-disk format version of a persisted snapshot
const STATE_VERSION: u32 = 1;

/// A path-sorted listing of a tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    entries: Vec<Stat>,
}

impl Snapshot {
    /// Create an empty snapshot
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a snapshot from a listing that is already in path order.
    ///
    /// # Errors
    /// Returns an error if the listing is unsorted, lists an entry before its
    /// parent directory, or carries a dangling hard-link reference
    pub fn from_sorted(entries: Vec<Stat>) -> Result<Self> {
        let mut builder = SnapshotBuilder::default();
        for stat in entries {
            builder.push(stat)?;
        }
        Ok(builder.finish())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Changes that turn this snapshot into `incoming`
    #[must_use]
    pub fn diff<'a>(&'a self, incoming: &'a Snapshot) -> Differ<'a> {
        Differ::new(&self.entries, &incoming.entries)
    }

    /// Load a persisted snapshot, or return an empty one if none exists
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or decoded.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::empty()),
            Err(e) => return Err(state_error(path, e)),
        };

        let mut aligned = AlignedVec::<16>::new();
        aligned.extend_from_slice(&bytes);

        let archived = rkyv::access::<ArchivedStoredSnapshot, RkyvError>(&aligned)
            .map_err(|e| state_error(path, format!("failed to access archived snapshot: {e}")))?;
        let stored: StoredSnapshot = rkyv::deserialize::<StoredSnapshot, RkyvError>(archived)
            .map_err(|e| state_error(path, format!("failed to deserialize snapshot: {e}")))?;

        if stored.version != STATE_VERSION {
            return Err(state_error(
                path,
                format!("unsupported snapshot version {}", stored.version),
            ));
        }

        let entries = stored
            .entries
            .into_iter()
            .map(StoredEntry::into_stat)
            .collect::<Result<Vec<_>, String>>()
            .map_err(|e| state_error(path, e))?;
        let snapshot = Self::from_sorted(entries)?;
        debug!("Loaded snapshot with {} entries from {}", snapshot.len(), path.display());
        Ok(snapshot)
    }

    /// Persist the snapshot, replacing any previous file atomically
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| state_error(path, e))?;
        }

        let stored = StoredSnapshot {
            version: STATE_VERSION,
            entries: self.entries.iter().map(StoredEntry::from_stat).collect(),
        };
        let bytes = rkyv::to_bytes::<RkyvError>(&stored)
            .map_err(|e| state_error(path, format!("failed to serialize snapshot: {e}")))?;

        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, &bytes).map_err(|e| state_error(path, e))?;
        std::fs::rename(&tmp_path, path).map_err(|e| state_error(path, e))?;
        Ok(())
    }
}

/// Incrementally validates a listing as it arrives
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    entries: Vec<Stat>,
    directories: HashSet<PathBuf>,
    files: HashSet<PathBuf>,
}

impl SnapshotBuilder {
    /// Append the next entry of the listing
    ///
    /// # Errors
    /// Returns an error if the entry breaks path order, has no parent
    /// directory in the listing, or is a removed-marker.
    pub fn push(&mut self, stat: Stat) -> Result<()> {
        ensure_ascending(self.entries.last().map(|s| s.path.as_path()), &stat.path)?;

        if let Some(parent) = stat.path.parent() {
            if !parent.as_os_str().is_empty() && !self.directories.contains(parent) {
                return Err(SyncError::protocol(format!(
                    "{} listed without its parent directory",
                    stat.path.display()
                )));
            }
        }

        match &stat.info {
            FileInfo::Directory { .. } => {
                self.directories.insert(stat.path.clone());
            }
            FileInfo::File { identity, .. } => {
                if let ContentIdentity::HardLink(first) = identity {
                    if !self.files.contains(first) {
                        return Err(SyncError::protocol(format!(
                            "{} links to unknown file {}",
                            stat.path.display(),
                            first.display()
                        )));
                    }
                }
                self.files.insert(stat.path.clone());
            }
            FileInfo::Symlink { .. } => {}
            FileInfo::Removed => {
                return Err(SyncError::protocol(format!(
                    "{} listed as removed",
                    stat.path.display()
                )));
            }
        }

        self.entries.push(stat);
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn finish(self) -> Snapshot {
        Snapshot {
            entries: self.entries,
        }
    }
}

fn state_error(path: &Path, message: impl ToString) -> SyncError {
    SyncError::Snapshot {
        path: path.to_path_buf(),
        message: message.to_string(),
    }
}

#[derive(Archive, Serialize, Deserialize, Debug)]
struct StoredSnapshot {
    version: u32,
    entries: Vec<StoredEntry>,
}

mod kind {
    pub const DIRECTORY: u8 = 0;
    pub const FILE: u8 = 1;
    pub const HARD_LINK: u8 = 2;
    pub const SYMLINK: u8 = 3;
}

/// Flat record of one entry; `target` holds the symlink or hard-link target
#[derive(Archive, Serialize, Deserialize, Debug)]
struct StoredEntry {
    path: String,
    kind: u8,
    mode: u32,
    size: u64,
    modified: i64,
    dev: u64,
    ino: u64,
    target: String,
}

impl StoredEntry {
    fn from_stat(stat: &Stat) -> Self {
        let mut entry = Self {
            path: stat.path.to_string_lossy().into_owned(),
            kind: kind::DIRECTORY,
            mode: stat.info.mode(),
            size: 0,
            modified: 0,
            dev: 0,
            ino: 0,
            target: String::new(),
        };

        match &stat.info {
            FileInfo::Directory { .. } | FileInfo::Removed => {}
            FileInfo::File {
                size,
                modified,
                identity,
                ..
            } => {
                entry.size = *size;
                entry.modified = *modified;
                match identity {
                    ContentIdentity::Inode { dev, ino } => {
                        entry.kind = kind::FILE;
                        entry.dev = *dev;
                        entry.ino = *ino;
                    }
                    ContentIdentity::HardLink(first) => {
                        entry.kind = kind::HARD_LINK;
                        entry.target = first.to_string_lossy().into_owned();
                    }
                }
            }
            FileInfo::Symlink { target } => {
                entry.kind = kind::SYMLINK;
                entry.target = target.to_string_lossy().into_owned();
            }
        }

        entry
    }

    fn into_stat(self) -> Result<Stat, String> {
        let info = match self.kind {
            kind::DIRECTORY => FileInfo::Directory { mode: self.mode },
            kind::FILE | kind::HARD_LINK => FileInfo::File {
                mode: self.mode,
                size: self.size,
                modified: self.modified,
                identity: if self.kind == kind::FILE {
                    ContentIdentity::Inode {
                        dev: self.dev,
                        ino: self.ino,
                    }
                } else {
                    ContentIdentity::HardLink(PathBuf::from(self.target))
                },
            },
            kind::SYMLINK => FileInfo::Symlink {
                target: PathBuf::from(self.target),
            },
            other => return Err(format!("unknown entry kind {other} for {}", self.path)),
        };
        Ok(Stat::new(self.path, info))
    }
}
