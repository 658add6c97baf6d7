//! Content hash index over an applied tree

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::trace;

use crate::error::{Result, SyncError};
use crate::hash::ContentHash;
use crate::stat::{ChangeKind, FileInfo};
use crate::writer::{AppliedChange, ChangeObserver};

/// Metadata and digest recorded for one path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    pub info: FileInfo,
    pub digest: ContentHash,
}

/// Sorted `path -> (info, digest)` map fed by applied changes.
///
/// Records are inserted on `Add` and purged on `Delete`, so the key set
/// mirrors what the writer last confirmed on disk. A downstream observer may
/// be chained and is only notified after the index accepted the change.
#[derive(Default)]
pub struct ContentHashIndex {
    records: RwLock<BTreeMap<PathBuf, IndexRecord>>,
    next: Option<Arc<dyn ChangeObserver>>,
}

impl ContentHashIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Index that forwards every change to `next` after recording it
    #[must_use]
    pub fn chain(next: Arc<dyn ChangeObserver>) -> Self {
        Self {
            records: RwLock::default(),
            next: Some(next),
        }
    }

    /// Look up a path.
    ///
    /// Returns the record and its position in sorted order.
    ///
    /// # Errors
    /// Returns [`SyncError::NotFound`] if the path is not recorded
    pub fn stat(&self, path: &Path) -> Result<(usize, IndexRecord)> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let record = records
            .get(path)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(path.to_path_buf()))?;
        let position = records
            .range::<Path, _>((Bound::Unbounded, Bound::Excluded(path)))
            .count();
        Ok((position, record))
    }

    /// Visit `prefix` and every recorded path nested under it, in order.
    ///
    /// # Errors
    /// Stops at and returns the first error from `f`
    pub fn walk<F>(&self, prefix: &Path, mut f: F) -> Result<()>
    where
        F: FnMut(&Path, &IndexRecord) -> Result<()>,
    {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        for (path, record) in records
            .range::<Path, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(path, _)| path.starts_with(prefix))
        {
            f(path, record)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ChangeObserver for ContentHashIndex {
    fn observe(&self, change: &AppliedChange) -> Result<()> {
        {
            let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
            match (change.kind, change.digest) {
                (ChangeKind::Add, Some(digest)) => {
                    trace!("index {} {digest}", change.path.display());
                    records.insert(
                        change.path.clone(),
                        IndexRecord {
                            info: change.info.clone(),
                            digest,
                        },
                    );
                }
                (ChangeKind::Add, None) => {
                    return Err(SyncError::protocol(format!(
                        "add of {} reached the index without a digest",
                        change.path.display()
                    )));
                }
                (ChangeKind::Delete, _) => {
                    records.remove(&change.path);
                }
            }
        }

        match &self.next {
            Some(next) => next.observe(change),
            None => Ok(()),
        }
    }
}
