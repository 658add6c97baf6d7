//! Local disk-to-disk copy
//!
//! Runs the same pipeline as a protocol round without a channel:
//! walk the source, diff against the previous snapshot, apply with content
//! read straight from the source tree.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;
use treesync_core::{ContentMode, DirSource, DiskWriter, Result, Snapshot, SyncError, Walker};

/// Mirror the tree described by `walker` into `dest`.
///
/// `previous` is the snapshot returned by the last successful copy into
/// `dest` (empty for a fresh copy); only its differences are applied. The
/// returned snapshot is the baseline for the next copy.
///
/// # Errors
/// Returns the first walk, apply or transfer error, or
/// [`SyncError::Cancelled`]
pub async fn copy_tree(
    walker: &Walker,
    dest: &Path,
    previous: &Snapshot,
    mode: ContentMode,
    cancel: &CancellationToken,
) -> Result<Snapshot> {
    let source_walker = walker.clone();
    let walk_cancel = cancel.clone();
    let stats = tokio::task::spawn_blocking(move || source_walker.collect(&walk_cancel)).await??;
    let incoming = Snapshot::from_sorted(stats)?;

    tokio::fs::create_dir_all(dest)
        .await
        .map_err(|e| SyncError::apply("create directory", dest, e))?;

    let mut writer = DiskWriter::new(dest, Arc::new(DirSource::new(walker.root())))
        .with_mode(mode)
        .with_cancellation(cancel.clone());

    let mut applied = 0usize;
    for change in previous.diff(&incoming) {
        writer.handle_change(change).await?;
        applied += 1;
    }
    writer.wait().await?;

    info!(
        "Copied {} to {}: {applied} changes",
        walker.root().display(),
        dest.display()
    );
    Ok(incoming)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::MetadataExt;

    use tempfile::TempDir;
    use treesync_core::format_listing;

    fn listing(root: &Path) -> Vec<String> {
        Walker::new(root)
            .collect(&CancellationToken::new())
            .unwrap()
            .iter()
            .map(format_listing)
            .collect()
    }

    fn source_tree() -> TempDir {
        let src = TempDir::new().unwrap();
        fs::create_dir(src.path().join("bar")).unwrap();
        fs::write(src.path().join("bar/foo"), "").unwrap();
        std::os::unix::fs::symlink("../foo", src.path().join("bar/foo2")).unwrap();
        fs::write(src.path().join("foo"), "mydata").unwrap();
        fs::hard_link(src.path().join("foo"), src.path().join("foo2")).unwrap();
        src
    }

    #[tokio::test]
    async fn test_copy_reproduces_listing() {
        let src = source_tree();
        let dest = TempDir::new().unwrap();
        let cancel = CancellationToken::new();

        for mode in [ContentMode::Sync, ContentMode::Async { max_in_flight: 2 }] {
            let target = dest.path().join(format!("{mode:?}"));
            copy_tree(&Walker::new(src.path()), &target, &Snapshot::empty(), mode, &cancel)
                .await
                .unwrap();

            assert_eq!(listing(&target), listing(src.path()));
            let foo = fs::metadata(target.join("foo")).unwrap();
            let foo2 = fs::metadata(target.join("foo2")).unwrap();
            assert_eq!(foo.ino(), foo2.ino());
            assert_eq!(fs::read(target.join("foo2")).unwrap(), b"mydata");
        }
    }

    #[tokio::test]
    async fn test_second_copy_applies_only_differences() {
        let src = source_tree();
        let dest = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let walker = Walker::new(src.path());

        let first = copy_tree(&walker, dest.path(), &Snapshot::empty(), ContentMode::Sync, &cancel)
            .await
            .unwrap();

        fs::remove_dir_all(src.path().join("bar")).unwrap();
        fs::write(src.path().join("new"), "fresh").unwrap();
        // Content outside the diff stays untouched
        fs::write(dest.path().join("foo"), "local edit").unwrap();

        let second = copy_tree(&walker, dest.path(), &first, ContentMode::Sync, &cancel)
            .await
            .unwrap();

        assert_eq!(second.len(), 3);
        assert!(!dest.path().join("bar").exists());
        assert_eq!(fs::read(dest.path().join("new")).unwrap(), b"fresh");
        assert_eq!(fs::read(dest.path().join("foo")).unwrap(), b"local edit");
    }
}
