//! DiskWriter: applies a path-sorted change stream to a destination tree
//!
//! Metadata operations (mkdir, symlink, hard link, delete) are applied inline.
//! Regular file content comes from a [`ContentSource`], either inline
//! ([`ContentMode::Sync`]) or on a bounded pool of tasks
//! ([`ContentMode::Async`]) that is drained by [`DiskWriter::wait`].

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use async_trait::async_trait;
use filetime::FileTime;
use tokio::fs;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Result, SyncError};
use crate::hash::{ContentHash, EntryHasher};
use crate::stat::{Change, ChangeKind, ContentIdentity, FileInfo, compare_paths, validate_relative};

/// How regular file content is retrieved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentMode {
    /// Retrieval completes before `handle_change` returns
    #[default]
    Sync,
    /// Retrieval runs on at most `max_in_flight` concurrent tasks
    Async { max_in_flight: usize },
}

/// Supplies the bytes of regular files.
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Stream the full content of `path` (relative to the tree root) into `sink`.
    async fn write_content(&self, path: &Path, sink: &mut ContentSink) -> Result<()>;
}

/// Destination of one file's content.
///
/// Every byte written is hashed alongside the write, so the digest always
/// describes exactly what reached the disk.
pub struct ContentSink {
    file: fs::File,
    hasher: EntryHasher,
    written: u64,
}

impl ContentSink {
    fn new(file: fs::File, info: &FileInfo) -> Self {
        Self {
            file,
            hasher: EntryHasher::new(info),
            written: 0,
        }
    }

    /// Append a chunk of content
    ///
    /// # Errors
    /// Returns an error if the write fails
    pub async fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        self.write_all(data).await
    }

    /// Bytes written so far
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written
    }

    async fn finish(mut self) -> io::Result<(ContentHash, u64)> {
        self.file.flush().await?;
        Ok((self.hasher.finalize(), self.written))
    }
}

impl AsyncWrite for ContentSink {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        match Pin::new(&mut this.file).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.hasher.update(&buf[..n]);
                this.written += n as u64;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_shutdown(cx)
    }
}

/// Reads content from a local source tree
#[derive(Debug, Clone)]
pub struct DirSource {
    root: PathBuf,
}

impl DirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ContentSource for DirSource {
    async fn write_content(&self, path: &Path, sink: &mut ContentSink) -> Result<()> {
        let transfer = |e: io::Error| SyncError::Transfer {
            path: path.to_path_buf(),
            message: e.to_string(),
        };
        let mut file = fs::File::open(self.root.join(path)).await.map_err(transfer)?;
        tokio::io::copy(&mut file, sink).await.map_err(transfer)?;
        Ok(())
    }
}

/// A change after it has been applied to disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedChange {
    pub kind: ChangeKind,
    pub path: PathBuf,
    pub info: FileInfo,
    /// Entry digest; `None` for deletes
    pub digest: Option<ContentHash>,
}

/// Notified after each change has been applied.
pub trait ChangeObserver: Send + Sync {
    /// # Errors
    /// An error aborts the stream being applied
    fn observe(&self, change: &AppliedChange) -> Result<()>;
}

/// Applies a change stream to `dest`.
///
/// Changes must arrive in ascending path order. The single exception is an
/// `Add` replacing a path that was just deleted, which the differ emits when
/// an entry changes type. [`DiskWriter::wait`] must be called once the stream
/// ends; it completes outstanding content, deferred directory removals and
/// hard-link notifications.
pub struct DiskWriter {
    dest: PathBuf,
    source: Arc<dyn ContentSource>,
    observer: Option<Arc<dyn ChangeObserver>>,
    cancel: CancellationToken,
    /// Present in async mode
    permits: Option<Arc<Semaphore>>,
    tasks: JoinSet<Result<()>>,
    last: Option<(ChangeKind, PathBuf)>,
    /// Deleted directories waiting for their descendants, deepest last
    pending_dirs: Vec<PathBuf>,
    /// Directories created writable that get their final mode in `wait`
    restricted_dirs: Vec<(PathBuf, u32)>,
    /// First path materialized for each source inode
    inodes: HashMap<(u64, u64), PathBuf>,
    digests: Arc<Mutex<HashMap<PathBuf, ContentHash>>>,
    /// Hard links created this session: (path, info, storage path)
    links: Vec<(PathBuf, FileInfo, PathBuf)>,
}

impl DiskWriter {
    pub fn new(dest: impl Into<PathBuf>, source: Arc<dyn ContentSource>) -> Self {
        Self {
            dest: dest.into(),
            source,
            observer: None,
            cancel: CancellationToken::new(),
            permits: None,
            tasks: JoinSet::new(),
            last: None,
            pending_dirs: Vec::new(),
            restricted_dirs: Vec::new(),
            inodes: HashMap::new(),
            digests: Arc::new(Mutex::new(HashMap::new())),
            links: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: ContentMode) -> Self {
        self.permits = match mode {
            ContentMode::Sync => None,
            ContentMode::Async { max_in_flight } => {
                Some(Arc::new(Semaphore::new(max_in_flight.max(1))))
            }
        };
        self
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ChangeObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn dest(&self) -> &Path {
        &self.dest
    }

    /// Apply one change.
    ///
    /// In async mode this returns once the file exists on disk; its content
    /// is written in the background and any failure surfaces from a later
    /// call or from [`DiskWriter::wait`].
    ///
    /// # Errors
    /// Returns an error for out-of-order changes, failed filesystem
    /// operations, failed synchronous retrieval, or cancellation
    pub async fn handle_change(&mut self, change: Change) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        self.reap_finished()?;
        validate_relative(&change.path)?;
        self.check_order(&change)?;
        self.flush_deletes(Some(&change.path)).await?;
        self.ensure_parent_writable(&change.path).await?;

        trace!("{:?} {}", change.kind, change.path.display());
        let Change { kind, path, info } = change;
        match kind {
            ChangeKind::Delete => self.delete(&path).await?,
            ChangeKind::Add => self.add(&path, info).await?,
        }
        self.last = Some((kind, path));
        Ok(())
    }

    /// Wait for all outstanding work and return the first error.
    ///
    /// # Errors
    /// Returns the first content, filesystem or observer error, or
    /// [`SyncError::Cancelled`]
    pub async fn wait(mut self) -> Result<()> {
        let result = self.drain().await;
        if result.is_err() {
            self.tasks.abort_all();
        }
        result
    }

    async fn drain(&mut self) -> Result<()> {
        self.flush_deletes(None).await?;

        loop {
            let joined = tokio::select! {
                () = self.cancel.cancelled() => return Err(SyncError::Cancelled),
                joined = self.tasks.join_next() => joined,
            };
            match joined {
                Some(result) => result??,
                None => break,
            }
        }

        for (full, mode) in std::mem::take(&mut self.restricted_dirs).into_iter().rev() {
            set_mode(&full, mode)
                .await
                .map_err(|e| SyncError::apply("chmod", &full, e))?;
        }

        self.notify_links().await
    }

    fn reap_finished(&mut self) -> Result<()> {
        while let Some(joined) = self.tasks.try_join_next() {
            joined??;
        }
        Ok(())
    }

    fn check_order(&self, change: &Change) -> Result<()> {
        let Some((last_kind, last_path)) = &self.last else {
            return Ok(());
        };
        match compare_paths(last_path, &change.path) {
            std::cmp::Ordering::Less => Ok(()),
            std::cmp::Ordering::Equal
                if *last_kind == ChangeKind::Delete && change.kind == ChangeKind::Add =>
            {
                Ok(())
            }
            _ if change.kind == ChangeKind::Add && self.pending_dirs.contains(&change.path) => {
                Ok(())
            }
            _ => Err(SyncError::OutOfOrder {
                previous: last_path.clone(),
                path: change.path.clone(),
            }),
        }
    }

    /// Grant the owner rwx on the directory holding `path` until `wait`.
    ///
    /// Covers parents the stream leaves unchanged, which keep whatever
    /// restricted mode an earlier round gave them.
    async fn ensure_parent_writable(&mut self, path: &Path) -> Result<()> {
        let parent = match path.parent() {
            Some(parent) => self.dest.join(parent),
            None => return Ok(()),
        };
        let Some(mode) = owner_restricted_mode(&parent).await? else {
            return Ok(());
        };
        set_mode(&parent, mode | 0o700)
            .await
            .map_err(|e| SyncError::apply("chmod", &parent, e))?;
        debug!("Opened {} for writing until the stream ends", parent.display());
        self.restricted_dirs.push((parent, mode));
        Ok(())
    }

    /// Remove deleted directories that `next` no longer nests under.
    async fn flush_deletes(&mut self, next: Option<&Path>) -> Result<()> {
        while let Some(dir) = self.pending_dirs.pop() {
            if next.is_some_and(|p| p != dir && p.starts_with(&dir)) {
                self.pending_dirs.push(dir);
                break;
            }
            let full = self.dest.join(&dir);
            match fs::remove_dir(&full).await {
                Ok(()) => {
                    self.restricted_dirs.retain(|(restricted, _)| *restricted != full);
                    debug!("Removed directory {}", dir.display());
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(SyncError::apply("remove directory", &full, e)),
            }
        }
        Ok(())
    }

    async fn delete(&mut self, path: &Path) -> Result<()> {
        let full = self.dest.join(path);
        match fs::symlink_metadata(&full).await {
            Ok(meta) if meta.is_dir() => self.pending_dirs.push(path.to_path_buf()),
            Ok(_) => fs::remove_file(&full)
                .await
                .map_err(|e| SyncError::apply("remove", &full, e))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("{} already absent", path.display());
            }
            Err(e) => return Err(SyncError::apply("stat", &full, e)),
        }

        self.digests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
        self.notify(AppliedChange {
            kind: ChangeKind::Delete,
            path: path.to_path_buf(),
            info: FileInfo::Removed,
            digest: None,
        })
    }

    async fn add(&mut self, path: &Path, info: FileInfo) -> Result<()> {
        match &info {
            FileInfo::Directory { mode } => self.add_directory(path, *mode).await?,
            FileInfo::Symlink { target } => {
                let full = self.dest.join(path);
                clear_entry(&full).await?;
                create_symlink(target, &full)
                    .await
                    .map_err(|e| SyncError::apply("symlink", &full, e))?;
            }
            FileInfo::File { identity, .. } => {
                let identity = identity.clone();
                return self.add_file(path, info, identity).await;
            }
            FileInfo::Removed => {
                return Err(SyncError::protocol(format!(
                    "add of {} carries no metadata",
                    path.display()
                )));
            }
        }

        let digest = EntryHasher::new(&info).finalize();
        self.notify(AppliedChange {
            kind: ChangeKind::Add,
            path: path.to_path_buf(),
            info,
            digest: Some(digest),
        })
    }

    async fn add_directory(&mut self, path: &Path, mode: u32) -> Result<()> {
        let full = self.dest.join(path);
        let exists = match fs::symlink_metadata(&full).await {
            Ok(meta) if meta.is_dir() => true,
            Ok(_) => {
                fs::remove_file(&full)
                    .await
                    .map_err(|e| SyncError::apply("remove", &full, e))?;
                false
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(SyncError::apply("stat", &full, e)),
        };
        if !exists {
            fs::create_dir(&full)
                .await
                .map_err(|e| SyncError::apply("create directory", &full, e))?;
        }

        // Keep the owner able to populate the directory until the stream ends
        let writable = mode & 0o700 == 0o700;
        let initial = if writable { mode } else { mode | 0o700 };
        set_mode(&full, initial)
            .await
            .map_err(|e| SyncError::apply("chmod", &full, e))?;
        if !writable {
            self.restricted_dirs.push((full, mode));
        }
        Ok(())
    }

    async fn add_file(
        &mut self,
        path: &Path,
        info: FileInfo,
        identity: ContentIdentity,
    ) -> Result<()> {
        let full = self.dest.join(path);
        clear_entry(&full).await?;

        let storage = match &identity {
            ContentIdentity::HardLink(first) => {
                match fs::symlink_metadata(self.dest.join(first)).await {
                    Ok(meta) if meta.is_file() => Some(first.clone()),
                    _ => {
                        debug!(
                            "Link source {} missing for {}, retrieving content",
                            first.display(),
                            path.display()
                        );
                        None
                    }
                }
            }
            ContentIdentity::Inode { dev, ino } => self.inodes.get(&(*dev, *ino)).cloned(),
        };

        if let Some(first) = storage {
            let source = self.dest.join(&first);
            fs::hard_link(&source, &full)
                .await
                .map_err(|e| SyncError::apply("link", &full, e))?;
            trace!("Linked {} to {}", path.display(), first.display());
            self.links.push((path.to_path_buf(), info, first));
            return Ok(());
        }

        if let ContentIdentity::Inode { dev, ino } = identity {
            self.inodes.insert((dev, ino), path.to_path_buf());
        }

        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&full)
            .await
            .map_err(|e| SyncError::apply("create", &full, e))?;
        set_mode(&full, info.mode())
            .await
            .map_err(|e| SyncError::apply("chmod", &full, e))?;

        let job = ContentJob {
            path: path.to_path_buf(),
            full,
            info,
            file,
            source: Arc::clone(&self.source),
            observer: self.observer.clone(),
            digests: Arc::clone(&self.digests),
            cancel: self.cancel.clone(),
        };

        match &self.permits {
            Some(permits) => {
                // Blocks the stream once `max_in_flight` retrievals are running
                let permit = tokio::select! {
                    () = self.cancel.cancelled() => return Err(SyncError::Cancelled),
                    permit = Arc::clone(permits).acquire_owned() => {
                        permit.map_err(|_| SyncError::Cancelled)?
                    }
                };
                self.tasks.spawn(async move {
                    let _permit = permit;
                    job.run().await
                });
                Ok(())
            }
            None => job.run().await,
        }
    }

    async fn notify_links(&mut self) -> Result<()> {
        for (path, info, first) in std::mem::take(&mut self.links) {
            let known = self
                .digests
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&first)
                .copied();
            let digest = match known {
                Some(digest) => digest,
                None => {
                    let full = self.dest.join(&path);
                    let header = info.clone();
                    tokio::task::spawn_blocking(move || {
                        EntryHasher::digest_file(&header, &full)
                            .map_err(|e| SyncError::apply("read", &full, e))
                    })
                    .await??
                }
            };
            self.notify(AppliedChange {
                kind: ChangeKind::Add,
                path,
                info,
                digest: Some(digest),
            })?;
        }
        Ok(())
    }

    fn notify(&self, change: AppliedChange) -> Result<()> {
        match &self.observer {
            Some(observer) => observer.observe(&change),
            None => Ok(()),
        }
    }
}

/// Content retrieval for one newly created file
struct ContentJob {
    path: PathBuf,
    full: PathBuf,
    info: FileInfo,
    file: fs::File,
    source: Arc<dyn ContentSource>,
    observer: Option<Arc<dyn ChangeObserver>>,
    digests: Arc<Mutex<HashMap<PathBuf, ContentHash>>>,
    cancel: CancellationToken,
}

impl ContentJob {
    async fn run(self) -> Result<()> {
        let mut sink = ContentSink::new(self.file, &self.info);
        tokio::select! {
            () = self.cancel.cancelled() => return Err(SyncError::Cancelled),
            result = self.source.write_content(&self.path, &mut sink) => result?,
        }

        let (digest, written) = sink
            .finish()
            .await
            .map_err(|e| SyncError::apply("write", &self.full, e))?;

        if let FileInfo::File { size, modified, .. } = &self.info {
            if written != *size {
                warn!(
                    "{}: expected {size} bytes, wrote {written}",
                    self.path.display()
                );
            }
            let mtime = FileTime::from_unix_time(
                modified.div_euclid(1_000_000_000),
                modified.rem_euclid(1_000_000_000) as u32,
            );
            filetime::set_file_mtime(&self.full, mtime)
                .map_err(|e| SyncError::apply("set mtime", &self.full, e))?;
        }

        self.digests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(self.path.clone(), digest);

        if let Some(observer) = &self.observer {
            observer.observe(&AppliedChange {
                kind: ChangeKind::Add,
                path: self.path,
                info: self.info,
                digest: Some(digest),
            })?;
        }
        Ok(())
    }
}

/// Remove whatever currently occupies `full`, except non-empty directories.
async fn clear_entry(full: &Path) -> Result<()> {
    match fs::symlink_metadata(full).await {
        Ok(meta) if meta.is_dir() => fs::remove_dir(full)
            .await
            .map_err(|e| SyncError::apply("remove directory", full, e)),
        Ok(_) => fs::remove_file(full)
            .await
            .map_err(|e| SyncError::apply("remove", full, e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SyncError::apply("stat", full, e)),
    }
}

/// Permission bits of a directory that denies its owner rwx, if it does
#[cfg(unix)]
async fn owner_restricted_mode(dir: &Path) -> Result<Option<u32>> {
    use std::os::unix::fs::PermissionsExt;
    match fs::symlink_metadata(dir).await {
        Ok(meta) if meta.is_dir() => {
            let mode = meta.permissions().mode() & 0o7777;
            Ok((mode & 0o700 != 0o700).then_some(mode))
        }
        Ok(_) => Ok(None),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SyncError::apply("stat", dir, e)),
    }
}

#[cfg(not(unix))]
async fn owner_restricted_mode(_dir: &Path) -> Result<Option<u32>> {
    Ok(None)
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
async fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    fs::symlink(target, link).await
}

#[cfg(not(unix))]
async fn create_symlink(_target: &Path, _link: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "symlinks are only supported on unix",
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;
    use std::time::{Duration, Instant};

    use tempfile::TempDir;

    use crate::stat::Stat;
    use crate::walk::{Walker, format_listing};

    /// Serves fixed content, optionally after a delay
    struct MemorySource {
        files: HashMap<PathBuf, &'static [u8]>,
        delay: Duration,
    }

    impl MemorySource {
        fn new(files: &[(&str, &'static [u8])]) -> Self {
            Self {
                files: files.iter().map(|(p, d)| (PathBuf::from(p), *d)).collect(),
                delay: Duration::ZERO,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl ContentSource for MemorySource {
        async fn write_content(&self, path: &Path, sink: &mut ContentSink) -> Result<()> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let data = self.files.get(path).ok_or_else(|| SyncError::Transfer {
                path: path.to_path_buf(),
                message: "no such file".into(),
            })?;
            sink.write_chunk(data)
                .await
                .map_err(|e| SyncError::apply("write", path, e))
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<AppliedChange>>);

    impl ChangeObserver for Recorder {
        fn observe(&self, change: &AppliedChange) -> Result<()> {
            self.0.lock().unwrap().push(change.clone());
            Ok(())
        }
    }

    fn dir(path: &str) -> Change {
        Change::add(Stat::new(path, FileInfo::Directory { mode: 0o755 }))
    }

    fn file(path: &str, size: u64, identity: ContentIdentity) -> Change {
        Change::add(Stat::new(
            path,
            FileInfo::File {
                mode: 0o644,
                size,
                modified: 1_600_000_000_000_000_000,
                identity,
            },
        ))
    }

    fn inode(ino: u64) -> ContentIdentity {
        ContentIdentity::Inode { dev: 1, ino }
    }

    fn symlink(path: &str, target: &str) -> Change {
        Change::add(Stat::new(
            path,
            FileInfo::Symlink {
                target: PathBuf::from(target),
            },
        ))
    }

    fn listing(root: &Path) -> String {
        Walker::new(root)
            .collect(&CancellationToken::new())
            .unwrap()
            .iter()
            .map(|s| format_listing(s) + "\n")
            .collect()
    }

    async fn apply(writer: &mut DiskWriter, changes: Vec<Change>) {
        for change in changes {
            writer.handle_change(change).await.unwrap();
        }
    }

    fn scenario() -> Vec<Change> {
        vec![
            dir("bar"),
            file("bar/foo", 0, inode(1)),
            symlink("bar/foo2", "../foo"),
            file("foo", 6, inode(2)),
            file("foo2", 6, ContentIdentity::HardLink(PathBuf::from("foo"))),
        ]
    }

    fn scenario_source() -> Arc<MemorySource> {
        Arc::new(MemorySource::new(&[("bar/foo", b""), ("foo", b"mydata")]))
    }

    #[tokio::test]
    async fn test_sync_writer_materializes_tree() {
        let dest = TempDir::new().unwrap();
        let mut writer = DiskWriter::new(dest.path(), scenario_source());
        apply(&mut writer, scenario()).await;
        writer.wait().await.unwrap();

        assert_eq!(
            listing(dest.path()),
            "dir bar\nfile bar/foo\nsymlink:../foo bar/foo2\nfile foo\nfile foo2 >foo\n"
        );
        assert_eq!(std::fs::read(dest.path().join("foo")).unwrap(), b"mydata");

        let foo = std::fs::metadata(dest.path().join("foo")).unwrap();
        let foo2 = std::fs::metadata(dest.path().join("foo2")).unwrap();
        assert_eq!(foo.ino(), foo2.ino());
    }

    #[tokio::test]
    async fn test_async_writer_materializes_tree() {
        let dest = TempDir::new().unwrap();
        let mut writer = DiskWriter::new(dest.path(), scenario_source())
            .with_mode(ContentMode::Async { max_in_flight: 2 });
        apply(&mut writer, scenario()).await;
        writer.wait().await.unwrap();

        assert_eq!(
            listing(dest.path()),
            "dir bar\nfile bar/foo\nsymlink:../foo bar/foo2\nfile foo\nfile foo2 >foo\n"
        );
        assert_eq!(std::fs::read(dest.path().join("foo2")).unwrap(), b"mydata");
    }

    #[tokio::test]
    async fn test_same_inode_is_hard_linked() {
        let dest = TempDir::new().unwrap();
        let source = Arc::new(MemorySource::new(&[("a", b"shared")]));
        let mut writer = DiskWriter::new(dest.path(), source);
        apply(&mut writer, vec![file("a", 6, inode(9)), file("b", 6, inode(9))]).await;
        writer.wait().await.unwrap();

        let a = std::fs::metadata(dest.path().join("a")).unwrap();
        let b = std::fs::metadata(dest.path().join("b")).unwrap();
        assert_eq!(a.ino(), b.ino());
        assert_eq!(a.nlink(), 2);
    }

    #[tokio::test]
    async fn test_metadata_is_preserved() {
        let dest = TempDir::new().unwrap();
        let source = Arc::new(MemorySource::new(&[("run.sh", b"#!/bin/sh\n")]));
        let mut writer = DiskWriter::new(dest.path(), source);
        writer
            .handle_change(Change::add(Stat::new(
                "run.sh",
                FileInfo::File {
                    mode: 0o751,
                    size: 10,
                    modified: 1_234_567_890_123_456_789,
                    identity: inode(3),
                },
            )))
            .await
            .unwrap();
        writer.wait().await.unwrap();

        let meta = std::fs::metadata(dest.path().join("run.sh")).unwrap();
        assert_eq!(meta.mode() & 0o7777, 0o751);
        assert_eq!(meta.mtime(), 1_234_567_890);
        assert_eq!(meta.mtime_nsec(), 123_456_789);
    }

    #[tokio::test]
    async fn test_async_retrievals_run_concurrently() {
        let count = 8;
        let delay = Duration::from_millis(100);
        let names: Vec<String> = (0..count).map(|i| format!("f{i}")).collect();
        let files: Vec<(&str, &'static [u8])> =
            names.iter().map(|n| (n.as_str(), &b"x"[..])).collect();
        let source = Arc::new(MemorySource::new(&files).with_delay(delay));

        let dest = TempDir::new().unwrap();
        let mut writer =
            DiskWriter::new(dest.path(), source).with_mode(ContentMode::Async { max_in_flight: 4 });

        let start = Instant::now();
        for (i, name) in names.iter().enumerate() {
            writer
                .handle_change(file(name, 1, inode(100 + i as u64)))
                .await
                .unwrap();
        }
        writer.wait().await.unwrap();
        let elapsed = start.elapsed();

        // Two waves of four, not eight sequential retrievals
        assert!(elapsed >= delay * 2, "finished too early: {elapsed:?}");
        assert!(elapsed < delay * 6, "retrievals were serialized: {elapsed:?}");
    }

    #[tokio::test]
    async fn test_sync_retrieval_error_is_immediate() {
        let dest = TempDir::new().unwrap();
        let mut writer = DiskWriter::new(dest.path(), Arc::new(MemorySource::new(&[])));
        let err = writer
            .handle_change(file("missing", 1, inode(1)))
            .await
            .unwrap_err();
        assert_eq!(err.phase(), "transfer");
    }

    #[tokio::test]
    async fn test_async_retrieval_error_surfaces_from_wait() {
        let dest = TempDir::new().unwrap();
        let mut writer = DiskWriter::new(dest.path(), Arc::new(MemorySource::new(&[])))
            .with_mode(ContentMode::Async { max_in_flight: 1 });
        writer
            .handle_change(file("missing", 1, inode(1)))
            .await
            .unwrap();
        let err = writer.wait().await.unwrap_err();
        assert!(matches!(err, SyncError::Transfer { .. }));
    }

    #[tokio::test]
    async fn test_out_of_order_change_is_rejected() {
        let dest = TempDir::new().unwrap();
        let mut writer = DiskWriter::new(dest.path(), Arc::new(MemorySource::new(&[])));
        writer.handle_change(dir("b")).await.unwrap();
        let err = writer.handle_change(dir("a")).await.unwrap_err();
        assert!(matches!(err, SyncError::OutOfOrder { .. }));
    }

    #[tokio::test]
    async fn test_deleted_directory_removed_after_children() {
        let dest = TempDir::new().unwrap();
        std::fs::create_dir_all(dest.path().join("a/b")).unwrap();
        std::fs::write(dest.path().join("a/b/c"), "x").unwrap();
        std::fs::write(dest.path().join("z"), "x").unwrap();

        let recorder = Arc::new(Recorder::default());
        let mut writer = DiskWriter::new(dest.path(), Arc::new(MemorySource::new(&[])))
            .with_observer(recorder.clone());
        apply(
            &mut writer,
            vec![
                Change::delete("a"),
                Change::delete("a/b"),
                Change::delete("a/b/c"),
                Change::delete("z"),
            ],
        )
        .await;
        writer.wait().await.unwrap();

        assert_eq!(listing(dest.path()), "");
        assert_eq!(recorder.0.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_delete_does_not_recurse_into_unlisted_entries() {
        let dest = TempDir::new().unwrap();
        std::fs::create_dir(dest.path().join("a")).unwrap();
        std::fs::write(dest.path().join("a/stray"), "x").unwrap();

        let mut writer = DiskWriter::new(dest.path(), Arc::new(MemorySource::new(&[])));
        writer.handle_change(Change::delete("a")).await.unwrap();
        let err = writer.wait().await.unwrap_err();
        assert_eq!(err.phase(), "apply");
        assert!(dest.path().join("a/stray").exists());
    }

    fn mode_of(path: &Path) -> u32 {
        std::fs::symlink_metadata(path).unwrap().mode() & 0o7777
    }

    #[tokio::test]
    async fn test_unchanged_read_only_parent_is_reopened() {
        let dest = TempDir::new().unwrap();
        let ro = dest.path().join("ro");
        std::fs::create_dir(&ro).unwrap();
        std::fs::write(ro.join("old"), "x").unwrap();
        set_mode(&ro, 0o555).await.unwrap();

        let source = Arc::new(MemorySource::new(&[("ro/new", b"fresh")]));
        let mut writer = DiskWriter::new(dest.path(), source);
        apply(
            &mut writer,
            vec![file("ro/new", 5, inode(1)), Change::delete("ro/old")],
        )
        .await;
        assert_eq!(mode_of(&ro) & 0o700, 0o700);
        writer.wait().await.unwrap();

        assert_eq!(std::fs::read(ro.join("new")).unwrap(), b"fresh");
        assert!(!ro.join("old").exists());
        assert_eq!(mode_of(&ro), 0o555);
    }

    #[tokio::test]
    async fn test_reopened_directory_replaced_by_file() {
        let dest = TempDir::new().unwrap();
        let ro = dest.path().join("a");
        std::fs::create_dir(&ro).unwrap();
        std::fs::write(ro.join("x"), "x").unwrap();
        set_mode(&ro, 0o555).await.unwrap();

        let source = Arc::new(MemorySource::new(&[("a", b"file")]));
        let mut writer = DiskWriter::new(dest.path(), source);
        apply(
            &mut writer,
            vec![Change::delete("a"), Change::delete("a/x"), file("a", 4, inode(2))],
        )
        .await;
        writer.wait().await.unwrap();

        assert_eq!(std::fs::read(&ro).unwrap(), b"file");
        assert_eq!(mode_of(&ro), 0o644);
    }

    #[tokio::test]
    async fn test_directory_replaced_by_file() {
        let dest = TempDir::new().unwrap();
        std::fs::create_dir(dest.path().join("a")).unwrap();
        std::fs::write(dest.path().join("a/x"), "x").unwrap();

        let source = Arc::new(MemorySource::new(&[("a", b"now a file")]));
        let mut writer = DiskWriter::new(dest.path(), source);
        apply(
            &mut writer,
            vec![
                Change::delete("a"),
                Change::delete("a/x"),
                file("a", 10, inode(5)),
            ],
        )
        .await;
        writer.wait().await.unwrap();

        assert_eq!(std::fs::read(dest.path().join("a")).unwrap(), b"now a file");
    }

    #[tokio::test]
    async fn test_observer_sees_digests_of_written_bytes() {
        let dest = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder::default());
        let mut writer = DiskWriter::new(dest.path(), scenario_source())
            .with_mode(ContentMode::Async { max_in_flight: 4 })
            .with_observer(recorder.clone());
        apply(&mut writer, scenario()).await;
        writer.wait().await.unwrap();

        let seen = recorder.0.lock().unwrap();
        assert_eq!(seen.len(), 5);
        let digest_of = |p: &str| {
            seen.iter()
                .find(|c| c.path == Path::new(p))
                .and_then(|c| c.digest)
                .unwrap()
        };
        assert_eq!(digest_of("foo"), digest_of("foo2"));

        let mut expected = EntryHasher::new(&scenario()[3].info);
        expected.update(b"mydata");
        assert_eq!(digest_of("foo"), expected.finalize());
    }

    #[tokio::test]
    async fn test_cancellation_abandons_retrievals() {
        let dest = TempDir::new().unwrap();
        let source =
            Arc::new(MemorySource::new(&[("slow", b"x")]).with_delay(Duration::from_secs(30)));
        let cancel = CancellationToken::new();
        let mut writer = DiskWriter::new(dest.path(), source)
            .with_mode(ContentMode::Async { max_in_flight: 1 })
            .with_cancellation(cancel.clone());
        writer.handle_change(file("slow", 1, inode(1))).await.unwrap();

        cancel.cancel();
        let err = tokio::time::timeout(Duration::from_secs(5), writer.wait())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
    }
}
