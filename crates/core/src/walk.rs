//! Ordered directory walking with the `ignore` crate
//!
//! The walker yields one [`Stat`] per directory, regular file and symlink below
//! the root, depth-first with entries sorted by name. That order is the path
//! order every other component relies on.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use ignore::overrides::{Override, OverrideBuilder};
use ignore::{DirEntry, WalkBuilder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{Result, SyncError};
use crate::stat::{ContentIdentity, FileInfo, Stat};

/// Predicate deciding whether a path (relative to the root) is walked.
///
/// The second argument is true for directories; rejecting a directory prunes
/// its whole subtree.
pub type PathFilter = Arc<dyn Fn(&Path, bool) -> bool + Send + Sync>;

/// Walker for directory trees
#[derive(Clone)]
pub struct Walker {
    root: PathBuf,
    /// Glob patterns excluded from the walk
    excludes: Vec<String>,
    /// Glob patterns a regular file must match, if any are given
    includes: Vec<String>,
    /// Respect .gitignore files below the root
    git_ignore: bool,
    filter: Option<PathFilter>,
}

impl fmt::Debug for Walker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Walker")
            .field("root", &self.root)
            .field("excludes", &self.excludes)
            .field("includes", &self.includes)
            .field("git_ignore", &self.git_ignore)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

impl Walker {
    /// Create a walker for the given root directory
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            excludes: Vec::new(),
            includes: Vec::new(),
            git_ignore: false,
            filter: None,
        }
    }

    /// Exclude paths matching a glob pattern
    #[must_use]
    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.excludes.push(pattern.into());
        self
    }

    /// Only walk regular files matching a glob pattern
    #[must_use]
    pub fn include(mut self, pattern: impl Into<String>) -> Self {
        self.includes.push(pattern.into());
        self
    }

    /// Respect `.gitignore`, `.git/info/exclude` and the global gitignore
    #[must_use]
    pub fn git_ignore(mut self, enabled: bool) -> Self {
        self.git_ignore = enabled;
        self
    }

    /// Install an arbitrary path filter
    #[must_use]
    pub fn filter(mut self, filter: impl Fn(&Path, bool) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Build an override matcher for the include/exclude patterns
    fn overrides(&self) -> Result<Option<Override>> {
        if self.excludes.is_empty() && self.includes.is_empty() {
            return Ok(None);
        }

        let mut overrides = OverrideBuilder::new(&self.root);
        for pattern in &self.includes {
            overrides.add(pattern).map_err(SyncError::Pattern)?;
        }
        for pattern in &self.excludes {
            overrides
                .add(&format!("!{pattern}"))
                .map_err(SyncError::Pattern)?;
        }
        Ok(Some(overrides.build().map_err(SyncError::Pattern)?))
    }

    /// Create a configured walk builder
    fn walk_builder(&self) -> Result<WalkBuilder> {
        let mut builder = WalkBuilder::new(&self.root);
        builder
            .standard_filters(false)
            .follow_links(false)
            .sort_by_file_name(|a, b| a.cmp(b));

        if self.git_ignore {
            builder
                .git_ignore(true)
                .git_global(true)
                .git_exclude(true)
                .require_git(false);
        }

        if let Some(overrides) = self.overrides()? {
            builder.overrides(overrides);
        }

        let root = self.root.clone();
        let git_ignore = self.git_ignore;
        let filter = self.filter.clone();
        builder.filter_entry(move |entry: &DirEntry| {
            if entry.depth() == 0 {
                return true;
            }
            if git_ignore && entry.file_name() == ".git" {
                return false;
            }
            match &filter {
                Some(filter) => {
                    let relative = entry.path().strip_prefix(&root).unwrap_or(entry.path());
                    let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
                    filter(relative, is_dir)
                }
                None => true,
            }
        });

        Ok(builder)
    }

    /// Start a lazy walk.
    ///
    /// The returned iterator stops after the first error it yields.
    ///
    /// # Errors
    /// Returns an error if the root is not a directory or a pattern is invalid
    pub fn iter(&self) -> Result<WalkIter> {
        let metadata =
            std::fs::metadata(&self.root).map_err(|e| SyncError::walk(&self.root, e))?;
        if !metadata.is_dir() {
            return Err(SyncError::walk(
                &self.root,
                std::io::Error::other("not a directory"),
            ));
        }

        Ok(WalkIter {
            root: self.root.clone(),
            inner: self.walk_builder()?.build(),
            links: HashMap::new(),
            #[cfg(not(unix))]
            sequence: 0,
            done: false,
        })
    }

    /// Walk the tree, calling `f` for every entry in path order.
    ///
    /// # Errors
    /// Returns the first walk error, the first error returned by `f`, or
    /// [`SyncError::Cancelled`] once `cancel` fires
    pub fn walk<F>(&self, cancel: &CancellationToken, mut f: F) -> Result<()>
    where
        F: FnMut(Stat) -> Result<()>,
    {
        debug!("Walking {}", self.root.display());
        let mut count = 0usize;
        for stat in self.iter()? {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            f(stat?)?;
            count += 1;
        }
        debug!("Walked {count} entries under {}", self.root.display());
        Ok(())
    }

    /// Walk the tree and collect the listing
    ///
    /// # Errors
    /// See [`Walker::walk`]
    pub fn collect(&self, cancel: &CancellationToken) -> Result<Vec<Stat>> {
        let mut stats = Vec::new();
        self.walk(cancel, |stat| {
            stats.push(stat);
            Ok(())
        })?;
        Ok(stats)
    }
}

/// Lazy, non-restartable walk over a tree
pub struct WalkIter {
    root: PathBuf,
    inner: ignore::Walk,
    /// First path seen for each multiply-linked (dev, ino)
    links: HashMap<(u64, u64), PathBuf>,
    #[cfg(not(unix))]
    sequence: u64,
    done: bool,
}

impl Iterator for WalkIter {
    type Item = Result<Stat>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            };

            if entry.depth() == 0 {
                continue;
            }

            match self.stat_entry(entry.path()) {
                Ok(Some(stat)) => return Some(Ok(stat)),
                Ok(None) => {}
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

impl WalkIter {
    fn stat_entry(&mut self, path: &Path) -> Result<Option<Stat>> {
        let relative = path
            .strip_prefix(&self.root)
            .map_err(|_| SyncError::walk(path, std::io::Error::other("outside of walk root")))?
            .to_path_buf();

        let metadata = std::fs::symlink_metadata(path).map_err(|e| SyncError::walk(path, e))?;
        let file_type = metadata.file_type();

        let info = if file_type.is_symlink() {
            let target = std::fs::read_link(path).map_err(|e| SyncError::walk(path, e))?;
            FileInfo::Symlink { target }
        } else if file_type.is_dir() {
            FileInfo::Directory {
                mode: permission_bits(&metadata),
            }
        } else if file_type.is_file() {
            FileInfo::File {
                mode: permission_bits(&metadata),
                size: metadata.len(),
                modified: modified_nanos(&metadata),
                identity: self.identity(&relative, &metadata),
            }
        } else {
            trace!("Skipping special file {}", relative.display());
            return Ok(None);
        };

        Ok(Some(Stat::new(relative, info)))
    }

    #[cfg(unix)]
    fn identity(&mut self, relative: &Path, metadata: &std::fs::Metadata) -> ContentIdentity {
        use std::os::unix::fs::MetadataExt;

        let key = (metadata.dev(), metadata.ino());
        if metadata.nlink() > 1 {
            if let Some(first) = self.links.get(&key) {
                return ContentIdentity::HardLink(first.clone());
            }
            self.links.insert(key, relative.to_path_buf());
        }
        ContentIdentity::Inode {
            dev: key.0,
            ino: key.1,
        }
    }

    #[cfg(not(unix))]
    fn identity(&mut self, _relative: &Path, _metadata: &std::fs::Metadata) -> ContentIdentity {
        self.sequence += 1;
        ContentIdentity::Inode {
            dev: 0,
            ino: self.sequence,
        }
    }
}

#[cfg(unix)]
fn permission_bits(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(metadata: &std::fs::Metadata) -> u32 {
    match (metadata.is_dir(), metadata.permissions().readonly()) {
        (true, _) => 0o755,
        (false, true) => 0o444,
        (false, false) => 0o644,
    }
}

fn modified_nanos(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
}

/// Render one entry as a listing line
///
/// ```text
/// dir bar
/// file bar/foo
/// symlink:../foo bar/foo2
/// file foo2 >foo
/// ```
#[must_use]
pub fn format_listing(stat: &Stat) -> String {
    let path = stat.path.display();
    match &stat.info {
        FileInfo::Symlink { target } => format!("symlink:{} {path}", target.display()),
        FileInfo::File {
            identity: ContentIdentity::HardLink(first),
            ..
        } => format!("file {path} >{}", first.display()),
        info => format!("{} {path}", info.type_name()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn listing(walker: &Walker) -> String {
        walker
            .collect(&CancellationToken::new())
            .unwrap()
            .iter()
            .map(|s| format_listing(s) + "\n")
            .collect()
    }

    #[test]
    fn test_walk_order_is_depth_first_by_name() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("a-b"), "x").unwrap();
        fs::write(dir.path().join("a/b/c"), "x").unwrap();
        fs::write(dir.path().join("a/z"), "x").unwrap();
        fs::write(dir.path().join("B"), "x").unwrap();

        let stats = Walker::new(dir.path())
            .collect(&CancellationToken::new())
            .unwrap();
        let paths: Vec<_> = stats.iter().map(|s| s.path.clone()).collect();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("B"),
                PathBuf::from("a"),
                PathBuf::from("a/b"),
                PathBuf::from("a/b/c"),
                PathBuf::from("a/z"),
                PathBuf::from("a-b"),
            ]
        );
        assert!(paths.windows(2).all(|w| w[0] < w[1]));
    }

    #[cfg(unix)]
    #[test]
    fn test_walk_reports_symlinks_and_hardlinks() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("bar")).unwrap();
        fs::write(dir.path().join("bar/foo"), "").unwrap();
        std::os::unix::fs::symlink("../foo", dir.path().join("bar/foo2")).unwrap();
        fs::write(dir.path().join("foo"), "mydata").unwrap();
        fs::hard_link(dir.path().join("foo"), dir.path().join("foo2")).unwrap();

        assert_eq!(
            listing(&Walker::new(dir.path())),
            "dir bar\nfile bar/foo\nsymlink:../foo bar/foo2\nfile foo\nfile foo2 >foo\n"
        );
    }

    #[test]
    fn test_file_metadata() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("data"), "12345").unwrap();

        let stats = Walker::new(dir.path())
            .collect(&CancellationToken::new())
            .unwrap();
        match &stats[0].info {
            FileInfo::File { size, modified, .. } => {
                assert_eq!(*size, 5);
                assert!(*modified > 0);
            }
            other => panic!("expected file, got {other:?}"),
        }
    }

    #[test]
    fn test_exclude_prunes_subtree() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("target/debug")).unwrap();
        fs::write(dir.path().join("target/debug/bin"), "x").unwrap();
        fs::write(dir.path().join("keep.txt"), "x").unwrap();
        fs::write(dir.path().join("skip.log"), "x").unwrap();

        let walker = Walker::new(dir.path()).exclude("target").exclude("*.log");
        assert_eq!(listing(&walker), "file keep.txt\n");
    }

    #[test]
    fn test_include_restricts_files_but_keeps_directories() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/lib.rs"), "x").unwrap();
        fs::write(dir.path().join("src/notes.md"), "x").unwrap();

        let walker = Walker::new(dir.path()).include("*.rs");
        assert_eq!(listing(&walker), "dir src\nfile src/lib.rs\n");
    }

    #[test]
    fn test_custom_filter() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("skip")).unwrap();
        fs::write(dir.path().join("skip/inner"), "x").unwrap();
        fs::write(dir.path().join("keep"), "x").unwrap();

        let walker =
            Walker::new(dir.path()).filter(|path, is_dir| !(is_dir && path == Path::new("skip")));
        assert_eq!(listing(&walker), "file keep\n");
    }

    #[test]
    fn test_git_ignore_is_opt_in() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(".gitignore"), "*.tmp\n").unwrap();
        fs::write(dir.path().join("a.tmp"), "x").unwrap();

        assert_eq!(
            listing(&Walker::new(dir.path())),
            "file .gitignore\nfile a.tmp\n"
        );
        assert_eq!(
            listing(&Walker::new(dir.path()).git_ignore(true)),
            "file .gitignore\n"
        );
    }

    #[test]
    fn test_missing_root_is_walk_error() {
        let dir = TempDir::new().unwrap();
        let err = Walker::new(dir.path().join("missing"))
            .collect(&CancellationToken::new())
            .unwrap_err();
        assert_eq!(err.phase(), "walk");
    }

    #[test]
    fn test_cancelled_walk() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a"), "x").unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = Walker::new(dir.path()).collect(&cancel).unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
    }
}
