//! Content digests using BLAKE3

use std::fmt;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::stat::FileInfo;

/// A content hash using BLAKE3 (256-bit)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Convert to hex string
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "ContentHash({})", hex.get(..16).unwrap_or(&hex))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "{}", hex.get(..16).unwrap_or(&hex))
    }
}

/// Incremental digest of a tree entry.
///
/// The header (entry type, mode, symlink target) is hashed first, followed by
/// the exact content bytes of regular files. Directories and symlinks are
/// digested from the header alone.
#[derive(Clone)]
pub struct EntryHasher {
    inner: blake3::Hasher,
}

impl EntryHasher {
    #[must_use]
    pub fn new(info: &FileInfo) -> Self {
        let mut inner = blake3::Hasher::new();
        inner.update(info.type_name().as_bytes());
        inner.update(&[0]);
        inner.update(&info.mode().to_be_bytes());
        if let FileInfo::Symlink { target } = info {
            inner.update(target.to_string_lossy().as_bytes());
        }
        inner.update(&[0]);
        Self { inner }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    #[must_use]
    pub fn finalize(&self) -> ContentHash {
        ContentHash(*self.inner.finalize().as_bytes())
    }

    /// Digest of an entry whose content is already on disk
    ///
    /// # Errors
    /// Returns an error if the file cannot be read
    pub fn digest_file(info: &FileInfo, path: &Path) -> std::io::Result<ContentHash> {
        let mut hasher = Self::new(info);
        let mut file = std::fs::File::open(path)?;
        let mut buffer = [0u8; 64 * 1024]; // 64KB buffer

        loop {
            let bytes_read = file.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use crate::stat::ContentIdentity;

    fn file_info(mode: u32) -> FileInfo {
        FileInfo::File {
            mode,
            size: 5,
            modified: 0,
            identity: ContentIdentity::Inode { dev: 1, ino: 2 },
        }
    }

    #[test]
    fn test_display_is_hex_prefix() {
        let hash = EntryHasher::new(&file_info(0o644)).finalize();
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(hash.to_string(), hex[..16]);
    }

    #[test]
    fn test_entry_digest_covers_content_and_header() {
        let mut a = EntryHasher::new(&file_info(0o644));
        a.update(b"data1");
        let mut b = EntryHasher::new(&file_info(0o644));
        b.update(b"data1");
        let mut c = EntryHasher::new(&file_info(0o755));
        c.update(b"data1");

        assert_eq!(a.finalize(), b.finalize());
        assert_ne!(a.finalize(), c.finalize());
    }

    #[test]
    fn test_entry_digest_ignores_mtime_and_identity() {
        let other = FileInfo::File {
            mode: 0o644,
            size: 5,
            modified: 1_700_000_000_000_000_000,
            identity: ContentIdentity::HardLink(PathBuf::from("x")),
        };
        assert_eq!(
            EntryHasher::new(&file_info(0o644)).finalize(),
            EntryHasher::new(&other).finalize()
        );
    }

    #[test]
    fn test_symlink_digest_depends_on_target() {
        let a = FileInfo::Symlink {
            target: PathBuf::from("../foo"),
        };
        let b = FileInfo::Symlink {
            target: PathBuf::from("../bar"),
        };
        assert_ne!(
            EntryHasher::new(&a).finalize(),
            EntryHasher::new(&b).finalize()
        );
    }

    #[test]
    fn test_digest_file_matches_streamed_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"streamed").unwrap();

        let info = file_info(0o644);
        let mut streamed = EntryHasher::new(&info);
        streamed.update(b"stream");
        streamed.update(b"ed");

        assert_eq!(
            EntryHasher::digest_file(&info, &path).unwrap(),
            streamed.finalize()
        );
    }
}
