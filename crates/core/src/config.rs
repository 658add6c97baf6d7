//! treesync configuration file parsing (.treesync.toml)

use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};
use crate::protocol::MAX_CHUNK_SIZE;
use crate::walk::Walker;
use crate::writer::ContentMode;

/// Config file name
pub const CONFIG_FILE: &str = ".treesync.toml";

/// Default number of concurrent content retrievals
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default size of a Data packet chunk
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// treesync project configuration
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Globs of paths to leave out; an excluded directory prunes its subtree
    pub exclude: Vec<String>,

    /// If non-empty, only files matching one of these globs are synced
    pub include: Vec<String>,

    /// Honor .gitignore files in the source tree
    pub git_ignore: bool,

    /// Maximum content retrievals in flight on the receiving side
    pub concurrency: usize,

    /// Bytes per Data packet
    pub chunk_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            exclude: Vec::new(),
            include: Vec::new(),
            git_ignore: false,
            concurrency: DEFAULT_CONCURRENCY,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl SyncConfig {
    /// Load config from project root.
    ///
    /// Returns default config if .treesync.toml doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load(root: &Path) -> Result<Self> {
        let config_path = root.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| config_error(&config_path, e))?;
        let config: Self = toml::from_str(&content).map_err(|e| config_error(&config_path, e))?;
        config.validate().map_err(|e| config_error(&config_path, e))?;
        Ok(config)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.concurrency == 0 {
            return Err("concurrency must be at least 1".into());
        }
        if self.chunk_size == 0 {
            return Err("chunk_size must be at least 1".into());
        }
        if self.chunk_size > MAX_CHUNK_SIZE {
            return Err(format!("chunk_size must be at most {MAX_CHUNK_SIZE}"));
        }
        Ok(())
    }

    /// Walker for `root` with this config's patterns applied
    #[must_use]
    pub fn walker(&self, root: impl Into<PathBuf>) -> Walker {
        let mut walker = Walker::new(root).git_ignore(self.git_ignore);
        for pattern in &self.exclude {
            walker = walker.exclude(pattern.clone());
        }
        for pattern in &self.include {
            walker = walker.include(pattern.clone());
        }
        walker
    }

    /// Content retrieval mode for receivers
    #[must_use]
    pub fn content_mode(&self) -> ContentMode {
        ContentMode::Async {
            max_in_flight: self.concurrency,
        }
    }
}

fn config_error(path: &Path, message: impl ToString) -> SyncError {
    SyncError::Config {
        path: path.to_path_buf(),
        message: message.to_string(),
    }
}
