//! Error types shared by every treesync component.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while walking, diffing, applying or transferring a tree.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Stat or read failure on a source entry.
    #[error("walk failed at {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Directory traversal failure reported by the walker.
    #[error("walk failed: {0}")]
    WalkTraversal(#[from] ignore::Error),

    /// Invalid include/exclude pattern.
    #[error("invalid walk pattern: {0}")]
    Pattern(#[source] ignore::Error),

    /// Filesystem operation failure in the destination tree.
    #[error("failed to {op} {path}: {source}")]
    Apply {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Content retrieval for a single path failed.
    #[error("failed to transfer {path}: {message}")]
    Transfer { path: PathBuf, message: String },

    /// Malformed packet or unexpected packet sequence.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The underlying channel failed.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The peer aborted the round.
    #[error("peer reported error: {0}")]
    Remote(String),

    /// A change stream violated path ordering.
    #[error("change stream out of order: {path} after {previous}")]
    OutOfOrder { previous: PathBuf, path: PathBuf },

    /// A content retrieval task panicked or was aborted.
    #[error("content task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("operation cancelled")]
    Cancelled,

    /// Index lookup miss.
    #[error("not found: {0}")]
    NotFound(PathBuf),

    /// Snapshot persistence failure.
    #[error("snapshot state {path}: {message}")]
    Snapshot { path: PathBuf, message: String },

    /// Invalid project configuration.
    #[error("invalid config {path}: {message}")]
    Config { path: PathBuf, message: String },
}

impl SyncError {
    /// Create an apply error for a destination path.
    pub fn apply(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Apply {
            op,
            path: path.into(),
            source,
        }
    }

    /// Create a walk error for a source path.
    pub fn walk(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Walk {
            path: path.into(),
            source,
        }
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Name of the phase that failed.
    #[must_use]
    pub fn phase(&self) -> &'static str {
        match self {
            Self::Walk { .. } | Self::WalkTraversal(_) | Self::Pattern(_) => "walk",
            Self::Apply { .. } | Self::OutOfOrder { .. } => "apply",
            Self::Transfer { .. } | Self::Task(_) => "transfer",
            Self::Protocol(_) | Self::Transport(_) | Self::Remote(_) => "protocol",
            Self::Cancelled => "cancel",
            Self::NotFound(_) => "index",
            Self::Snapshot { .. } => "state",
            Self::Config { .. } => "config",
        }
    }
}

/// Result alias used throughout treesync.
pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_names() {
        let err = SyncError::apply("mkdir", "a/b", std::io::Error::other("boom"));
        assert_eq!(err.phase(), "apply");
        assert_eq!(err.to_string(), "failed to mkdir a/b: boom");

        assert_eq!(SyncError::protocol("bad").phase(), "protocol");
        assert_eq!(SyncError::Cancelled.phase(), "cancel");
        assert_eq!(SyncError::NotFound("x".into()).phase(), "index");
    }
}
