//! treesync-core: Core tree sync engine
//!
//! Provides ordered walking, tree diffing, change application, content
//! hashing, and the packet codec used by sync rounds.

pub mod config;
pub mod diff;
pub mod error;
pub mod hash;
pub mod index;
pub mod protocol;
pub mod snapshot;
pub mod stat;
pub mod walk;
pub mod writer;

pub use config::SyncConfig;
pub use diff::Differ;
pub use error::{Result, SyncError};
pub use hash::{ContentHash, EntryHasher};
pub use index::{ContentHashIndex, IndexRecord};
pub use protocol::Packet;
pub use snapshot::{Snapshot, SnapshotBuilder};
pub use stat::{Change, ChangeKind, ContentIdentity, FileInfo, Stat};
pub use walk::{Walker, format_listing};
pub use writer::{
    AppliedChange, ChangeObserver, ContentMode, ContentSink, ContentSource, DirSource, DiskWriter,
};
