//! Storage abstractions for partition state.
//!
//! Each partition replica owns three durable artifacts: an append-only log
//! of entries, at most one snapshot, and a small vote record holding the
//! current term and the candidate voted for in that term. This crate
//! defines the traits for all three plus the namespace and error types
//! shared by the backends. Backends live in separate crates
//! (`quorum-storage-memory`, `quorum-storage-disk`).

mod log;
mod meta;
mod snapshot;

pub use log::{LogStore, StorageKey};
pub use meta::{MetaStore, VoteRecord};
pub use snapshot::{SnapshotMeta, SnapshotStore};

use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Append did not start at `last_index + 1`
    #[error("out of order append: expected index {expected}, got {actual}")]
    OutOfOrder {
        /// The index the log expected next
        expected: u64,
        /// The index the caller supplied
        actual: u64,
    },

    /// Truncation would remove committed entries
    #[error("cannot truncate at {index}: commit index is {commit_index}")]
    AlreadyCommitted {
        /// Requested truncation point
        index: u64,
        /// The commit index protecting the log
        commit_index: u64,
    },

    /// Stored data failed validation during recovery or read
    #[error("corrupt storage: {0}")]
    Corruption(String),

    /// Storage backend error
    #[error("storage backend error: {0}")]
    Backend(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Entry or namespace not found
    #[error("not found: {0}")]
    NotFound(String),
}

/// A namespace for organizing per-partition data.
///
/// Conventionally `"<group>/<partition>"`; each namespace holds one log,
/// one vote record and at most one snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageNamespace(String);

impl StorageNamespace {
    /// Create a new storage namespace
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the namespace as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for StorageNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Durability level for partition storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageLevel {
    /// No durability; state is lost on restart. Used for test clusters.
    Memory,
    /// On-disk layout without per-append fsync.
    Mapped,
    /// On-disk layout with fsync before append acknowledgement.
    Disk,
}

/// Combined storage surface a partition replica needs.
///
/// Blanket-implemented for anything providing the three stores, so
/// backends only implement the leaf traits.
pub trait StorageAdaptor:
    LogStore + SnapshotStore + MetaStore + Clone + Send + Sync + 'static
{
}

impl<T> StorageAdaptor for T where
    T: LogStore + SnapshotStore + MetaStore + Clone + Send + Sync + 'static
{
}
