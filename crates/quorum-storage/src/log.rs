//! Append-only log storage.
//!
//! The log stores indexed byte records without knowledge of their contents.
//! Entry framing, terms and commit tracking are the consensus layer's
//! concern; this trait only enforces index contiguity.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{StorageNamespace, StorageResult};

/// A raw key in the storage system, used by backends that co-locate
/// auxiliary records next to the log.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorageKey(pub Bytes);

impl StorageKey {
    /// Create a new storage key from bytes
    pub fn new(key: impl Into<Bytes>) -> Self {
        Self(key.into())
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Append-only log of indexed byte records.
#[async_trait]
pub trait LogStore: Send + Sync + 'static {
    /// Atomically append entries (one or more).
    ///
    /// Fails with `StorageError::OutOfOrder` unless the first entry's index
    /// is `last_index + 1`, or the log is empty (any starting index is
    /// accepted then, which is how a log resumes after snapshot install).
    /// Durable backends must not return before the entries are stable.
    async fn append(
        &self,
        namespace: &StorageNamespace,
        entries: Vec<(u64, Bytes)>,
    ) -> StorageResult<()>;

    /// Current bounds of the log as `(first_index, last_index)`, or `None`
    /// if the log holds no entries.
    async fn bounds(&self, namespace: &StorageNamespace) -> StorageResult<Option<(u64, u64)>>;

    /// Read a single entry by index.
    async fn read(&self, namespace: &StorageNamespace, index: u64) -> StorageResult<Option<Bytes>>;

    /// Read a range of entries `[start, end)`.
    async fn read_range(
        &self,
        namespace: &StorageNamespace,
        start: u64,
        end: u64,
    ) -> StorageResult<Vec<(u64, Bytes)>>;

    /// Remove all entries with index greater than `index`.
    ///
    /// The consensus layer enforces the commit-protection contract before
    /// calling; backends remove unconditionally.
    async fn truncate_after(&self, namespace: &StorageNamespace, index: u64) -> StorageResult<()>;

    /// Remove entries below `index`. Backends may retain a bounded prefix
    /// below the requested point (segment-granularity compaction); the
    /// logical first index is tracked by the consensus layer.
    async fn compact_before(&self, namespace: &StorageNamespace, index: u64) -> StorageResult<()>;

    /// Remove every entry, leaving an empty log that will accept an append
    /// at any starting index. Used when installing a snapshot that
    /// supersedes the whole log.
    async fn purge(&self, namespace: &StorageNamespace) -> StorageResult<()>;
}

#[async_trait]
impl<T: LogStore> LogStore for Arc<T> {
    async fn append(
        &self,
        namespace: &StorageNamespace,
        entries: Vec<(u64, Bytes)>,
    ) -> StorageResult<()> {
        (**self).append(namespace, entries).await
    }

    async fn bounds(&self, namespace: &StorageNamespace) -> StorageResult<Option<(u64, u64)>> {
        (**self).bounds(namespace).await
    }

    async fn read(&self, namespace: &StorageNamespace, index: u64) -> StorageResult<Option<Bytes>> {
        (**self).read(namespace, index).await
    }

    async fn read_range(
        &self,
        namespace: &StorageNamespace,
        start: u64,
        end: u64,
    ) -> StorageResult<Vec<(u64, Bytes)>> {
        (**self).read_range(namespace, start, end).await
    }

    async fn truncate_after(&self, namespace: &StorageNamespace, index: u64) -> StorageResult<()> {
        (**self).truncate_after(namespace, index).await
    }

    async fn compact_before(&self, namespace: &StorageNamespace, index: u64) -> StorageResult<()> {
        (**self).compact_before(namespace, index).await
    }

    async fn purge(&self, namespace: &StorageNamespace) -> StorageResult<()> {
        (**self).purge(namespace).await
    }
}
