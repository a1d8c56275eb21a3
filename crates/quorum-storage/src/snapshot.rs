//! Snapshot storage.
//!
//! A snapshot materializes state-machine state after applying a given log
//! index. Saving a snapshot must be crash-atomic: a reader either observes
//! the previous snapshot or the complete new one, never a torn write.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{StorageNamespace, StorageResult};

/// Metadata identifying a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Log index the snapshot covers (state after applying this entry)
    pub index: u64,
    /// Term of the entry at `index`
    pub term: u64,
    /// Timestamp of the entry at `index`, in milliseconds
    pub timestamp: i64,
}

/// Store holding at most one snapshot per namespace.
#[async_trait]
pub trait SnapshotStore: Send + Sync + 'static {
    /// Persist a snapshot, replacing any previous one. Must be crash-atomic
    /// (write-then-rename for durable backends).
    async fn save_snapshot(
        &self,
        namespace: &StorageNamespace,
        meta: SnapshotMeta,
        data: Bytes,
    ) -> StorageResult<()>;

    /// Load the current snapshot, if any.
    async fn load_snapshot(
        &self,
        namespace: &StorageNamespace,
    ) -> StorageResult<Option<(SnapshotMeta, Bytes)>>;
}

#[async_trait]
impl<T: SnapshotStore> SnapshotStore for Arc<T> {
    async fn save_snapshot(
        &self,
        namespace: &StorageNamespace,
        meta: SnapshotMeta,
        data: Bytes,
    ) -> StorageResult<()> {
        (**self).save_snapshot(namespace, meta, data).await
    }

    async fn load_snapshot(
        &self,
        namespace: &StorageNamespace,
    ) -> StorageResult<Option<(SnapshotMeta, Bytes)>> {
        (**self).load_snapshot(namespace).await
    }
}
