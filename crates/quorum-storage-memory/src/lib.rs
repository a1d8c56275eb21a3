//! In-memory storage backend.
//!
//! Backs the `memory` storage level: no durability, used for test clusters
//! and ephemeral partitions. Logs are `BTreeMap`s for ordered range scans,
//! with a bounds cache maintained on every mutation.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use quorum_storage::{
    LogStore, MetaStore, SnapshotMeta, SnapshotStore, StorageError, StorageNamespace,
    StorageResult, VoteRecord,
};
use tokio::sync::RwLock;

/// Type aliases to reduce type complexity
type Logs = Arc<RwLock<HashMap<StorageNamespace, BTreeMap<u64, Bytes>>>>;
type Bounds = Arc<RwLock<HashMap<StorageNamespace, (u64, u64)>>>;
type Snapshots = Arc<RwLock<HashMap<StorageNamespace, (SnapshotMeta, Bytes)>>>;
type Votes = Arc<RwLock<HashMap<StorageNamespace, VoteRecord>>>;

/// In-memory storage implementing the log, snapshot and vote stores.
#[derive(Clone)]
pub struct MemoryStorage {
    /// Log storage: namespace -> (index -> bytes)
    logs: Logs,
    /// Log bounds cache: namespace -> (first_index, last_index)
    bounds: Bounds,
    /// At most one snapshot per namespace
    snapshots: Snapshots,
    /// Vote records
    votes: Votes,
}

impl MemoryStorage {
    /// Create a new in-memory storage instance
    pub fn new() -> Self {
        Self {
            logs: Arc::new(RwLock::new(HashMap::new())),
            bounds: Arc::new(RwLock::new(HashMap::new())),
            snapshots: Arc::new(RwLock::new(HashMap::new())),
            votes: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogStore for MemoryStorage {
    async fn append(
        &self,
        namespace: &StorageNamespace,
        entries: Vec<(u64, Bytes)>,
    ) -> StorageResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut logs = self.logs.write().await;
        let mut bounds = self.bounds.write().await;

        let first_new = entries[0].0;
        if let Some((_, last)) = bounds.get(namespace) {
            if first_new != last + 1 {
                return Err(StorageError::OutOfOrder {
                    expected: last + 1,
                    actual: first_new,
                });
            }
        }

        let btree = logs.entry(namespace.clone()).or_default();
        let mut last_index = first_new;
        for (i, (index, data)) in entries.into_iter().enumerate() {
            let expected = first_new + i as u64;
            if index != expected {
                return Err(StorageError::OutOfOrder {
                    expected,
                    actual: index,
                });
            }
            btree.insert(index, data);
            last_index = index;
        }

        let first = bounds
            .get(namespace)
            .map(|(first, _)| *first)
            .unwrap_or(first_new);
        bounds.insert(namespace.clone(), (first, last_index));

        Ok(())
    }

    async fn bounds(&self, namespace: &StorageNamespace) -> StorageResult<Option<(u64, u64)>> {
        Ok(self.bounds.read().await.get(namespace).copied())
    }

    async fn read(&self, namespace: &StorageNamespace, index: u64) -> StorageResult<Option<Bytes>> {
        let logs = self.logs.read().await;
        Ok(logs.get(namespace).and_then(|b| b.get(&index).cloned()))
    }

    async fn read_range(
        &self,
        namespace: &StorageNamespace,
        start: u64,
        end: u64,
    ) -> StorageResult<Vec<(u64, Bytes)>> {
        let logs = self.logs.read().await;
        match logs.get(namespace) {
            Some(btree) => Ok(btree
                .range(start..end)
                .map(|(&idx, data)| (idx, data.clone()))
                .collect()),
            None => Ok(Vec::new()),
        }
    }

    async fn truncate_after(&self, namespace: &StorageNamespace, index: u64) -> StorageResult<()> {
        let mut logs = self.logs.write().await;
        let mut bounds = self.bounds.write().await;

        if let Some(btree) = logs.get_mut(namespace) {
            btree.retain(|&idx, _| idx <= index);
            match (btree.keys().next().copied(), btree.keys().last().copied()) {
                (Some(first), Some(last)) => {
                    bounds.insert(namespace.clone(), (first, last));
                }
                _ => {
                    bounds.remove(namespace);
                }
            }
        }
        Ok(())
    }

    async fn compact_before(&self, namespace: &StorageNamespace, index: u64) -> StorageResult<()> {
        let mut logs = self.logs.write().await;
        let mut bounds = self.bounds.write().await;

        if let Some(btree) = logs.get_mut(namespace) {
            btree.retain(|&idx, _| idx >= index);
            match (btree.keys().next().copied(), btree.keys().last().copied()) {
                (Some(first), Some(last)) => {
                    bounds.insert(namespace.clone(), (first, last));
                }
                _ => {
                    bounds.remove(namespace);
                }
            }
        }
        Ok(())
    }

    async fn purge(&self, namespace: &StorageNamespace) -> StorageResult<()> {
        self.logs.write().await.remove(namespace);
        self.bounds.write().await.remove(namespace);
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for MemoryStorage {
    async fn save_snapshot(
        &self,
        namespace: &StorageNamespace,
        meta: SnapshotMeta,
        data: Bytes,
    ) -> StorageResult<()> {
        self.snapshots
            .write()
            .await
            .insert(namespace.clone(), (meta, data));
        Ok(())
    }

    async fn load_snapshot(
        &self,
        namespace: &StorageNamespace,
    ) -> StorageResult<Option<(SnapshotMeta, Bytes)>> {
        Ok(self.snapshots.read().await.get(namespace).cloned())
    }
}

#[async_trait]
impl MetaStore for MemoryStorage {
    async fn save_vote(
        &self,
        namespace: &StorageNamespace,
        vote: VoteRecord,
    ) -> StorageResult<()> {
        self.votes.write().await.insert(namespace.clone(), vote);
        Ok(())
    }

    async fn load_vote(&self, namespace: &StorageNamespace) -> StorageResult<Option<VoteRecord>> {
        Ok(self.votes.read().await.get(namespace).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns() -> StorageNamespace {
        StorageNamespace::new("test/0")
    }

    #[tokio::test]
    async fn append_requires_contiguous_indices() {
        let storage = MemoryStorage::new();
        storage
            .append(&ns(), vec![(1, Bytes::from("a")), (2, Bytes::from("b"))])
            .await
            .unwrap();

        let err = storage
            .append(&ns(), vec![(5, Bytes::from("x"))])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::OutOfOrder {
                expected: 3,
                actual: 5
            }
        ));
    }

    #[tokio::test]
    async fn empty_log_accepts_any_starting_index() {
        let storage = MemoryStorage::new();
        storage
            .append(&ns(), vec![(42, Bytes::from("post-snapshot"))])
            .await
            .unwrap();
        assert_eq!(storage.bounds(&ns()).await.unwrap(), Some((42, 42)));
    }

    #[tokio::test]
    async fn truncate_and_compact_update_bounds() {
        let storage = MemoryStorage::new();
        let entries = (1..=10).map(|i| (i, Bytes::from(format!("e{i}")))).collect();
        storage.append(&ns(), entries).await.unwrap();

        storage.truncate_after(&ns(), 7).await.unwrap();
        assert_eq!(storage.bounds(&ns()).await.unwrap(), Some((1, 7)));

        storage.compact_before(&ns(), 4).await.unwrap();
        assert_eq!(storage.bounds(&ns()).await.unwrap(), Some((4, 7)));

        let range = storage.read_range(&ns(), 1, 100).await.unwrap();
        assert_eq!(range.len(), 4);
        assert_eq!(range[0].0, 4);
    }

    #[tokio::test]
    async fn vote_round_trip() {
        let storage = MemoryStorage::new();
        assert!(storage.load_vote(&ns()).await.unwrap().is_none());

        let vote = VoteRecord {
            current_term: 3,
            voted_for: Some("node-2".to_string()),
        };
        storage.save_vote(&ns(), vote.clone()).await.unwrap();
        assert_eq!(storage.load_vote(&ns()).await.unwrap(), Some(vote));
    }
}
