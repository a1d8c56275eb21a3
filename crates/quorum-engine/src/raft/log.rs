//! Typed partition log.
//!
//! Wraps the byte-oriented [`quorum_storage::LogStore`] with entry
//! framing, commit tracking and compaction. The uncompacted suffix is
//! mirrored in memory (the replica reads it constantly); storage is the
//! durable copy recovered at open.

use std::collections::BTreeMap;

use bytes::Bytes;
use quorum_storage::{SnapshotMeta, StorageAdaptor, StorageError, StorageNamespace};
use tracing::{debug, info};

use crate::error::{ConsensusResult, Error};
use crate::foundation::{LogIndex, Term};
use crate::raft::types::LogEntry;

/// Append-only typed log for one partition replica.
pub struct RaftLog<S: StorageAdaptor> {
    storage: S,
    namespace: StorageNamespace,
    entries: BTreeMap<LogIndex, LogEntry>,
    snapshot: Option<SnapshotMeta>,
    commit_index: LogIndex,
}

impl<S: StorageAdaptor> RaftLog<S> {
    /// Recover the log from storage. Returns the log plus the snapshot
    /// data, if any, so the caller can restore its state machine.
    pub async fn open(
        storage: S,
        namespace: StorageNamespace,
    ) -> ConsensusResult<(Self, Option<(SnapshotMeta, Bytes)>)> {
        let snapshot = storage.load_snapshot(&namespace).await?;
        let snapshot_meta = snapshot.as_ref().map(|(meta, _)| *meta);

        let mut entries = BTreeMap::new();
        if let Some((first, last)) = storage.bounds(&namespace).await? {
            let floor = snapshot_meta.map(|s| s.index).unwrap_or(0);
            let raw = storage.read_range(&namespace, first, last + 1).await?;
            for (index, bytes) in raw {
                if index <= floor && Some(index) != snapshot_meta.map(|s| s.index) {
                    continue;
                }
                let entry: LogEntry = ciborium::de::from_reader(bytes.as_ref())
                    .map_err(|e| Error::storage(format!("log entry {index} decode: {e}")))?;
                if entry.index != index {
                    return Err(Error::storage(format!(
                        "log entry index mismatch: stored at {index}, claims {}",
                        entry.index
                    )));
                }
                entries.insert(index, entry);
            }
        }

        let log = Self {
            storage,
            namespace,
            entries,
            snapshot: snapshot_meta,
            commit_index: snapshot_meta.map(|s| s.index).unwrap_or(0),
        };
        if log.last_index() > 0 {
            info!(
                namespace = %log.namespace,
                first = log.first_index(),
                last = log.last_index(),
                "recovered partition log"
            );
        }
        Ok((log, snapshot))
    }

    /// Index of the earliest entry still in the log (one past the last
    /// compacted when nothing earlier remains)
    pub fn first_index(&self) -> LogIndex {
        self.entries
            .keys()
            .next()
            .copied()
            .unwrap_or_else(|| self.snapshot.map(|s| s.index + 1).unwrap_or(1))
    }

    /// Index of the latest entry, or the snapshot index if the log is empty
    pub fn last_index(&self) -> LogIndex {
        self.entries
            .keys()
            .next_back()
            .copied()
            .unwrap_or_else(|| self.snapshot.map(|s| s.index).unwrap_or(0))
    }

    /// Term of the latest entry
    pub fn last_term(&self) -> Term {
        self.entries
            .values()
            .next_back()
            .map(|e| e.term)
            .unwrap_or_else(|| self.snapshot.map(|s| Term::new(s.term)).unwrap_or_default())
    }

    /// Term of the entry at `index`, if known (from the log or snapshot)
    pub fn term(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(Term::default());
        }
        if let Some(entry) = self.entries.get(&index) {
            return Some(entry.term);
        }
        match self.snapshot {
            Some(snapshot) if snapshot.index == index => Some(Term::new(snapshot.term)),
            _ => None,
        }
    }

    /// First index held by the log with the same term as the entry at
    /// `index`; used for conflict-term fast backoff.
    pub fn first_index_of_term_at(&self, index: LogIndex) -> LogIndex {
        let Some(term) = self.term(index) else {
            return self.first_index();
        };
        let mut first = index;
        for (&i, entry) in self.entries.range(..=index).rev() {
            if entry.term == term {
                first = i;
            } else {
                break;
            }
        }
        first
    }

    /// Get an entry by index
    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        self.entries.get(&index)
    }

    /// Clone entries in `[from, to)`
    pub fn range(&self, from: LogIndex, to: LogIndex) -> Vec<LogEntry> {
        self.entries.range(from..to).map(|(_, e)| e.clone()).collect()
    }

    /// Current commit index
    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    /// Advance the commit index (never beyond the last entry, never
    /// backwards)
    pub fn set_commit_index(&mut self, index: LogIndex) {
        let clamped = index.min(self.last_index());
        if clamped > self.commit_index {
            self.commit_index = clamped;
        }
    }

    /// Latest snapshot metadata
    pub fn snapshot(&self) -> Option<SnapshotMeta> {
        self.snapshot
    }

    /// Append entries, persisting before mirroring in memory.
    ///
    /// The first entry must continue exactly at `last_index + 1`.
    pub async fn append(&mut self, entries: Vec<LogEntry>) -> ConsensusResult<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        let expected = self.last_index() + 1;
        if first.index != expected {
            return Err(StorageError::OutOfOrder {
                expected,
                actual: first.index,
            }
            .into());
        }

        let mut raw = Vec::with_capacity(entries.len());
        for entry in &entries {
            let mut buf = Vec::new();
            ciborium::ser::into_writer(entry, &mut buf)
                .map_err(|e| Error::storage(format!("log entry encode: {e}")))?;
            raw.push((entry.index, Bytes::from(buf)));
        }
        self.storage.append(&self.namespace, raw).await?;

        for entry in entries {
            self.entries.insert(entry.index, entry);
        }
        Ok(())
    }

    /// Remove all entries after `index`. Fails with `AlreadyCommitted` if
    /// that would delete a committed entry.
    pub async fn truncate_after(&mut self, index: LogIndex) -> ConsensusResult<()> {
        if index < self.commit_index {
            return Err(StorageError::AlreadyCommitted {
                index,
                commit_index: self.commit_index,
            }
            .into());
        }
        self.storage.truncate_after(&self.namespace, index).await?;
        self.entries.retain(|&i, _| i <= index);
        Ok(())
    }

    /// Compact the log: durably write the snapshot, then drop entries
    /// below its index. The snapshot is fully durable before any entry is
    /// deleted, so a crash in between recovers with extra log, never with
    /// missing state.
    pub async fn compact(&mut self, meta: SnapshotMeta, data: Bytes) -> ConsensusResult<()> {
        self.storage
            .save_snapshot(&self.namespace, meta, data)
            .await?;
        self.storage
            .compact_before(&self.namespace, meta.index)
            .await?;
        self.entries.retain(|&i, _| i >= meta.index);
        self.snapshot = Some(meta);
        debug!(
            namespace = %self.namespace,
            index = meta.index,
            "compacted log"
        );
        Ok(())
    }

    /// Replace the whole log with an installed snapshot.
    pub async fn reset_to_snapshot(&mut self, meta: SnapshotMeta, data: Bytes) -> ConsensusResult<()> {
        self.storage
            .save_snapshot(&self.namespace, meta, data)
            .await?;
        self.storage.purge(&self.namespace).await?;
        self.entries.clear();
        self.snapshot = Some(meta);
        self.commit_index = meta.index;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::Term;
    use crate::raft::types::EntryPayload;
    use quorum_storage_memory::MemoryStorage;

    fn entry(index: LogIndex, term: u64) -> LogEntry {
        LogEntry {
            index,
            term: Term::new(term),
            timestamp: index as i64 * 10,
            payload: EntryPayload::Initialize,
        }
    }

    async fn open_log(storage: MemoryStorage) -> RaftLog<MemoryStorage> {
        RaftLog::open(storage, StorageNamespace::new("g/0"))
            .await
            .unwrap()
            .0
    }

    #[tokio::test]
    async fn append_and_recover() {
        let storage = MemoryStorage::new();
        {
            let mut log = open_log(storage.clone()).await;
            log.append(vec![entry(1, 1), entry(2, 1), entry(3, 2)])
                .await
                .unwrap();
            assert_eq!(log.last_index(), 3);
            assert_eq!(log.last_term(), Term::new(2));
        }
        let log = open_log(storage).await;
        assert_eq!(log.first_index(), 1);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.term(2), Some(Term::new(1)));
    }

    #[tokio::test]
    async fn append_rejects_gaps() {
        let storage = MemoryStorage::new();
        let mut log = open_log(storage).await;
        log.append(vec![entry(1, 1)]).await.unwrap();
        let err = log.append(vec![entry(3, 1)]).await.unwrap_err();
        assert!(err.to_string().contains("out of order"));
    }

    #[tokio::test]
    async fn truncate_protects_committed_entries() {
        let storage = MemoryStorage::new();
        let mut log = open_log(storage).await;
        log.append((1..=5).map(|i| entry(i, 1)).collect())
            .await
            .unwrap();
        log.set_commit_index(3);

        let err = log.truncate_after(2).await.unwrap_err();
        assert!(err.to_string().contains("commit index"));

        log.truncate_after(4).await.unwrap();
        assert_eq!(log.last_index(), 4);
    }

    #[tokio::test]
    async fn commit_index_is_clamped_and_monotonic() {
        let storage = MemoryStorage::new();
        let mut log = open_log(storage).await;
        log.append(vec![entry(1, 1), entry(2, 1)]).await.unwrap();

        log.set_commit_index(10);
        assert_eq!(log.commit_index(), 2);
        log.set_commit_index(1);
        assert_eq!(log.commit_index(), 2);
    }

    #[tokio::test]
    async fn compact_keeps_tail_readable() {
        let storage = MemoryStorage::new();
        let mut log = open_log(storage.clone()).await;
        log.append((1..=10).map(|i| entry(i, 1)).collect())
            .await
            .unwrap();
        log.set_commit_index(10);

        let meta = SnapshotMeta {
            index: 6,
            term: 1,
            timestamp: 60,
        };
        log.compact(meta, Bytes::from("state")).await.unwrap();

        assert_eq!(log.first_index(), 6);
        assert_eq!(log.last_index(), 10);
        assert!(log.get(7).is_some());
        assert_eq!(log.term(6), Some(Term::new(1)));

        // Recovery from snapshot plus remaining log sees the same bounds.
        let (log, snapshot) = RaftLog::open(storage, StorageNamespace::new("g/0"))
            .await
            .unwrap();
        assert_eq!(snapshot.unwrap().0.index, 6);
        assert_eq!(log.last_index(), 10);
        assert_eq!(log.commit_index(), 6);
    }

    #[tokio::test]
    async fn conflict_term_first_index() {
        let storage = MemoryStorage::new();
        let mut log = open_log(storage).await;
        log.append(vec![
            entry(1, 1),
            entry(2, 1),
            entry(3, 2),
            entry(4, 2),
            entry(5, 3),
        ])
        .await
        .unwrap();

        assert_eq!(log.first_index_of_term_at(4), 3);
        assert_eq!(log.first_index_of_term_at(2), 1);
        assert_eq!(log.first_index_of_term_at(5), 5);
    }

    #[tokio::test]
    async fn reset_to_snapshot_supersedes_log() {
        let storage = MemoryStorage::new();
        let mut log = open_log(storage).await;
        log.append((1..=4).map(|i| entry(i, 1)).collect())
            .await
            .unwrap();

        let meta = SnapshotMeta {
            index: 20,
            term: 5,
            timestamp: 200,
        };
        log.reset_to_snapshot(meta, Bytes::from("installed"))
            .await
            .unwrap();

        assert_eq!(log.first_index(), 21);
        assert_eq!(log.last_index(), 20);
        assert_eq!(log.commit_index(), 20);
        assert_eq!(log.term(20), Some(Term::new(5)));

        log.append(vec![entry(21, 5)]).await.unwrap();
        assert_eq!(log.last_index(), 21);
    }
}
