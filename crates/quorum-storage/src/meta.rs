//! Vote metadata storage.
//!
//! Raft requires `current_term` and `voted_for` to survive restarts; a
//! replica that forgets its vote can grant two votes in one term and break
//! election safety. The record is tiny and rewritten whole on every change.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{StorageNamespace, StorageResult};

/// Durable vote state for one partition replica.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    /// Highest term this replica has seen
    pub current_term: u64,
    /// Candidate voted for in `current_term`, if any
    pub voted_for: Option<String>,
}

/// Store for the per-namespace vote record.
#[async_trait]
pub trait MetaStore: Send + Sync + 'static {
    /// Persist the vote record, crash-atomically replacing the previous one.
    async fn save_vote(&self, namespace: &StorageNamespace, vote: VoteRecord)
        -> StorageResult<()>;

    /// Load the vote record, or `None` if this replica has never voted.
    async fn load_vote(&self, namespace: &StorageNamespace) -> StorageResult<Option<VoteRecord>>;
}

#[async_trait]
impl<T: MetaStore> MetaStore for Arc<T> {
    async fn save_vote(
        &self,
        namespace: &StorageNamespace,
        vote: VoteRecord,
    ) -> StorageResult<()> {
        (**self).save_vote(namespace, vote).await
    }

    async fn load_vote(&self, namespace: &StorageNamespace) -> StorageResult<Option<VoteRecord>> {
        (**self).load_vote(namespace).await
    }
}
