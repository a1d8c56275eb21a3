//! Engine configuration.

use std::time::Duration;

use quorum_storage::StorageLevel;
use quorum_topology::{Node, NodeId};
use serde::{Deserialize, Serialize};

/// Name of the mandatory management group hosting the primitive directory
pub const MANAGEMENT_GROUP: &str = "system";

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Raft protocol timing and batching
    pub raft: RaftConfig,

    /// Session defaults and caps
    pub session: SessionConfig,

    /// Network timeouts
    pub network: NetworkConfig,

    /// Partition groups hosted by this cluster
    pub groups: Vec<PartitionGroupConfig>,
}

impl EngineConfig {
    /// Ensure the mandatory management group is present, deriving its
    /// membership from the given cluster members when absent.
    pub fn with_management_group(mut self, members: Vec<NodeId>) -> Self {
        if !self.groups.iter().any(|g| g.name == MANAGEMENT_GROUP) {
            self.groups.insert(
                0,
                PartitionGroupConfig {
                    name: MANAGEMENT_GROUP.to_string(),
                    kind: PartitionGroupKind::Raft {
                        partitions: 1,
                        partition_size: members.len().max(1),
                        storage: StorageLevel::Memory,
                    },
                    members,
                },
            );
        }
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            raft: RaftConfig::default(),
            session: SessionConfig::default(),
            network: NetworkConfig::default(),
            groups: Vec::new(),
        }
    }
}

/// Raft protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Election timeout minimum; timers randomize in `[min, max)`
    pub election_timeout_min: Duration,

    /// Election timeout maximum
    pub election_timeout_max: Duration,

    /// Heartbeat interval
    pub heartbeat_interval: Duration,

    /// Take a snapshot after this many applied entries since the last one
    pub snapshot_threshold: u64,

    /// Max entries per append batch
    pub max_entries_per_append: usize,

    /// Snapshot transfer chunk size in bytes
    pub snapshot_chunk_size: usize,
}

impl RaftConfig {
    /// Leader lease for lease-based reads; strictly shorter than the
    /// election timeout so a deposed leader's lease lapses before a new
    /// leader can be elected.
    pub fn leader_lease(&self) -> Duration {
        self.election_timeout_min * 3 / 4
    }

    /// A randomized election timeout in `[min, max)`
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min = self.election_timeout_min.as_millis() as u64;
        let max = self.election_timeout_max.as_millis() as u64;
        let ms = if max > min {
            rand::rng().random_range(min..max)
        } else {
            min
        };
        Duration::from_millis(ms)
    }
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            snapshot_threshold: 1000,
            max_entries_per_append: 64,
            snapshot_chunk_size: 64 * 1024,
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session timeout used when the client does not choose one
    pub default_timeout: Duration,

    /// A session holding more unacknowledged events than this is closed
    pub max_pending_events: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            max_pending_events: 1024,
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Per-attempt request timeout
    pub request_timeout: Duration,

    /// Overall client operation deadline across retries
    pub operation_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(30),
        }
    }
}

/// Partition group configuration.
///
/// The replication kind is a tagged union chosen by the `type` field, so
/// config mappers dispatch over declared variants rather than reflection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionGroupConfig {
    /// Group name; primitives name a group to choose their back-end
    pub name: String,

    /// Replication kind and its parameters
    #[serde(flatten)]
    pub kind: PartitionGroupKind,

    /// Cluster members hosting this group
    pub members: Vec<NodeId>,
}

impl PartitionGroupConfig {
    /// Number of partitions in this group
    pub fn partitions(&self) -> u32 {
        match self.kind {
            PartitionGroupKind::Raft { partitions, .. } => partitions,
        }
    }

    /// Number of voting replicas per partition
    pub fn partition_size(&self) -> usize {
        match self.kind {
            PartitionGroupKind::Raft { partition_size, .. } => partition_size,
        }
    }

    /// Storage level for this group's partitions
    pub fn storage_level(&self) -> StorageLevel {
        match self.kind {
            PartitionGroupKind::Raft { storage, .. } => storage,
        }
    }
}

/// Replication kind of a partition group
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PartitionGroupKind {
    /// Raft-replicated partitions
    Raft {
        /// Number of partitions
        partitions: u32,
        /// Voting replicas per partition
        partition_size: usize,
        /// Durability level
        storage: StorageLevel,
    },
}

/// Identity and cluster bootstrap for one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's identity and address
    pub node: Node,

    /// Bootstrap member list (static discovery)
    pub members: Vec<Node>,

    /// Engine configuration
    pub engine: EngineConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_kind_parses_by_type_tag() {
        let raw = serde_json::json!({
            "name": "data",
            "type": "raft",
            "partitions": 7,
            "partition_size": 3,
            "storage": "memory",
            "members": ["a", "b", "c"]
        });
        let config: PartitionGroupConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(config.name, "data");
        assert_eq!(config.partitions(), 7);
        assert_eq!(config.partition_size(), 3);
        assert_eq!(config.storage_level(), StorageLevel::Memory);
        assert_eq!(config.members.len(), 3);
    }

    #[test]
    fn unknown_group_type_is_rejected() {
        let raw = serde_json::json!({
            "name": "data",
            "type": "primary-backup",
            "partitions": 1,
            "partition_size": 1,
            "storage": "memory",
            "members": []
        });
        assert!(serde_json::from_value::<PartitionGroupConfig>(raw).is_err());
    }

    #[test]
    fn management_group_is_inserted_once() {
        let config = EngineConfig::default()
            .with_management_group(vec![NodeId::new("a")])
            .with_management_group(vec![NodeId::new("a")]);
        let count = config
            .groups
            .iter()
            .filter(|g| g.name == MANAGEMENT_GROUP)
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn lease_is_shorter_than_election_timeout() {
        let raft = RaftConfig::default();
        assert!(raft.leader_lease() < raft.election_timeout_min);
        for _ in 0..32 {
            let t = raft.random_election_timeout();
            assert!(t >= raft.election_timeout_min && t < raft.election_timeout_max);
        }
    }
}
