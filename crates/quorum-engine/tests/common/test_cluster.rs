//! Multi-node test cluster over the in-process transport.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use quorum_engine::config::{
    EngineConfig, NetworkConfig, NodeConfig, PartitionGroupConfig, PartitionGroupKind, RaftConfig,
    SessionConfig,
};
use quorum_engine::raft::{ReplicaHandle, ReplicaStatus};
use quorum_engine::{PartitionRef, QuorumClient, QuorumNode, RaftRole, ServiceRegistry};
use quorum_storage::StorageLevel;
use quorum_storage_memory::MemoryStorage;
use quorum_topology::{Node, NodeId, StaticDiscovery};
use quorum_transport_memory::{MemoryHub, MemoryTransport};

pub type TestNode = QuorumNode<MemoryStorage, MemoryTransport, StaticDiscovery>;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Builder for a [`TestCluster`].
pub struct TestClusterBuilder {
    count: usize,
    groups: Vec<(String, u32, usize)>,
    raft: RaftConfig,
    session: SessionConfig,
}

impl TestClusterBuilder {
    /// Add a partition group hosted by every node
    pub fn group(mut self, name: &str, partitions: u32, partition_size: usize) -> Self {
        self.groups
            .push((name.to_string(), partitions, partition_size));
        self
    }

    /// Override the Raft timing configuration
    pub fn raft(mut self, raft: RaftConfig) -> Self {
        self.raft = raft;
        self
    }

    /// Override the session configuration
    pub fn session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    /// Start every node
    pub async fn start(self) -> TestCluster {
        let hub = MemoryHub::new();
        let members: Vec<Node> = (0..self.count)
            .map(|i| Node::new(format!("node-{i}"), format!("memory://node-{i}")))
            .collect();
        let member_ids: Vec<NodeId> = members.iter().map(|m| m.id.clone()).collect();

        let groups: Vec<PartitionGroupConfig> = self
            .groups
            .iter()
            .map(|(name, partitions, partition_size)| PartitionGroupConfig {
                name: name.clone(),
                kind: PartitionGroupKind::Raft {
                    partitions: *partitions,
                    partition_size: *partition_size,
                    storage: StorageLevel::Memory,
                },
                members: member_ids.clone(),
            })
            .collect();

        let engine = EngineConfig {
            raft: self.raft.clone(),
            session: self.session.clone(),
            network: NetworkConfig {
                request_timeout: Duration::from_secs(2),
                operation_timeout: Duration::from_secs(10),
            },
            groups,
        };

        let mut cluster = TestCluster {
            hub,
            members,
            engine,
            nodes: HashMap::new(),
            storages: HashMap::new(),
        };
        for id in member_ids {
            cluster.launch(id).await;
        }
        cluster
    }
}

/// A running cluster of engine nodes wired over a [`MemoryHub`].
pub struct TestCluster {
    pub hub: MemoryHub,
    members: Vec<Node>,
    engine: EngineConfig,
    nodes: HashMap<NodeId, TestNode>,
    storages: HashMap<NodeId, MemoryStorage>,
}

impl TestCluster {
    /// Start building a cluster of `count` nodes
    pub fn builder(count: usize) -> TestClusterBuilder {
        TestClusterBuilder {
            count,
            groups: Vec::new(),
            raft: RaftConfig::default(),
            session: SessionConfig::default(),
        }
    }

    async fn launch(&mut self, id: NodeId) {
        let node = self
            .members
            .iter()
            .find(|m| m.id == id)
            .expect("member exists")
            .clone();
        let storage = self
            .storages
            .entry(id.clone())
            .or_insert_with(MemoryStorage::new)
            .clone();
        let transport = Arc::new(self.hub.register(id.clone()));
        let discovery = Arc::new(StaticDiscovery::new(self.members.clone()));
        let config = NodeConfig {
            node,
            members: self.members.clone(),
            engine: self.engine.clone(),
        };
        let mut node = QuorumNode::new(
            config,
            storage,
            transport,
            discovery,
            ServiceRegistry::with_defaults(),
        );
        node.start().await.expect("node starts");
        self.nodes.insert(id, node);
    }

    /// Node IDs in order
    pub fn ids(&self) -> Vec<NodeId> {
        self.members.iter().map(|m| m.id.clone()).collect()
    }

    /// Currently running node IDs
    pub fn running(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// A node by ID
    pub fn node(&self, id: &NodeId) -> &TestNode {
        self.nodes.get(id).expect("node running")
    }

    /// A node's embedded client
    pub fn client(&self, id: &NodeId) -> &QuorumClient<MemoryTransport> {
        self.node(id).client()
    }

    /// A node's local replica handle for a partition
    pub fn replica(&self, id: &NodeId, partition: &PartitionRef) -> Option<ReplicaHandle> {
        self.nodes.get(id).and_then(|node| node.replica(partition))
    }

    /// Poll replica status on a running node
    pub async fn status(&self, id: &NodeId, partition: &PartitionRef) -> Option<ReplicaStatus> {
        match self.replica(id, partition) {
            Some(handle) => handle.status().await.ok(),
            None => None,
        }
    }

    /// Wait until some running node reports itself leader of the partition
    pub async fn wait_for_leader(&self, partition: &PartitionRef, timeout: Duration) -> NodeId {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            for id in self.running() {
                if let Some(status) = self.status(&id, partition).await {
                    if status.role == RaftRole::Leader {
                        return id;
                    }
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "no leader elected for {partition} within {timeout:?}"
            );
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait until a condition over a replica's status holds
    pub async fn wait_for_status(
        &self,
        id: &NodeId,
        partition: &PartitionRef,
        timeout: Duration,
        predicate: impl Fn(&ReplicaStatus) -> bool,
    ) -> ReplicaStatus {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(status) = self.status(id, partition).await {
                if predicate(&status) {
                    return status;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "status condition not met on {id} for {partition} within {timeout:?}"
            );
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Stop a node (its storage is retained for a later restart)
    pub async fn stop_node(&mut self, id: &NodeId) {
        if let Some(mut node) = self.nodes.remove(id) {
            node.stop().await.expect("node stops");
        }
    }

    /// Restart a previously stopped node with its retained storage
    pub async fn restart_node(&mut self, id: &NodeId) {
        assert!(
            !self.nodes.contains_key(id),
            "node {id} is already running"
        );
        self.launch(id.clone()).await;
    }

    /// Sever the link between two nodes in both directions
    pub fn sever(&self, a: &NodeId, b: &NodeId) {
        self.hub.sever(a, b);
    }

    /// Restore a severed link
    pub fn heal(&self, a: &NodeId, b: &NodeId) {
        self.hub.heal(a, b);
    }

    /// Cut a node off from every peer
    pub fn isolate(&self, id: &NodeId) {
        self.hub.isolate(id);
    }

    /// Reconnect a previously isolated node
    pub fn rejoin(&self, id: &NodeId) {
        self.hub.rejoin(id);
    }

    /// Stop every node
    pub async fn stop_all(&mut self) {
        let ids: Vec<NodeId> = self.nodes.keys().cloned().collect();
        for id in ids {
            self.stop_node(&id).await;
        }
    }
}
