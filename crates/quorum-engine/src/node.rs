//! Node assembly.
//!
//! A [`QuorumNode`] composes the topology manager, the network manager,
//! the partition group manager and a client; there is no inheritance
//! anywhere, just values holding values. Discovery events remain advisory:
//! they are surfaced on an event bus for operators and tooling, while
//! partition voter sets change only through committed configuration
//! entries (see [`QuorumClient::reconfigure`]).

use std::sync::Arc;

use quorum_network::NetworkManager;
use quorum_storage::StorageAdaptor;
use quorum_topology::{DiscoveryProvider, Node, NodeId, PeerEvent, TopologyManager};
use quorum_transport::Transport;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::client::QuorumClient;
use crate::config::NodeConfig;
use crate::error::ConsensusResult;
use crate::foundation::{EventBus, PartitionRef};
use crate::partition::PartitionGroupManager;
use crate::raft::ReplicaHandle;
use crate::service::ServiceRegistry;

/// One cluster node: topology + messaging + partition replicas + client.
pub struct QuorumNode<S, T, D>
where
    S: StorageAdaptor,
    T: Transport,
    D: DiscoveryProvider,
{
    node: Node,
    topology: Arc<TopologyManager<D>>,
    network: NetworkManager<T>,
    groups: PartitionGroupManager<S, T>,
    client: QuorumClient<T>,
    membership: Arc<EventBus<PeerEvent>>,
    membership_task: Option<JoinHandle<()>>,
}

impl<S, T, D> QuorumNode<S, T, D>
where
    S: StorageAdaptor,
    T: Transport,
    D: DiscoveryProvider,
{
    /// Assemble a node. Nothing runs until [`start`](Self::start).
    pub fn new(
        config: NodeConfig,
        storage: S,
        transport: Arc<T>,
        discovery: Arc<D>,
        registry: ServiceRegistry,
    ) -> Self {
        let node = config.node.clone();
        let member_ids: Vec<NodeId> = config.members.iter().map(|m| m.id.clone()).collect();
        let engine = config.engine.with_management_group(member_ids);

        let topology = Arc::new(TopologyManager::new(discovery, node.id.clone()));
        let network = NetworkManager::new(node.id.clone(), transport);
        let groups = PartitionGroupManager::new(
            node.id.clone(),
            engine.clone(),
            storage,
            network.clone(),
            registry,
        );
        let client = QuorumClient::new(node.id.clone(), network.clone(), &engine);

        Self {
            node,
            topology,
            network,
            groups,
            client,
            membership: Arc::new(EventBus::default()),
            membership_task: None,
        }
    }

    /// This node's identity
    pub fn node_id(&self) -> &NodeId {
        &self.node.id
    }

    /// The embedded client
    pub fn client(&self) -> &QuorumClient<T> {
        &self.client
    }

    /// Advisory membership events observed by discovery
    pub fn membership(&self) -> &EventBus<PeerEvent> {
        &self.membership
    }

    /// Local replica handle for a partition, if this node hosts one.
    /// Used by monitoring and tests.
    pub fn replica(&self, partition: &PartitionRef) -> Option<ReplicaHandle> {
        self.groups
            .directory()
            .get(partition)
            .map(|handle| handle.value().clone())
    }

    /// Start topology, messaging and partition replicas.
    pub async fn start(&mut self) -> ConsensusResult<()> {
        info!(node = %self.node.id, "starting node");
        self.topology.start().await?;
        self.groups.register_services();
        self.network.start().await;
        self.groups.start().await?;

        let mut events = self.topology.subscribe();
        let bus = self.membership.clone();
        self.membership_task = Some(tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                debug!(?event, "cluster membership change");
                bus.publish(event);
            }
        }));
        Ok(())
    }

    /// Stop replicas, messaging and topology.
    pub async fn stop(&mut self) -> ConsensusResult<()> {
        info!(node = %self.node.id, "stopping node");
        if let Some(task) = self.membership_task.take() {
            task.abort();
        }
        self.groups.stop().await;
        self.network.shutdown().await.map_err(crate::error::Error::from)?;
        self.topology.shutdown().await?;
        Ok(())
    }
}
