//! Partition group lifecycle.

use std::sync::Arc;

use dashmap::DashMap;
use quorum_network::NetworkManager;
use quorum_storage::StorageAdaptor;
use quorum_topology::NodeId;
use quorum_transport::Transport;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::ConsensusResult;
use crate::foundation::{PartitionId, PartitionRef};
use crate::raft::{spawn_replica, Configuration, ReplicaHandle, ReplicaOptions};
use crate::service::ServiceRegistry;

use super::server::{
    AppendEntriesService, InstallSnapshotService, QueryService, ReconfigureService,
    ReplicaDirectory, RequestVoteService, SessionEventStreamService, SubmitCommandService,
};
use super::{assign_members, route};

/// Builds and owns this node's partition replicas.
pub struct PartitionGroupManager<S, T>
where
    S: StorageAdaptor,
    T: Transport,
{
    node_id: NodeId,
    config: EngineConfig,
    storage: S,
    network: NetworkManager<T>,
    registry: ServiceRegistry,
    directory: ReplicaDirectory,
}

impl<S, T> PartitionGroupManager<S, T>
where
    S: StorageAdaptor,
    T: Transport,
{
    /// Create a manager; replicas start on [`start`](Self::start).
    pub fn new(
        node_id: NodeId,
        config: EngineConfig,
        storage: S,
        network: NetworkManager<T>,
        registry: ServiceRegistry,
    ) -> Self {
        Self {
            node_id,
            config,
            storage,
            network,
            registry,
            directory: Arc::new(DashMap::new()),
        }
    }

    /// The shared partition → replica directory
    pub fn directory(&self) -> ReplicaDirectory {
        self.directory.clone()
    }

    /// Register the partition RPC handlers. Must run before the network
    /// manager starts dispatching.
    pub fn register_services(&self) {
        self.network.register_service(AppendEntriesService {
            directory: self.directory.clone(),
        });
        self.network.register_service(RequestVoteService {
            directory: self.directory.clone(),
        });
        self.network.register_service(InstallSnapshotService {
            directory: self.directory.clone(),
        });
        self.network.register_service(ReconfigureService {
            directory: self.directory.clone(),
        });
        self.network.register_service(SubmitCommandService {
            directory: self.directory.clone(),
        });
        self.network.register_service(QueryService {
            directory: self.directory.clone(),
        });
        self.network
            .register_streaming(SessionEventStreamService::new(self.directory.clone()));
    }

    /// Spawn a replica for every partition this node hosts.
    pub async fn start(&self) -> ConsensusResult<()> {
        for group in &self.config.groups {
            for partition in 0..group.partitions() {
                let partition_id = PartitionId::new(partition);
                let members = assign_members(group, partition_id);
                if !members.iter().any(|m| m.node == self.node_id) {
                    continue;
                }
                let partition_ref = PartitionRef::new(group.name.clone(), partition_id);
                debug!(
                    partition = %partition_ref,
                    node = %self.node_id,
                    "spawning partition replica"
                );
                let handle = spawn_replica(
                    ReplicaOptions {
                        partition: partition_ref.clone(),
                        node_id: self.node_id.clone(),
                        raft: self.config.raft.clone(),
                        session: self.config.session.clone(),
                        initial_configuration: Configuration::new(members),
                        registry: self.registry.clone(),
                    },
                    self.storage.clone(),
                    self.network.clone(),
                )
                .await?;
                self.directory.insert(partition_ref, handle);
            }
        }
        info!(
            node = %self.node_id,
            replicas = self.directory.len(),
            "partition groups started"
        );
        Ok(())
    }

    /// Shut down every replica this node hosts.
    pub async fn stop(&self) {
        let handles: Vec<ReplicaHandle> = self
            .directory
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for handle in handles {
            handle.shutdown().await;
        }
        self.directory.clear();
    }

    /// Map a primitive name to its partition within a group.
    pub fn partition_for(&self, group: &str, primitive: &str) -> Option<PartitionRef> {
        let group_config = self.config.groups.iter().find(|g| g.name == group)?;
        Some(PartitionRef::new(
            group.to_string(),
            route(primitive, None, group_config.partitions()),
        ))
    }
}
