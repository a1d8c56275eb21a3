//! Topology management.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{DiscoveryProvider, Node, NodeId, PeerEvent, TopologyError};

/// Default refresh interval for topology updates
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Configuration for the topology manager
#[derive(Clone)]
pub struct TopologyManagerConfig {
    /// Interval at which to re-poll the discovery snapshot
    pub refresh_interval: Duration,
}

impl Default for TopologyManagerConfig {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }
}

struct RunningState {
    refresh_task: Option<JoinHandle<()>>,
    shutdown_signal: Option<oneshot::Sender<()>>,
}

/// Caches the discovery view and rebroadcasts membership changes.
///
/// The manager diffs periodic snapshots against its cache and forwards the
/// provider's own event stream, so consumers see a single `PeerEvent`
/// subscription regardless of how the provider reports changes.
pub struct TopologyManager<D>
where
    D: DiscoveryProvider,
{
    node_id: NodeId,
    provider: Arc<D>,
    cached_nodes: Arc<RwLock<HashMap<NodeId, Node>>>,
    events: broadcast::Sender<PeerEvent>,
    running: Arc<RwLock<RunningState>>,
    config: TopologyManagerConfig,
}

impl<D> TopologyManager<D>
where
    D: DiscoveryProvider,
{
    /// Create a new topology manager with default configuration
    pub fn new(provider: Arc<D>, node_id: NodeId) -> Self {
        Self::with_config(provider, node_id, TopologyManagerConfig::default())
    }

    /// Create a new topology manager with custom configuration
    pub fn with_config(
        provider: Arc<D>,
        node_id: NodeId,
        config: TopologyManagerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            node_id,
            provider,
            cached_nodes: Arc::new(RwLock::new(HashMap::new())),
            events,
            running: Arc::new(RwLock::new(RunningState {
                refresh_task: None,
                shutdown_signal: None,
            })),
            config,
        }
    }

    /// Start the manager: take an initial snapshot and begin refreshing.
    pub async fn start(&self) -> Result<(), TopologyError> {
        info!(node = %self.node_id, "starting topology manager");
        self.refresh().await?;

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let provider = self.provider.clone();
        let cached = self.cached_nodes.clone();
        let events = self.events.clone();
        let interval = self.config.refresh_interval;

        let mut provider_events = self.provider.subscribe();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    event = provider_events.recv() => match event {
                        Ok(event) => {
                            apply_event(&cached, &events, event).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "discovery event stream lagged; resnapshotting");
                            let _ = refresh_snapshot(provider.as_ref(), &cached, &events).await;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = ticker.tick() => {
                        if let Err(e) = refresh_snapshot(provider.as_ref(), &cached, &events).await {
                            warn!("topology refresh failed: {e}");
                        }
                    }
                }
            }
            debug!("topology refresh task stopped");
        });

        let mut running = self.running.write().await;
        running.refresh_task = Some(task);
        running.shutdown_signal = Some(shutdown_tx);
        Ok(())
    }

    /// Shut the manager down, stopping the refresh task.
    pub async fn shutdown(&self) -> Result<(), TopologyError> {
        let mut running = self.running.write().await;
        if let Some(signal) = running.shutdown_signal.take() {
            let _ = signal.send(());
        }
        if let Some(task) = running.refresh_task.take() {
            let _ = task.await;
        }
        Ok(())
    }

    /// This node's ID
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Current cached membership snapshot
    pub async fn nodes(&self) -> Vec<Node> {
        self.cached_nodes.read().await.values().cloned().collect()
    }

    /// Look up a node by ID
    pub async fn get(&self, id: &NodeId) -> Option<Node> {
        self.cached_nodes.read().await.get(id).cloned()
    }

    /// Subscribe to membership change events
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    async fn refresh(&self) -> Result<(), TopologyError> {
        refresh_snapshot(self.provider.as_ref(), &self.cached_nodes, &self.events).await
    }
}

async fn apply_event(
    cached: &RwLock<HashMap<NodeId, Node>>,
    events: &broadcast::Sender<PeerEvent>,
    event: PeerEvent,
) {
    let mut nodes = cached.write().await;
    let changed = match &event {
        PeerEvent::Joined(node) => nodes.insert(node.id.clone(), node.clone()).is_none(),
        PeerEvent::Left(node) => nodes.remove(&node.id).is_some(),
    };
    drop(nodes);
    if changed {
        let _ = events.send(event);
    }
}

async fn refresh_snapshot<D: DiscoveryProvider>(
    provider: &D,
    cached: &RwLock<HashMap<NodeId, Node>>,
    events: &broadcast::Sender<PeerEvent>,
) -> Result<(), TopologyError> {
    let snapshot = provider.nodes().await?;
    let mut nodes = cached.write().await;

    let mut emitted = Vec::new();
    for node in &snapshot {
        if nodes.insert(node.id.clone(), node.clone()).is_none() {
            emitted.push(PeerEvent::Joined(node.clone()));
        }
    }
    let present: std::collections::HashSet<_> = snapshot.iter().map(|n| n.id.clone()).collect();
    let gone: Vec<_> = nodes
        .keys()
        .filter(|id| !present.contains(*id))
        .cloned()
        .collect();
    for id in gone {
        if let Some(node) = nodes.remove(&id) {
            emitted.push(PeerEvent::Left(node));
        }
    }
    drop(nodes);

    for event in emitted {
        debug!(?event, "topology change");
        let _ = events.send(event);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StaticDiscovery;

    #[tokio::test]
    async fn initial_snapshot_is_cached() {
        let provider = Arc::new(StaticDiscovery::new(vec![
            Node::new("a", "127.0.0.1:1"),
            Node::new("b", "127.0.0.1:2"),
        ]));
        let manager = TopologyManager::new(provider, NodeId::new("a"));
        manager.start().await.unwrap();

        let mut nodes = manager.nodes().await;
        nodes.sort_by(|x, y| x.id.cmp(&y.id));
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].id.as_str(), "a");

        manager.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn provider_events_update_cache() {
        let provider = Arc::new(StaticDiscovery::new(vec![Node::new("a", "127.0.0.1:1")]));
        let manager = TopologyManager::new(provider.clone(), NodeId::new("a"));
        manager.start().await.unwrap();

        let mut sub = manager.subscribe();
        provider.emit(PeerEvent::Joined(Node::new("c", "127.0.0.1:3")));

        let event = sub.recv().await.unwrap();
        assert_eq!(event, PeerEvent::Joined(Node::new("c", "127.0.0.1:3")));
        assert!(manager.get(&NodeId::new("c")).await.is_some());

        manager.shutdown().await.unwrap();
    }
}
