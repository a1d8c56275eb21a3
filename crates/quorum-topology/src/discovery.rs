//! Discovery provider contract.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::{Node, TopologyError};

/// A membership change observed by a discovery provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A node became reachable
    Joined(Node),
    /// A node left or became unreachable
    Left(Node),
}

/// Source of cluster membership information.
///
/// Providers are external collaborators (DNS, config files, cloud APIs);
/// the core only consumes the snapshot and the event stream.
#[async_trait]
pub trait DiscoveryProvider: Send + Sync + 'static {
    /// Current snapshot of known nodes
    async fn nodes(&self) -> Result<Vec<Node>, TopologyError>;

    /// Subscribe to membership change events
    fn subscribe(&self) -> broadcast::Receiver<PeerEvent>;
}

/// Fixed-membership discovery used for bootstrap configurations.
pub struct StaticDiscovery {
    nodes: Vec<Node>,
    events: broadcast::Sender<PeerEvent>,
}

impl StaticDiscovery {
    /// Create a provider over a fixed member list
    pub fn new(nodes: Vec<Node>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self { nodes, events }
    }

    /// Inject a membership event (test clusters use this to simulate
    /// nodes coming and going).
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl DiscoveryProvider for StaticDiscovery {
    async fn nodes(&self) -> Result<Vec<Node>, TopologyError> {
        Ok(self.nodes.clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_discovery_snapshot_and_events() {
        let provider = StaticDiscovery::new(vec![
            Node::new("a", "127.0.0.1:1"),
            Node::new("b", "127.0.0.1:2"),
        ]);
        let mut events = provider.subscribe();

        let nodes = provider.nodes().await.unwrap();
        assert_eq!(nodes.len(), 2);

        provider.emit(PeerEvent::Left(Node::new("b", "127.0.0.1:2")));
        match events.recv().await.unwrap() {
            PeerEvent::Left(node) => assert_eq!(node.id.as_str(), "b"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
