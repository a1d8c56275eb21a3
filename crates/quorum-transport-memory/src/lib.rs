//! In-process transport for test clusters.
//!
//! All nodes register with a shared [`MemoryHub`]; envelopes are delivered
//! over per-node channels. The hub can sever individual links or isolate a
//! node entirely, which is how tests simulate network partitions: severed
//! links silently drop envelopes in both directions, exactly like a
//! partitioned network (the sender still sees a successful send).

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use futures::Stream;
use quorum_topology::NodeId;
use quorum_transport::{Transport, TransportEnvelope, TransportError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

const MAILBOX_CAPACITY: usize = 1024;

struct HubInner {
    mailboxes: DashMap<NodeId, mpsc::Sender<TransportEnvelope>>,
    severed: DashSet<(NodeId, NodeId)>,
}

/// Shared in-process message hub.
#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                mailboxes: DashMap::new(),
                severed: DashSet::new(),
            }),
        }
    }

    /// Register a node, returning its transport endpoint.
    ///
    /// Re-registering an ID replaces the previous endpoint (a restarted
    /// node takes over its mailbox).
    pub fn register(&self, node_id: NodeId) -> MemoryTransport {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        self.inner.mailboxes.insert(node_id.clone(), tx);
        MemoryTransport {
            hub: self.inner.clone(),
            node_id,
            incoming: std::sync::Mutex::new(Some(rx)),
        }
    }

    /// Sever the link between two nodes in both directions.
    pub fn sever(&self, a: &NodeId, b: &NodeId) {
        self.inner.severed.insert((a.clone(), b.clone()));
        self.inner.severed.insert((b.clone(), a.clone()));
    }

    /// Restore a previously severed link.
    pub fn heal(&self, a: &NodeId, b: &NodeId) {
        self.inner.severed.remove(&(a.clone(), b.clone()));
        self.inner.severed.remove(&(b.clone(), a.clone()));
    }

    /// Sever every link touching `node` (full isolation).
    pub fn isolate(&self, node: &NodeId) {
        for entry in self.inner.mailboxes.iter() {
            if entry.key() != node {
                self.sever(node, entry.key());
            }
        }
    }

    /// Restore every link touching `node`.
    pub fn rejoin(&self, node: &NodeId) {
        let links: Vec<_> = self
            .inner
            .severed
            .iter()
            .filter(|pair| &pair.key().0 == node || &pair.key().1 == node)
            .map(|pair| pair.key().clone())
            .collect();
        for (a, b) in links {
            self.inner.severed.remove(&(a, b));
        }
    }

    /// Drop a node's mailbox (a stopped node).
    pub fn deregister(&self, node: &NodeId) {
        self.inner.mailboxes.remove(node);
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One node's endpoint on a [`MemoryHub`].
pub struct MemoryTransport {
    hub: Arc<HubInner>,
    node_id: NodeId,
    incoming: std::sync::Mutex<Option<mpsc::Receiver<TransportEnvelope>>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_envelope(
        &self,
        recipient: &NodeId,
        payload: Bytes,
        message_type: &str,
        correlation_id: Option<Uuid>,
    ) -> Result<(), TransportError> {
        if self
            .hub
            .severed
            .contains(&(self.node_id.clone(), recipient.clone()))
        {
            // Partitioned links swallow traffic; the failure surfaces as a
            // timeout upstream, matching real network behavior.
            return Ok(());
        }
        let Some(mailbox) = self.hub.mailboxes.get(recipient).map(|m| m.clone()) else {
            return Err(TransportError::Unreachable(recipient.clone()));
        };
        let envelope = TransportEnvelope {
            correlation_id,
            message_type: message_type.to_string(),
            payload,
            sender: self.node_id.clone(),
        };
        mailbox
            .send(envelope)
            .await
            .map_err(|_| TransportError::Unreachable(recipient.clone()))
    }

    fn incoming(&self) -> Pin<Box<dyn Stream<Item = TransportEnvelope> + Send>> {
        let rx = self
            .incoming
            .lock()
            .expect("incoming mutex poisoned")
            .take()
            .expect("incoming() may only be called once");
        Box::pin(ReceiverStream::new(rx))
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        self.hub.mailboxes.remove(&self.node_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn delivers_between_registered_nodes() {
        let hub = MemoryHub::new();
        let a = hub.register(NodeId::new("a"));
        let b = hub.register(NodeId::new("b"));
        let mut incoming = b.incoming();

        a.send_envelope(&NodeId::new("b"), Bytes::from("hello"), "test", None)
            .await
            .unwrap();

        let envelope = incoming.next().await.unwrap();
        assert_eq!(envelope.sender, NodeId::new("a"));
        assert_eq!(envelope.payload, Bytes::from("hello"));
        assert_eq!(envelope.message_type, "test");
    }

    #[tokio::test]
    async fn severed_links_drop_traffic() {
        let hub = MemoryHub::new();
        let a = hub.register(NodeId::new("a"));
        let b = hub.register(NodeId::new("b"));
        let mut incoming = b.incoming();

        hub.sever(&NodeId::new("a"), &NodeId::new("b"));
        a.send_envelope(&NodeId::new("b"), Bytes::from("lost"), "test", None)
            .await
            .unwrap();

        hub.heal(&NodeId::new("a"), &NodeId::new("b"));
        a.send_envelope(&NodeId::new("b"), Bytes::from("found"), "test", None)
            .await
            .unwrap();

        let envelope = incoming.next().await.unwrap();
        assert_eq!(envelope.payload, Bytes::from("found"));
    }

    #[tokio::test]
    async fn unknown_recipient_is_unreachable() {
        let hub = MemoryHub::new();
        let a = hub.register(NodeId::new("a"));
        let err = a
            .send_envelope(&NodeId::new("ghost"), Bytes::new(), "test", None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));
    }
}
