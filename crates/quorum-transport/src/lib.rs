//! Generic transport abstraction for node-to-node communication.
//!
//! The messaging plane is transport-agnostic: anything that can deliver an
//! opaque envelope to a peer and surface incoming envelopes as a stream
//! can carry the protocol. Delivery is at-most-once per attempt; request
//! correlation, retries and deduplication are upper-layer concerns.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use quorum_topology::NodeId;
use thiserror::Error;
use uuid::Uuid;

/// Errors from transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer is not reachable
    #[error("peer {0} unreachable")]
    Unreachable(NodeId),

    /// The transport has been shut down
    #[error("transport shut down")]
    Shutdown,

    /// Transport-specific failure
    #[error("transport error: {0}")]
    Other(String),
}

/// Transport-level message envelope
#[derive(Debug, Clone)]
pub struct TransportEnvelope {
    /// Correlation ID for request/response tracking
    pub correlation_id: Option<Uuid>,
    /// Message type tag used for dispatch
    pub message_type: String,
    /// The message payload
    pub payload: Bytes,
    /// The sender of the message
    pub sender: NodeId,
}

/// Transport trait for sending and receiving envelopes.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send an envelope to a specific node. Returns once the envelope is
    /// handed to the wire; delivery is not acknowledged at this layer.
    async fn send_envelope(
        &self,
        recipient: &NodeId,
        payload: Bytes,
        message_type: &str,
        correlation_id: Option<Uuid>,
    ) -> Result<(), TransportError>;

    /// Stream of incoming envelopes addressed to this node.
    fn incoming(&self) -> Pin<Box<dyn Stream<Item = TransportEnvelope> + Send>>;

    /// Shut down the transport.
    async fn shutdown(&self) -> Result<(), TransportError>;
}
