//! Server-push streams.
//!
//! A stream is opened by a requesting peer and fed by the serving peer: a
//! bounded sequence of frames followed by a close. Used for snapshot-sized
//! payloads and session event push, where a single response would be too
//! large or too late.

use bytes::Bytes;
use quorum_topology::NodeId;
use quorum_transport::Transport;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{NetworkError, NetworkResult};

pub(crate) const STREAM_FRAME: &str = "stream:frame";
pub(crate) const STREAM_CLOSE: &str = "stream:close";

/// Sender half handed to a [`crate::StreamingService`] handler.
pub struct StreamSender {
    pub(crate) id: Uuid,
    pub(crate) peer: NodeId,
    pub(crate) transport: Arc<dyn DynTransport>,
}

impl StreamSender {
    /// The stream's correlation ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Push one frame to the peer
    pub async fn send(&self, frame: Bytes) -> NetworkResult<()> {
        self.transport
            .send(&self.peer, frame, STREAM_FRAME, Some(self.id))
            .await
    }

    /// Close the stream
    pub async fn close(self) -> NetworkResult<()> {
        self.transport
            .send(&self.peer, Bytes::new(), STREAM_CLOSE, Some(self.id))
            .await
    }
}

/// Receiver half returned by [`crate::NetworkManager::open_stream`].
pub struct StreamReceiver {
    pub(crate) id: Uuid,
    pub(crate) frames: mpsc::Receiver<Bytes>,
}

impl StreamReceiver {
    /// The stream's correlation ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Receive the next frame, or `None` once the stream is closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.frames.recv().await
    }
}

/// Object-safe send surface so `StreamSender` does not carry the transport
/// type parameter into service trait signatures.
#[async_trait::async_trait]
pub(crate) trait DynTransport: Send + Sync {
    async fn send(
        &self,
        recipient: &NodeId,
        payload: Bytes,
        message_type: &str,
        correlation_id: Option<Uuid>,
    ) -> NetworkResult<()>;
}

pub(crate) struct TransportRef<T: Transport> {
    pub transport: Arc<T>,
}

#[async_trait::async_trait]
impl<T: Transport> DynTransport for TransportRef<T> {
    async fn send(
        &self,
        recipient: &NodeId,
        payload: Bytes,
        message_type: &str,
        correlation_id: Option<Uuid>,
    ) -> NetworkResult<()> {
        self.transport
            .send_envelope(recipient, payload, message_type, correlation_id)
            .await
            .map_err(NetworkError::from)
    }
}
