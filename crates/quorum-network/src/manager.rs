//! Network manager: registration, dispatch and request multiplexing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use quorum_topology::NodeId;
use quorum_transport::Transport;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::service::{
    create_service_handler, create_streaming_handler, Service, ServiceContext, ServiceHandler,
    StreamingService, StreamingServiceHandler,
};
use crate::stream::{DynTransport, StreamReceiver, StreamSender, TransportRef, STREAM_CLOSE,
    STREAM_FRAME};
use crate::{decode, encode, NetworkError, NetworkResult, ServiceMessage};

const REQ_PREFIX: &str = "req:";
const STREAM_OPEN_PREFIX: &str = "stream:open:";
const ACK_OK: &str = "ack:ok";
const ACK_ERR: &str = "ack:err";
const CANCEL: &str = "cancel";

const STREAM_BUFFER: usize = 64;

struct Inner<T: Transport> {
    node_id: NodeId,
    transport: Arc<T>,
    dyn_transport: Arc<dyn DynTransport>,
    services: DashMap<String, Box<dyn ServiceHandler>>,
    stream_services: DashMap<String, Box<dyn StreamingServiceHandler>>,
    pending: DashMap<Uuid, oneshot::Sender<NetworkResult<Bytes>>>,
    inbound_streams: DashMap<Uuid, mpsc::Sender<Bytes>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

/// Multiplexes typed request/response and streaming RPC over one transport.
pub struct NetworkManager<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for NetworkManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> NetworkManager<T> {
    /// Create a manager over a transport endpoint
    pub fn new(node_id: NodeId, transport: Arc<T>) -> Self {
        let dyn_transport: Arc<dyn DynTransport> = Arc::new(TransportRef {
            transport: transport.clone(),
        });
        Self {
            inner: Arc::new(Inner {
                node_id,
                transport,
                dyn_transport,
                services: DashMap::new(),
                stream_services: DashMap::new(),
                pending: DashMap::new(),
                inbound_streams: DashMap::new(),
                dispatch: Mutex::new(None),
            }),
        }
    }

    /// This node's ID
    pub fn node_id(&self) -> &NodeId {
        &self.inner.node_id
    }

    /// Register a request/response service. Must be called before `start`.
    pub fn register_service<S: Service>(&self, service: S) {
        self.inner.services.insert(
            <S::Request as ServiceMessage>::service_id().to_string(),
            create_service_handler(service),
        );
    }

    /// Register a streaming service. Must be called before `start`.
    pub fn register_streaming<S: StreamingService>(&self, service: S) {
        let stream_type = service.stream_type().to_string();
        self.inner
            .stream_services
            .insert(stream_type, create_streaming_handler(service));
    }

    /// Start consuming incoming envelopes.
    pub async fn start(&self) {
        let inner = self.inner.clone();
        let mut incoming = self.inner.transport.incoming();
        let task = tokio::spawn(async move {
            while let Some(envelope) = incoming.next().await {
                dispatch(&inner, envelope).await;
            }
            debug!("network dispatch loop ended");
        });
        *self.inner.dispatch.lock().await = Some(task);
    }

    /// Stop the dispatch loop and fail all in-flight requests.
    pub async fn shutdown(&self) -> NetworkResult<()> {
        if let Some(task) = self.inner.dispatch.lock().await.take() {
            task.abort();
        }
        let pending: Vec<Uuid> = self.inner.pending.iter().map(|e| *e.key()).collect();
        for corr in pending {
            if let Some((_, tx)) = self.inner.pending.remove(&corr) {
                let _ = tx.send(Err(NetworkError::Shutdown));
            }
        }
        self.inner.transport.shutdown().await?;
        Ok(())
    }

    /// Send a typed request and await its response within the deadline.
    ///
    /// If the future is dropped or the deadline elapses while the request
    /// is in flight, a best-effort cancel frame is sent to the peer.
    pub async fn request<M: ServiceMessage>(
        &self,
        target: &NodeId,
        message: M,
        timeout: Duration,
    ) -> NetworkResult<M::Response> {
        let correlation_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(correlation_id, tx);

        let mut guard = CancelGuard {
            inner: self.inner.clone(),
            target: target.clone(),
            correlation_id,
            armed: true,
        };

        let payload = encode(&message)?;
        self.inner
            .dyn_transport
            .send(
                target,
                payload,
                &format!("{REQ_PREFIX}{}", M::service_id()),
                Some(correlation_id),
            )
            .await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => {
                guard.disarm();
                let bytes = result?;
                decode(&bytes)
            }
            Ok(Err(_)) => {
                guard.disarm();
                Err(NetworkError::Shutdown)
            }
            Err(_) => Err(NetworkError::Timeout),
        }
    }

    /// Open a server-push stream on a peer.
    pub async fn open_stream(
        &self,
        target: &NodeId,
        stream_type: &str,
        metadata: HashMap<String, String>,
    ) -> NetworkResult<StreamReceiver> {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        self.inner.inbound_streams.insert(id, tx);

        let payload = encode(&metadata)?;
        self.inner
            .dyn_transport
            .send(
                target,
                payload,
                &format!("{STREAM_OPEN_PREFIX}{stream_type}"),
                Some(id),
            )
            .await?;

        Ok(StreamReceiver { id, frames: rx })
    }
}

struct CancelGuard<T: Transport> {
    inner: Arc<Inner<T>>,
    target: NodeId,
    correlation_id: Uuid,
    armed: bool,
}

impl<T: Transport> CancelGuard<T> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<T: Transport> Drop for CancelGuard<T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.inner.pending.remove(&self.correlation_id);
        let transport = self.inner.dyn_transport.clone();
        let target = self.target.clone();
        let correlation_id = self.correlation_id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = transport
                    .send(&target, Bytes::new(), CANCEL, Some(correlation_id))
                    .await;
            });
        }
    }
}

async fn dispatch<T: Transport>(inner: &Arc<Inner<T>>, envelope: quorum_transport::TransportEnvelope) {
    let message_type = envelope.message_type.clone();

    if let Some(service_id) = message_type.strip_prefix(REQ_PREFIX) {
        handle_request(inner, service_id, envelope.sender, envelope.correlation_id, envelope.payload);
        return;
    }

    match message_type.as_str() {
        ACK_OK | ACK_ERR => {
            let Some(corr) = envelope.correlation_id else {
                return;
            };
            if let Some((_, tx)) = inner.pending.remove(&corr) {
                let result = if message_type == ACK_OK {
                    Ok(envelope.payload)
                } else {
                    Err(NetworkError::Remote(
                        String::from_utf8_lossy(&envelope.payload).into_owned(),
                    ))
                };
                let _ = tx.send(result);
            }
        }
        CANCEL => {
            // Cancellation is a hint; work already applied stays applied
            // and the session's response cache serves any retry.
            debug!(corr = ?envelope.correlation_id, "peer cancelled request");
        }
        STREAM_FRAME => {
            let Some(id) = envelope.correlation_id else {
                return;
            };
            let sender = inner.inbound_streams.get(&id).map(|s| s.clone());
            if let Some(sender) = sender {
                if sender.send(envelope.payload).await.is_err() {
                    inner.inbound_streams.remove(&id);
                }
            }
        }
        STREAM_CLOSE => {
            if let Some(id) = envelope.correlation_id {
                inner.inbound_streams.remove(&id);
            }
        }
        other if other.starts_with(STREAM_OPEN_PREFIX) => {
            handle_stream_open(inner, envelope);
        }
        other => {
            warn!(message_type = other, "unrecognized message type");
        }
    }
}

fn handle_request<T: Transport>(
    inner: &Arc<Inner<T>>,
    service_id: &str,
    sender: NodeId,
    correlation_id: Option<Uuid>,
    payload: Bytes,
) {
    let ctx = ServiceContext {
        sender: sender.clone(),
        correlation_id,
    };
    // The handler future is 'static (it owns its service Arc), so the map
    // guard is released before the await.
    let future = inner.services.get(service_id).map(|h| h.handle(payload, ctx));
    let transport = inner.dyn_transport.clone();
    let service_id = service_id.to_string();

    tokio::spawn(async move {
        let result = match future {
            Some(future) => future.await,
            None => Err(NetworkError::NoHandler(service_id)),
        };
        let (message_type, body) = match result {
            Ok(response) => (ACK_OK, response),
            Err(e) => (ACK_ERR, Bytes::from(e.to_string())),
        };
        if let Err(e) = transport.send(&sender, body, message_type, correlation_id).await {
            debug!("failed to send response to {sender}: {e}");
        }
    });
}

fn handle_stream_open<T: Transport>(
    inner: &Arc<Inner<T>>,
    envelope: quorum_transport::TransportEnvelope,
) {
    let stream_type = envelope
        .message_type
        .strip_prefix(STREAM_OPEN_PREFIX)
        .unwrap_or_default()
        .to_string();
    let Some(id) = envelope.correlation_id else {
        return;
    };
    let metadata: HashMap<String, String> = match decode(&envelope.payload) {
        Ok(metadata) => metadata,
        Err(e) => {
            warn!(%stream_type, "bad stream-open metadata: {e}");
            return;
        }
    };

    let sender = StreamSender {
        id,
        peer: envelope.sender.clone(),
        transport: inner.dyn_transport.clone(),
    };
    let future = inner
        .stream_services
        .get(&stream_type)
        .map(|h| h.handle_stream(envelope.sender.clone(), sender, metadata));

    tokio::spawn(async move {
        match future {
            Some(future) => {
                if let Err(e) = future.await {
                    debug!("stream handler failed: {e}");
                }
            }
            None => warn!(%stream_type, "no streaming handler registered"),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use quorum_transport_memory::MemoryHub;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Echo {
        text: String,
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct EchoReply {
        text: String,
    }

    impl ServiceMessage for Echo {
        type Response = EchoReply;
        fn service_id() -> &'static str {
            "test.echo"
        }
    }

    struct EchoService;

    #[async_trait]
    impl Service for EchoService {
        type Request = Echo;

        async fn handle(&self, request: Echo, ctx: ServiceContext) -> NetworkResult<EchoReply> {
            Ok(EchoReply {
                text: format!("{} from {}", request.text, ctx.sender),
            })
        }
    }

    async fn pair(hub: &MemoryHub, a: &str, b: &str) -> (NetworkManager<quorum_transport_memory::MemoryTransport>, NetworkManager<quorum_transport_memory::MemoryTransport>) {
        let ta = Arc::new(hub.register(NodeId::new(a)));
        let tb = Arc::new(hub.register(NodeId::new(b)));
        let ma = NetworkManager::new(NodeId::new(a), ta);
        let mb = NetworkManager::new(NodeId::new(b), tb);
        ma.start().await;
        mb.start().await;
        (ma, mb)
    }

    #[tokio::test]
    async fn request_reply_round_trip() {
        let hub = MemoryHub::new();
        let (ma, mb) = pair(&hub, "a", "b").await;
        mb.register_service(EchoService);

        let reply = ma
            .request(&NodeId::new("b"), Echo { text: "hi".into() }, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.text, "hi from a");
    }

    #[tokio::test]
    async fn missing_handler_is_a_remote_error() {
        let hub = MemoryHub::new();
        let (ma, _mb) = pair(&hub, "a", "b").await;

        let err = ma
            .request(&NodeId::new("b"), Echo { text: "hi".into() }, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::Remote(_)));
    }

    #[tokio::test]
    async fn severed_link_times_out() {
        let hub = MemoryHub::new();
        let (ma, mb) = pair(&hub, "a", "b").await;
        mb.register_service(EchoService);

        hub.sever(&NodeId::new("a"), &NodeId::new("b"));
        let err = ma
            .request(&NodeId::new("b"), Echo { text: "hi".into() }, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::Timeout));
    }

    struct CountdownStream;

    #[async_trait]
    impl StreamingService for CountdownStream {
        fn stream_type(&self) -> &'static str {
            "test.countdown"
        }

        async fn handle_stream(
            &self,
            _peer: NodeId,
            stream: StreamSender,
            metadata: HashMap<String, String>,
        ) -> NetworkResult<()> {
            let from: u32 = metadata.get("from").unwrap().parse().unwrap();
            for i in (1..=from).rev() {
                stream.send(Bytes::from(i.to_string())).await?;
            }
            stream.close().await
        }
    }

    #[tokio::test]
    async fn streaming_push_and_close() {
        let hub = MemoryHub::new();
        let (ma, mb) = pair(&hub, "a", "b").await;
        mb.register_streaming(CountdownStream);

        let mut metadata = HashMap::new();
        metadata.insert("from".to_string(), "3".to_string());
        let mut stream = ma
            .open_stream(&NodeId::new("b"), "test.countdown", metadata)
            .await
            .unwrap();

        let mut frames = Vec::new();
        while let Some(frame) = stream.recv().await {
            frames.push(String::from_utf8(frame.to_vec()).unwrap());
        }
        assert_eq!(frames, vec!["3", "2", "1"]);
    }
}
