//! Service trait definitions for the network layer.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use quorum_topology::NodeId;

use crate::message::ServiceMessage;
use crate::stream::StreamSender;
use crate::{decode, encode, NetworkResult};

/// Context provided to service handlers
#[derive(Clone)]
pub struct ServiceContext {
    /// The node that sent the request
    pub sender: NodeId,
    /// Correlation ID of the request
    pub correlation_id: Option<uuid::Uuid>,
}

/// Trait for request-response services
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// The request type this service handles
    type Request: ServiceMessage;

    /// Handle a request and return a response
    async fn handle(
        &self,
        request: Self::Request,
        ctx: ServiceContext,
    ) -> NetworkResult<<Self::Request as ServiceMessage>::Response>;
}

/// Trait for services receiving server-push stream requests.
///
/// The handler owns the sender side: it pushes a bounded sequence of
/// frames to the requesting peer and closes the stream when done.
#[async_trait]
pub trait StreamingService: Send + Sync + 'static {
    /// The stream type identifier
    fn stream_type(&self) -> &'static str;

    /// Handle an incoming stream request
    async fn handle_stream(
        &self,
        peer: NodeId,
        stream: StreamSender,
        metadata: HashMap<String, String>,
    ) -> NetworkResult<()>;
}

/// Type-erased service handler for internal use
pub(crate) trait ServiceHandler: Send + Sync {
    fn handle(
        &self,
        payload: Bytes,
        ctx: ServiceContext,
    ) -> Pin<Box<dyn Future<Output = NetworkResult<Bytes>> + Send>>;
}

struct TypedServiceHandler<S: Service> {
    service: Arc<S>,
}

impl<S: Service> ServiceHandler for TypedServiceHandler<S> {
    fn handle(
        &self,
        payload: Bytes,
        ctx: ServiceContext,
    ) -> Pin<Box<dyn Future<Output = NetworkResult<Bytes>> + Send>> {
        let service = self.service.clone();
        Box::pin(async move {
            let request = decode::<S::Request>(&payload)?;
            let response = service.handle(request, ctx).await?;
            encode(&response)
        })
    }
}

/// Type-erased streaming handler
pub(crate) trait StreamingServiceHandler: Send + Sync {
    fn handle_stream(
        &self,
        peer: NodeId,
        stream: StreamSender,
        metadata: HashMap<String, String>,
    ) -> Pin<Box<dyn Future<Output = NetworkResult<()>> + Send>>;
}

struct TypedStreamingServiceHandler<S> {
    service: Arc<S>,
}

impl<S: StreamingService> StreamingServiceHandler for TypedStreamingServiceHandler<S> {
    fn handle_stream(
        &self,
        peer: NodeId,
        stream: StreamSender,
        metadata: HashMap<String, String>,
    ) -> Pin<Box<dyn Future<Output = NetworkResult<()>> + Send>> {
        let service = self.service.clone();
        Box::pin(async move { service.handle_stream(peer, stream, metadata).await })
    }
}

pub(crate) fn create_service_handler<S: Service>(service: S) -> Box<dyn ServiceHandler> {
    Box::new(TypedServiceHandler {
        service: Arc::new(service),
    })
}

pub(crate) fn create_streaming_handler<S: StreamingService>(
    service: S,
) -> Box<dyn StreamingServiceHandler> {
    Box::new(TypedStreamingServiceHandler {
        service: Arc::new(service),
    })
}
