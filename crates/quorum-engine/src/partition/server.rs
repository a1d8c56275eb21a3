//! Network service façades over partition replicas.
//!
//! Each node registers one handler per RPC type; the handler routes to
//! the target replica's mailbox through the shared directory. Replicas
//! refer to each other only through `(group, partition)` references,
//! never direct handles.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use quorum_network::{NetworkError, NetworkResult, Service, ServiceContext, StreamSender,
    StreamingService};
use quorum_topology::NodeId;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, ErrorDetail};
use crate::foundation::{PartitionId, PartitionRef, SessionId};
use crate::raft::messages::{
    event_stream, AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, QueryRequest, QueryResponse, ReconfigureRequest, ReconfigureResponse,
    RequestVoteRequest, RequestVoteResponse, SubmitCommandRequest, SubmitCommandResponse,
};
use crate::raft::ReplicaHandle;

/// Shared map from partition reference to the local replica handle.
pub type ReplicaDirectory = Arc<DashMap<PartitionRef, ReplicaHandle>>;

fn lookup(directory: &ReplicaDirectory, partition: &PartitionRef) -> NetworkResult<ReplicaHandle> {
    directory
        .get(partition)
        .map(|handle| handle.clone())
        .ok_or_else(|| NetworkError::Remote(format!("no replica for partition {partition}")))
}

pub(crate) struct AppendEntriesService {
    pub directory: ReplicaDirectory,
}

#[async_trait]
impl Service for AppendEntriesService {
    type Request = AppendEntriesRequest;

    async fn handle(
        &self,
        request: AppendEntriesRequest,
        _ctx: ServiceContext,
    ) -> NetworkResult<AppendEntriesResponse> {
        let handle = lookup(&self.directory, &request.partition)?;
        handle
            .append_entries(request)
            .await
            .map_err(|e| NetworkError::Remote(e.to_string()))
    }
}

pub(crate) struct RequestVoteService {
    pub directory: ReplicaDirectory,
}

#[async_trait]
impl Service for RequestVoteService {
    type Request = RequestVoteRequest;

    async fn handle(
        &self,
        request: RequestVoteRequest,
        _ctx: ServiceContext,
    ) -> NetworkResult<RequestVoteResponse> {
        let handle = lookup(&self.directory, &request.partition)?;
        handle
            .request_vote(request)
            .await
            .map_err(|e| NetworkError::Remote(e.to_string()))
    }
}

pub(crate) struct InstallSnapshotService {
    pub directory: ReplicaDirectory,
}

#[async_trait]
impl Service for InstallSnapshotService {
    type Request = InstallSnapshotRequest;

    async fn handle(
        &self,
        request: InstallSnapshotRequest,
        _ctx: ServiceContext,
    ) -> NetworkResult<InstallSnapshotResponse> {
        let handle = lookup(&self.directory, &request.partition)?;
        handle
            .install_snapshot(request)
            .await
            .map_err(|e| NetworkError::Remote(e.to_string()))
    }
}

pub(crate) struct ReconfigureService {
    pub directory: ReplicaDirectory,
}

#[async_trait]
impl Service for ReconfigureService {
    type Request = ReconfigureRequest;

    async fn handle(
        &self,
        request: ReconfigureRequest,
        _ctx: ServiceContext,
    ) -> NetworkResult<ReconfigureResponse> {
        let id = request.id;
        let result = match lookup(&self.directory, &request.partition) {
            Ok(handle) => handle
                .reconfigure(request.change)
                .await
                .map_err(ErrorDetail::from),
            Err(_) => Err(Error::unavailable(format!(
                "no replica for partition {}",
                request.partition
            ))
            .into()),
        };
        Ok(ReconfigureResponse { id, result })
    }
}

pub(crate) struct SubmitCommandService {
    pub directory: ReplicaDirectory,
}

#[async_trait]
impl Service for SubmitCommandService {
    type Request = SubmitCommandRequest;

    async fn handle(
        &self,
        request: SubmitCommandRequest,
        _ctx: ServiceContext,
    ) -> NetworkResult<SubmitCommandResponse> {
        let id = request.id;
        match lookup(&self.directory, &request.partition) {
            Ok(handle) => {
                let reply = handle.submit(request.submission).await;
                Ok(SubmitCommandResponse {
                    id,
                    result: reply.result,
                    commit_index: reply.commit_index,
                    leader: reply.leader,
                })
            }
            Err(_) => Ok(SubmitCommandResponse {
                id,
                result: Err(Error::unavailable(format!(
                    "no replica for partition {}",
                    request.partition
                ))
                .into()),
                commit_index: 0,
                leader: None,
            }),
        }
    }
}

pub(crate) struct QueryService {
    pub directory: ReplicaDirectory,
}

#[async_trait]
impl Service for QueryService {
    type Request = QueryRequest;

    async fn handle(
        &self,
        request: QueryRequest,
        _ctx: ServiceContext,
    ) -> NetworkResult<QueryResponse> {
        let id = request.id;
        match lookup(&self.directory, &request.partition) {
            Ok(handle) => {
                let reply = handle
                    .query(
                        request.session_id,
                        request.operation,
                        request.args,
                        request.consistency,
                        request.last_commit,
                    )
                    .await;
                Ok(QueryResponse {
                    id,
                    result: reply.result,
                    commit_index: reply.commit_index,
                    leader: reply.leader,
                })
            }
            Err(_) => Ok(QueryResponse {
                id,
                result: Err(Error::unavailable(format!(
                    "no replica for partition {}",
                    request.partition
                ))
                .into()),
                commit_index: 0,
                leader: None,
            }),
        }
    }
}

/// Streams session events to a connected client.
///
/// The client opens a stream naming its partition and session; retained
/// unacknowledged events are replayed first, then new events follow as
/// they are published by the apply loop.
pub struct SessionEventStreamService {
    directory: ReplicaDirectory,
}

impl SessionEventStreamService {
    pub(crate) fn new(directory: ReplicaDirectory) -> Self {
        Self { directory }
    }
}

fn parse_partition(raw: &str) -> Option<PartitionRef> {
    let (group, partition) = raw.rsplit_once('/')?;
    let partition: u32 = partition.parse().ok()?;
    Some(PartitionRef::new(group, PartitionId::new(partition)))
}

#[async_trait]
impl StreamingService for SessionEventStreamService {
    fn stream_type(&self) -> &'static str {
        event_stream::STREAM_TYPE
    }

    async fn handle_stream(
        &self,
        peer: NodeId,
        stream: StreamSender,
        metadata: HashMap<String, String>,
    ) -> NetworkResult<()> {
        let partition = metadata
            .get(event_stream::PARTITION_KEY)
            .and_then(|raw| parse_partition(raw))
            .ok_or_else(|| NetworkError::Remote("missing partition metadata".to_string()))?;
        let session_id = metadata
            .get(event_stream::SESSION_KEY)
            .and_then(|raw| raw.parse::<u64>().ok())
            .map(SessionId::new)
            .ok_or_else(|| NetworkError::Remote("missing session metadata".to_string()))?;

        let handle = lookup(&self.directory, &partition)?;
        let (tx, mut rx) = mpsc::channel(64);
        let known = handle
            .register_event_sink(session_id, tx)
            .await
            .map_err(|e| NetworkError::Remote(e.to_string()))?;
        if !known {
            debug!(%peer, %partition, %session_id, "event stream for unknown session");
            return stream.close().await;
        }

        while let Some(frame) = rx.recv().await {
            let payload = quorum_network::encode(&frame)?;
            stream.send(payload).await?;
        }
        stream.close().await
    }
}
