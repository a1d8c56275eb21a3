//! Partition router and session client.
//!
//! The client maps primitives to partitions, opens sessions, and retries
//! operations across replicas under the recovery policies the error kinds
//! prescribe: `NotLeader` hints redirect, `NoLeader`/`Unavailable` back
//! off exponentially, `Timeout` retries with the **same** sequence number
//! (the session's response cache makes the retry idempotent).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use quorum_network::NetworkManager;
use quorum_topology::NodeId;
use quorum_transport::Transport;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{EngineConfig, MANAGEMENT_GROUP};
use crate::error::{ConsensusResult, Error, ErrorKind};
use crate::foundation::{ConsistencyLevel, LogIndex, PartitionRef, SessionId};
use crate::partition::route;
use crate::raft::messages::{
    event_stream, QueryRequest, ReconfigureRequest, SessionEventFrame, SubmitCommandRequest,
    SubmitOutput, Submission,
};
use crate::raft::ConfigurationChange;
use crate::service::{PrimitiveRecord, RegisterPrimitive};

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Encode CBOR operation arguments for [`SessionHandle::submit`]
pub fn encode_args<T: Serialize>(value: &T) -> ConsensusResult<Bytes> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)
        .map_err(|e| Error::internal(format!("args encode: {e}")))?;
    Ok(Bytes::from(buf))
}

/// Decode a CBOR operation result
pub fn decode_result<T: DeserializeOwned>(bytes: &[u8]) -> ConsensusResult<T> {
    ciborium::de::from_reader(bytes).map_err(|e| Error::internal(format!("result decode: {e}")))
}

/// Fate of a client session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Session is live
    Open,
    /// Session closed or expired; primitives built on it must treat this
    /// as a fate event
    Closed,
}

struct GroupView {
    partitions: u32,
    members: Vec<NodeId>,
}

/// Routes primitive operations to partitions and manages retries.
pub struct QuorumClient<T: Transport> {
    node_id: NodeId,
    network: NetworkManager<T>,
    groups: Arc<HashMap<String, GroupView>>,
    leaders: Arc<DashMap<PartitionRef, NodeId>>,
    request_timeout: Duration,
    operation_timeout: Duration,
    default_session_timeout: Duration,
}

impl<T: Transport> Clone for QuorumClient<T> {
    fn clone(&self) -> Self {
        Self {
            node_id: self.node_id.clone(),
            network: self.network.clone(),
            groups: self.groups.clone(),
            leaders: self.leaders.clone(),
            request_timeout: self.request_timeout,
            operation_timeout: self.operation_timeout,
            default_session_timeout: self.default_session_timeout,
        }
    }
}

impl<T: Transport> QuorumClient<T> {
    /// Create a client over a node's network manager
    pub fn new(node_id: NodeId, network: NetworkManager<T>, config: &EngineConfig) -> Self {
        let groups = config
            .groups
            .iter()
            .map(|group| {
                (
                    group.name.clone(),
                    GroupView {
                        partitions: group.partitions(),
                        members: group.members.clone(),
                    },
                )
            })
            .collect();
        Self {
            node_id,
            network,
            groups: Arc::new(groups),
            leaders: Arc::new(DashMap::new()),
            request_timeout: config.network.request_timeout,
            operation_timeout: config.network.operation_timeout,
            default_session_timeout: config.session.default_timeout,
        }
    }

    /// Map a primitive to its partition within a group
    pub fn partition_for(&self, group: &str, primitive: &str) -> ConsensusResult<PartitionRef> {
        let view = self
            .groups
            .get(group)
            .ok_or_else(|| Error::configuration(format!("unknown partition group: {group}")))?;
        Ok(PartitionRef::new(
            group.to_string(),
            route(primitive, None, view.partitions),
        ))
    }

    fn members_of(&self, partition: &PartitionRef) -> Vec<NodeId> {
        self.groups
            .get(&partition.group)
            .map(|view| view.members.clone())
            .unwrap_or_default()
    }

    fn note_leader(&self, partition: &PartitionRef, leader: &Option<NodeId>) {
        match leader {
            Some(leader) => {
                self.leaders.insert(partition.clone(), leader.clone());
            }
            None => {
                self.leaders.remove(partition);
            }
        }
    }

    /// Candidate targets for a partition: the leader estimate first, then
    /// the remaining members in order.
    fn targets(&self, partition: &PartitionRef) -> Vec<NodeId> {
        let members = self.members_of(partition);
        let mut targets = Vec::with_capacity(members.len());
        if let Some(leader) = self.leaders.get(partition) {
            targets.push(leader.clone());
        }
        for member in members {
            if !targets.contains(&member) {
                targets.push(member);
            }
        }
        targets
    }

    /// Submit a session operation, rotating through replicas with the same
    /// payload (and therefore the same sequence number) until the overall
    /// operation deadline.
    pub(crate) async fn submit_to(
        &self,
        partition: &PartitionRef,
        submission: Submission,
    ) -> ConsensusResult<(SubmitOutput, LogIndex)> {
        let deadline = Instant::now() + self.operation_timeout;
        let mut backoff = INITIAL_BACKOFF;
        let mut rotation = 0usize;

        loop {
            let targets = self.targets(partition);
            if targets.is_empty() {
                return Err(Error::configuration(format!(
                    "partition {partition} has no members"
                )));
            }
            let target = targets[rotation % targets.len()].clone();
            let request = SubmitCommandRequest {
                id: Uuid::new_v4(),
                partition: partition.clone(),
                submission: submission.clone(),
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::timeout(format!(
                    "operation deadline elapsed against partition {partition}"
                )));
            }
            let attempt_timeout = self.request_timeout.min(remaining);

            match self.network.request(&target, request, attempt_timeout).await {
                Ok(response) => {
                    self.note_leader(partition, &response.leader);
                    match response.result {
                        Ok(output) => return Ok((output, response.commit_index)),
                        Err(detail) => {
                            let error = Error::from(detail);
                            match error.kind() {
                                ErrorKind::NotLeader => {
                                    // Redirect to the hinted member; same
                                    // sequence number.
                                    if let Some(hint) = error.leader_hint() {
                                        self.leaders.insert(partition.clone(), hint.clone());
                                    } else {
                                        rotation += 1;
                                    }
                                }
                                ErrorKind::NoLeader | ErrorKind::Unavailable => {
                                    rotation += 1;
                                    tokio::time::sleep(backoff).await;
                                    backoff = (backoff * 2).min(MAX_BACKOFF);
                                }
                                ErrorKind::Timeout => {
                                    rotation += 1;
                                }
                                _ => return Err(error),
                            }
                        }
                    }
                }
                Err(e) => {
                    debug!(%target, %partition, "submit attempt failed: {e}");
                    self.leaders.remove(partition);
                    rotation += 1;
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    pub(crate) async fn query_to(
        &self,
        partition: &PartitionRef,
        session_id: SessionId,
        operation: &str,
        args: Bytes,
        consistency: ConsistencyLevel,
        last_commit: LogIndex,
    ) -> ConsensusResult<(Bytes, LogIndex)> {
        let deadline = Instant::now() + self.operation_timeout;
        let mut backoff = INITIAL_BACKOFF;
        let mut rotation = 0usize;

        loop {
            let targets = self.targets(partition);
            if targets.is_empty() {
                return Err(Error::configuration(format!(
                    "partition {partition} has no members"
                )));
            }
            let target = targets[rotation % targets.len()].clone();
            let request = QueryRequest {
                id: Uuid::new_v4(),
                partition: partition.clone(),
                session_id,
                operation: operation.to_string(),
                args: args.clone(),
                consistency,
                last_commit,
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::timeout(format!(
                    "query deadline elapsed against partition {partition}"
                )));
            }
            let attempt_timeout = self.request_timeout.min(remaining);

            match self.network.request(&target, request, attempt_timeout).await {
                Ok(response) => {
                    self.note_leader(partition, &response.leader);
                    match response.result {
                        Ok(bytes) => return Ok((bytes, response.commit_index)),
                        Err(detail) => {
                            let error = Error::from(detail);
                            match error.kind() {
                                ErrorKind::NotLeader => {
                                    if let Some(hint) = error.leader_hint() {
                                        self.leaders.insert(partition.clone(), hint.clone());
                                    } else {
                                        rotation += 1;
                                    }
                                }
                                ErrorKind::ReadStale
                                | ErrorKind::NoLeader
                                | ErrorKind::Unavailable => {
                                    rotation += 1;
                                    tokio::time::sleep(backoff).await;
                                    backoff = (backoff * 2).min(MAX_BACKOFF);
                                }
                                ErrorKind::Timeout => {
                                    rotation += 1;
                                }
                                _ => return Err(error),
                            }
                        }
                    }
                }
                Err(e) => {
                    debug!(%target, %partition, "query attempt failed: {e}");
                    rotation += 1;
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    /// Open a session against the partition hosting `primitive`.
    pub async fn open_session(
        &self,
        group: &str,
        primitive: &str,
        service_type: &str,
        timeout: Option<Duration>,
    ) -> ConsensusResult<SessionHandle<T>> {
        let partition = self.partition_for(group, primitive)?;
        let timeout_ms = timeout.unwrap_or(self.default_session_timeout).as_millis() as u64;

        let (output, commit_index) = self
            .submit_to(
                &partition,
                Submission::OpenSession {
                    member: self.node_id.clone(),
                    primitive: primitive.to_string(),
                    service_type: service_type.to_string(),
                    timeout_ms,
                },
            )
            .await?;
        let SubmitOutput::SessionOpened {
            session_id,
            timeout_ms,
        } = output
        else {
            return Err(Error::internal("unexpected open-session output"));
        };
        debug!(%partition, %session_id, "session opened");
        Ok(SessionHandle::start(
            self.clone(),
            partition,
            session_id,
            timeout_ms,
            commit_index,
        ))
    }

    /// Apply a single-member configuration change to a partition.
    pub async fn reconfigure(
        &self,
        partition: &PartitionRef,
        change: ConfigurationChange,
    ) -> ConsensusResult<()> {
        let deadline = Instant::now() + self.operation_timeout;
        let mut backoff = INITIAL_BACKOFF;
        let mut rotation = 0usize;

        loop {
            let targets = self.targets(partition);
            if targets.is_empty() {
                return Err(Error::configuration(format!(
                    "partition {partition} has no members"
                )));
            }
            let target = targets[rotation % targets.len()].clone();
            let request = ReconfigureRequest {
                id: Uuid::new_v4(),
                partition: partition.clone(),
                change: change.clone(),
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::timeout("reconfiguration deadline elapsed"));
            }

            match self
                .network
                .request(&target, request, self.request_timeout.min(remaining))
                .await
            {
                Ok(response) => match response.result {
                    Ok(()) => return Ok(()),
                    Err(detail) => {
                        let error = Error::from(detail);
                        match error.kind() {
                            ErrorKind::NotLeader => {
                                if let Some(hint) = error.leader_hint() {
                                    self.leaders.insert(partition.clone(), hint.clone());
                                } else {
                                    rotation += 1;
                                }
                            }
                            ErrorKind::NoLeader | ErrorKind::Unavailable => {
                                rotation += 1;
                                tokio::time::sleep(backoff).await;
                                backoff = (backoff * 2).min(MAX_BACKOFF);
                            }
                            _ => return Err(error),
                        }
                    }
                },
                Err(_) => {
                    rotation += 1;
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    /// Register a primitive in the management directory, returning the
    /// authoritative record (first registration wins).
    pub async fn register_primitive(
        &self,
        name: &str,
        record: PrimitiveRecord,
    ) -> ConsensusResult<PrimitiveRecord> {
        let session = self
            .open_session(MANAGEMENT_GROUP, "primitives", "directory", None)
            .await?;
        let args = encode_args(&RegisterPrimitive {
            name: name.to_string(),
            record,
        })?;
        let result = session.submit("register", args).await;
        let closed = session.close().await;
        let bytes = result?;
        closed?;
        decode_result(&bytes)
    }

    /// Look up a primitive in the management directory.
    pub async fn lookup_primitive(&self, name: &str) -> ConsensusResult<Option<PrimitiveRecord>> {
        let session = self
            .open_session(MANAGEMENT_GROUP, "primitives", "directory", None)
            .await?;
        #[derive(Serialize)]
        struct LookupArgs<'a> {
            name: &'a str,
        }
        let args = encode_args(&LookupArgs { name })?;
        let result = session
            .query("lookup", args, ConsistencyLevel::Linearizable)
            .await;
        let closed = session.close().await;
        let bytes = result?;
        closed?;
        decode_result(&bytes)
    }
}

/// A live session against one partition.
///
/// The handle owns a background keep-alive task; dropping the handle (or
/// calling [`close`](Self::close)) stops it. Session fate is surfaced
/// through [`state`](Self::state): when the server closes or expires the
/// session every waiter observes `SessionState::Closed`.
pub struct SessionHandle<T: Transport> {
    client: QuorumClient<T>,
    partition: PartitionRef,
    session_id: SessionId,
    sequence: Arc<AtomicU64>,
    completed: Arc<AtomicU64>,
    last_commit: Arc<AtomicU64>,
    event_ack: Arc<AtomicU64>,
    state_tx: Arc<watch::Sender<SessionState>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Transport> SessionHandle<T> {
    fn start(
        client: QuorumClient<T>,
        partition: PartitionRef,
        session_id: SessionId,
        timeout_ms: u64,
        commit_index: LogIndex,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Open);
        let state_tx = Arc::new(state_tx);
        let handle = Self {
            client: client.clone(),
            partition: partition.clone(),
            session_id,
            sequence: Arc::new(AtomicU64::new(0)),
            completed: Arc::new(AtomicU64::new(0)),
            last_commit: Arc::new(AtomicU64::new(commit_index)),
            event_ack: Arc::new(AtomicU64::new(0)),
            state_tx: state_tx.clone(),
            tasks: Mutex::new(Vec::new()),
        };

        let keep_alive = tokio::spawn(keep_alive_loop(
            client,
            partition,
            session_id,
            timeout_ms,
            handle.completed.clone(),
            handle.event_ack.clone(),
            state_tx,
        ));
        if let Ok(mut tasks) = handle.tasks.try_lock() {
            tasks.push(keep_alive);
        }
        handle
    }

    /// The session ID
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// The partition this session is bound to
    pub fn partition(&self) -> &PartitionRef {
        &self.partition
    }

    /// Watch the session's fate
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    fn check_open(&self) -> ConsensusResult<()> {
        if *self.state_tx.borrow() == SessionState::Closed {
            return Err(Error::closed_session(format!(
                "session {} is closed",
                self.session_id
            )));
        }
        Ok(())
    }

    fn observe_commit(&self, commit_index: LogIndex) {
        self.last_commit.fetch_max(commit_index, Ordering::Relaxed);
    }

    fn handle_session_fate(&self, error: &Error) {
        if matches!(
            error.kind(),
            ErrorKind::ClosedSession | ErrorKind::UnknownSession
        ) {
            let _ = self.state_tx.send(SessionState::Closed);
        }
    }

    /// Submit a command. The sequence number is assigned once; retries
    /// reuse it, so a command applies at most once regardless of how many
    /// attempts its delivery takes.
    pub async fn submit(&self, operation: &str, args: Bytes) -> ConsensusResult<Bytes> {
        self.check_open()?;
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let result = self
            .client
            .submit_to(
                &self.partition,
                Submission::Command {
                    session_id: self.session_id,
                    sequence,
                    operation: operation.to_string(),
                    args,
                },
            )
            .await;
        match result {
            Ok((SubmitOutput::CommandResult(bytes), commit_index)) => {
                self.completed.fetch_max(sequence, Ordering::SeqCst);
                self.observe_commit(commit_index);
                Ok(bytes)
            }
            Ok((_, _)) => Err(Error::internal("unexpected command output")),
            Err(e) => {
                self.handle_session_fate(&e);
                // A command abandoned mid-retry has an unknown fate, and a
                // later command with a fresh sequence would wait forever
                // behind the gap. The only safe surface is to end the
                // session.
                if e.is_retryable() {
                    let _ = self.state_tx.send(SessionState::Closed);
                }
                Err(e)
            }
        }
    }

    /// Query under the requested consistency level.
    pub async fn query(
        &self,
        operation: &str,
        args: Bytes,
        consistency: ConsistencyLevel,
    ) -> ConsensusResult<Bytes> {
        self.check_open()?;
        let last_commit = match consistency {
            ConsistencyLevel::Sequential => self.last_commit.load(Ordering::Relaxed),
            _ => 0,
        };
        let result = self
            .client
            .query_to(
                &self.partition,
                self.session_id,
                operation,
                args,
                consistency,
                last_commit,
            )
            .await;
        match result {
            Ok((bytes, commit_index)) => {
                self.observe_commit(commit_index);
                Ok(bytes)
            }
            Err(e) => {
                self.handle_session_fate(&e);
                Err(e)
            }
        }
    }

    /// Subscribe to session events. Events arrive in publication order
    /// with strictly increasing event indices; reconnection and replay
    /// after a leader change are handled internally.
    pub async fn events(&self) -> mpsc::Receiver<SessionEventFrame> {
        let (tx, rx) = mpsc::channel(64);
        let task = tokio::spawn(event_loop(
            self.client.clone(),
            self.partition.clone(),
            self.session_id,
            self.event_ack.clone(),
            self.state_tx.subscribe(),
            tx,
        ));
        self.tasks.lock().await.push(task);
        rx
    }

    /// Close the session and stop its background tasks.
    pub async fn close(self) -> ConsensusResult<()> {
        let result = match self.client.submit_to(
            &self.partition,
            Submission::CloseSession {
                session_id: self.session_id,
            },
        )
        .await
        {
            Ok(_) => Ok(()),
            Err(e) if matches!(e.kind(), ErrorKind::UnknownSession | ErrorKind::ClosedSession) => {
                Ok(())
            }
            Err(e) => Err(e),
        };
        let _ = self.state_tx.send(SessionState::Closed);
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        result
    }
}

impl<T: Transport> Drop for SessionHandle<T> {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.try_lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

async fn keep_alive_loop<T: Transport>(
    client: QuorumClient<T>,
    partition: PartitionRef,
    session_id: SessionId,
    timeout_ms: u64,
    completed: Arc<AtomicU64>,
    event_ack: Arc<AtomicU64>,
    state_tx: Arc<watch::Sender<SessionState>>,
) {
    let interval = Duration::from_millis((timeout_ms / 2).max(1));
    loop {
        tokio::time::sleep(interval).await;
        if *state_tx.borrow() == SessionState::Closed {
            return;
        }
        let submission = Submission::KeepAlive {
            session_id,
            command_ack: completed.load(Ordering::SeqCst),
            event_ack: event_ack.load(Ordering::SeqCst),
        };
        match client.submit_to(&partition, submission).await {
            Ok(_) => {}
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::ClosedSession | ErrorKind::UnknownSession
                ) =>
            {
                warn!(%partition, %session_id, "session lost: {e}");
                let _ = state_tx.send(SessionState::Closed);
                return;
            }
            Err(e) => {
                debug!(%partition, %session_id, "keep-alive failed: {e}");
            }
        }
    }
}

async fn event_loop<T: Transport>(
    client: QuorumClient<T>,
    partition: PartitionRef,
    session_id: SessionId,
    event_ack: Arc<AtomicU64>,
    mut state: watch::Receiver<SessionState>,
    out: mpsc::Sender<SessionEventFrame>,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if *state.borrow_and_update() == SessionState::Closed {
            return;
        }
        // Event push comes from the leader; follow the leader estimate.
        let targets = client.targets(&partition);
        let Some(target) = targets.first().cloned() else {
            return;
        };
        let mut metadata = HashMap::new();
        metadata.insert(
            event_stream::PARTITION_KEY.to_string(),
            partition.to_string(),
        );
        metadata.insert(
            event_stream::SESSION_KEY.to_string(),
            session_id.value().to_string(),
        );

        match client
            .network
            .open_stream(&target, event_stream::STREAM_TYPE, metadata)
            .await
        {
            Ok(mut stream) => {
                backoff = INITIAL_BACKOFF;
                while let Some(frame) = stream.recv().await {
                    let frame: SessionEventFrame = match quorum_network::decode(&frame) {
                        Ok(frame) => frame,
                        Err(e) => {
                            debug!(%partition, %session_id, "bad event frame: {e}");
                            continue;
                        }
                    };
                    // Replay after reconnect may repeat delivered events;
                    // indices are strictly increasing within a session.
                    if frame.event_index <= event_ack.load(Ordering::SeqCst) {
                        continue;
                    }
                    event_ack.store(frame.event_index, Ordering::SeqCst);
                    if out.send(frame).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                debug!(%partition, %session_id, "event stream connect failed: {e}");
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}
