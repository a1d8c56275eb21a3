//! Per-partition replica actor.
//!
//! The actor owns every piece of mutable partition state: the log, the
//! vote record, the role, the leader bookkeeping and the deterministic
//! state machine. Public entry points enqueue typed messages on its
//! mailbox; nothing mutates state from outside the actor task.
//!
//! RPC fan-out (vote solicitations, append batches, snapshot chunks) runs
//! in spawned tasks whose completions are posted back into the mailbox
//! tagged with a [`Guard`] capturing the term and role at send time. A
//! continuation whose guard no longer matches is stale and is dropped
//! without touching state.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use bytes::Bytes;
use quorum_network::NetworkManager;
use quorum_storage::{SnapshotMeta, StorageAdaptor, StorageNamespace, VoteRecord};
use quorum_topology::NodeId;
use quorum_transport::Transport;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::{RaftConfig, SessionConfig};
use crate::error::{ConsensusResult, Error, ErrorDetail};
use crate::foundation::{ConsistencyLevel, LogIndex, PartitionRef, RaftRole, SessionId, Term};
use crate::raft::log::RaftLog;
use crate::raft::messages::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RequestVoteRequest, RequestVoteResponse, SessionEventFrame, SubmitOutput, Submission,
};
use crate::raft::types::{
    CloseSessionEntry, CommandEntry, Configuration, ConfigurationChange, EntryPayload,
    KeepAliveEntry, LogEntry, OpenSessionEntry,
};
use crate::service::{ApplyEffect, ServiceRegistry, StateMachine};

const MAILBOX_CAPACITY: usize = 256;

/// Everything needed to start a partition replica
pub struct ReplicaOptions {
    /// The partition this replica serves
    pub partition: PartitionRef,
    /// This node
    pub node_id: NodeId,
    /// Raft timing and batching
    pub raft: RaftConfig,
    /// Session caps
    pub session: SessionConfig,
    /// Bootstrap membership (superseded by configuration entries found in
    /// the recovered log)
    pub initial_configuration: Configuration,
    /// Service registry for the hosted primitive
    pub registry: ServiceRegistry,
}

/// Point-in-time replica state for monitoring and tests
#[derive(Debug, Clone)]
pub struct ReplicaStatus {
    /// The partition
    pub partition: PartitionRef,
    /// Current role
    pub role: RaftRole,
    /// Current term
    pub term: Term,
    /// Leader estimate
    pub leader: Option<NodeId>,
    /// Commit index
    pub commit_index: LogIndex,
    /// Highest applied index
    pub last_applied: LogIndex,
    /// First log index still held (after the last compaction)
    pub first_index: LogIndex,
    /// Last log index
    pub last_index: LogIndex,
    /// Effective membership
    pub configuration: Configuration,
}

/// Reply to a submission
#[derive(Debug)]
pub struct SubmitReply {
    /// The output or the error to recover from
    pub result: Result<SubmitOutput, ErrorDetail>,
    /// Replica commit index at reply time
    pub commit_index: LogIndex,
    /// Replica leader estimate
    pub leader: Option<NodeId>,
}

/// Reply to a query
#[derive(Debug)]
pub struct QueryReply {
    /// The result or the error to recover from
    pub result: Result<Bytes, ErrorDetail>,
    /// Replica commit index at reply time
    pub commit_index: LogIndex,
    /// Replica leader estimate
    pub leader: Option<NodeId>,
}

/// Term/role precondition captured before an await point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Guard {
    term: Term,
    role: RaftRole,
}

enum WaiterKey {
    Command(SessionId, u64),
    Index(LogIndex),
}

enum ReplicaMessage {
    AppendEntries(AppendEntriesRequest, oneshot::Sender<AppendEntriesResponse>),
    RequestVote(RequestVoteRequest, oneshot::Sender<RequestVoteResponse>),
    InstallSnapshot(InstallSnapshotRequest, oneshot::Sender<InstallSnapshotResponse>),
    Submit(Submission, oneshot::Sender<SubmitReply>),
    Query {
        session_id: SessionId,
        operation: String,
        args: Bytes,
        consistency: ConsistencyLevel,
        last_commit: LogIndex,
        reply: oneshot::Sender<QueryReply>,
    },
    Reconfigure(ConfigurationChange, oneshot::Sender<Result<(), ErrorDetail>>),
    RegisterEventSink {
        session_id: SessionId,
        sink: mpsc::Sender<SessionEventFrame>,
        reply: oneshot::Sender<bool>,
    },
    Status(oneshot::Sender<ReplicaStatus>),
    VoteReply {
        peer: NodeId,
        guard: Guard,
        response: RequestVoteResponse,
    },
    AppendReply {
        peer: NodeId,
        guard: Guard,
        round: u64,
        prev_sent: LogIndex,
        sent: usize,
        response: Option<AppendEntriesResponse>,
    },
    SnapshotReply {
        peer: NodeId,
        guard: Guard,
        sent_len: usize,
        done: bool,
        response: Option<InstallSnapshotResponse>,
    },
    Shutdown,
}

/// Handle to a running replica actor.
#[derive(Clone)]
pub struct ReplicaHandle {
    partition: PartitionRef,
    tx: mpsc::Sender<ReplicaMessage>,
}

impl ReplicaHandle {
    /// The partition this replica serves
    pub fn partition(&self) -> &PartitionRef {
        &self.partition
    }

    async fn call<R>(
        &self,
        build: impl FnOnce(oneshot::Sender<R>) -> ReplicaMessage,
    ) -> ConsensusResult<R> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(tx))
            .await
            .map_err(|_| Error::unavailable("replica stopped"))?;
        rx.await.map_err(|_| Error::unavailable("replica stopped"))
    }

    /// Handle an AppendEntries RPC
    pub async fn append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> ConsensusResult<AppendEntriesResponse> {
        self.call(|tx| ReplicaMessage::AppendEntries(request, tx))
            .await
    }

    /// Handle a RequestVote RPC
    pub async fn request_vote(
        &self,
        request: RequestVoteRequest,
    ) -> ConsensusResult<RequestVoteResponse> {
        self.call(|tx| ReplicaMessage::RequestVote(request, tx))
            .await
    }

    /// Handle an InstallSnapshot RPC
    pub async fn install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> ConsensusResult<InstallSnapshotResponse> {
        self.call(|tx| ReplicaMessage::InstallSnapshot(request, tx))
            .await
    }

    /// Submit a session operation or command
    pub async fn submit(&self, submission: Submission) -> SubmitReply {
        match self
            .call(|tx| ReplicaMessage::Submit(submission, tx))
            .await
        {
            Ok(reply) => reply,
            Err(e) => SubmitReply {
                result: Err(e.into()),
                commit_index: 0,
                leader: None,
            },
        }
    }

    /// Serve a query under the requested consistency level
    pub async fn query(
        &self,
        session_id: SessionId,
        operation: String,
        args: Bytes,
        consistency: ConsistencyLevel,
        last_commit: LogIndex,
    ) -> QueryReply {
        match self
            .call(|tx| ReplicaMessage::Query {
                session_id,
                operation,
                args,
                consistency,
                last_commit,
                reply: tx,
            })
            .await
        {
            Ok(reply) => reply,
            Err(e) => QueryReply {
                result: Err(e.into()),
                commit_index: 0,
                leader: None,
            },
        }
    }

    /// Apply a single-member configuration change
    pub async fn reconfigure(&self, change: ConfigurationChange) -> ConsensusResult<()> {
        self.call(|tx| ReplicaMessage::Reconfigure(change, tx))
            .await?
            .map_err(Error::from)
    }

    /// Attach an event sink for a session; retained events are replayed
    /// first. Returns `false` if the session is unknown.
    pub async fn register_event_sink(
        &self,
        session_id: SessionId,
        sink: mpsc::Sender<SessionEventFrame>,
    ) -> ConsensusResult<bool> {
        self.call(|tx| ReplicaMessage::RegisterEventSink {
            session_id,
            sink,
            reply: tx,
        })
        .await
    }

    /// Inspect replica state
    pub async fn status(&self) -> ConsensusResult<ReplicaStatus> {
        self.call(ReplicaMessage::Status).await
    }

    /// Stop the actor
    pub async fn shutdown(&self) {
        let _ = self.tx.send(ReplicaMessage::Shutdown).await;
    }
}

/// Snapshot envelope persisted to storage: membership travels with the
/// machine state so an installed snapshot fully replaces the log.
#[derive(Serialize, Deserialize)]
struct ReplicaSnapshot {
    configuration: Configuration,
    configuration_index: LogIndex,
    machine: Bytes,
}

struct Progress {
    next_index: LogIndex,
    match_index: LogIndex,
    inflight: bool,
    snapshot_offset: Option<u64>,
}

struct PendingRead {
    round: u64,
    min_apply: LogIndex,
    session_id: SessionId,
    operation: String,
    args: Bytes,
    reply: oneshot::Sender<QueryReply>,
}

struct LeaderState {
    progress: HashMap<NodeId, Progress>,
    round: u64,
    round_sent_at: HashMap<u64, Instant>,
    round_acks: HashMap<u64, HashSet<NodeId>>,
    confirmed_round: u64,
    lease_expiry: Instant,
    pending_reads: Vec<PendingRead>,
    initialize_index: LogIndex,
    own_term_committed: bool,
    config_change_index: Option<LogIndex>,
    config_waiter: Option<(LogIndex, oneshot::Sender<Result<(), ErrorDetail>>)>,
}

impl LeaderState {
    fn new(now: Instant) -> Self {
        Self {
            progress: HashMap::new(),
            round: 0,
            round_sent_at: HashMap::new(),
            round_acks: HashMap::new(),
            confirmed_round: 0,
            lease_expiry: now,
            pending_reads: Vec::new(),
            initialize_index: 0,
            own_term_committed: false,
            config_change_index: None,
            config_waiter: None,
        }
    }
}

struct PendingSnapshot {
    index: LogIndex,
    term: Term,
    timestamp: i64,
    buffer: Vec<u8>,
}

/// Spawn a partition replica, recovering durable state from storage.
pub async fn spawn_replica<S, T>(
    options: ReplicaOptions,
    storage: S,
    network: NetworkManager<T>,
) -> ConsensusResult<ReplicaHandle>
where
    S: StorageAdaptor,
    T: Transport,
{
    let namespace = StorageNamespace::new(format!(
        "{}/{}",
        options.partition.group, options.partition.partition
    ));

    let vote = storage.load_vote(&namespace).await?.unwrap_or_default();
    let (log, snapshot) = RaftLog::open(storage.clone(), namespace.clone()).await?;

    let mut state_machine = StateMachine::new(
        options.partition.clone(),
        options.registry.clone(),
        options.session.max_pending_events,
    );
    let mut configuration = options.initial_configuration.clone();
    let mut configuration_index = 0;

    if let Some((_, data)) = snapshot {
        let envelope: ReplicaSnapshot = ciborium::de::from_reader(data.as_ref())
            .map_err(|e| Error::storage(format!("snapshot envelope decode: {e}")))?;
        state_machine.restore(&envelope.machine)?;
        configuration = envelope.configuration;
        configuration_index = envelope.configuration_index;
    }

    // Configuration entries take effect on receipt, which includes
    // receipt-before-crash: re-adopt the latest one in the recovered log.
    let mut config_history = vec![(configuration_index, configuration.clone())];
    for index in log.first_index()..=log.last_index() {
        if let Some(entry) = log.get(index) {
            if let EntryPayload::Configuration(config) = &entry.payload {
                config_history.push((index, config.clone()));
                configuration = config.clone();
            }
        }
    }

    let last_timestamp = log
        .get(log.last_index())
        .map(|e| e.timestamp)
        .unwrap_or_default();

    let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
    let voted_for = vote.voted_for.map(NodeId::new);
    let role = base_role(&configuration, &options.node_id);

    let mut actor = ReplicaActor {
        partition: options.partition.clone(),
        node_id: options.node_id,
        raft: options.raft,
        network,
        storage,
        namespace,
        log,
        state_machine,
        role,
        current_term: Term::new(vote.current_term),
        voted_for,
        leader: None,
        configuration,
        config_history,
        leader_state: None,
        votes_received: HashSet::new(),
        pending_snapshot: None,
        election_deadline: Instant::now(),
        heartbeat_deadline: Instant::now(),
        command_waiters: HashMap::new(),
        index_waiters: HashMap::new(),
        event_sinks: HashMap::new(),
        last_timestamp,
        tx: tx.clone(),
        rx,
    };
    actor.state_machine.set_role(role);
    actor.reset_election_deadline();

    info!(
        partition = %actor.partition,
        node = %actor.node_id,
        ?role,
        term = %actor.current_term,
        "starting partition replica"
    );

    let partition = options.partition;
    tokio::spawn(async move { actor.run().await });

    Ok(ReplicaHandle { partition, tx })
}

fn base_role(configuration: &Configuration, node: &NodeId) -> RaftRole {
    use crate::foundation::MemberRole;
    match configuration.role_of(node) {
        Some(MemberRole::Active) => RaftRole::Follower,
        Some(MemberRole::Passive) => RaftRole::Passive,
        Some(MemberRole::Reserve) => RaftRole::Reserve,
        None => RaftRole::Inactive,
    }
}

struct ReplicaActor<S: StorageAdaptor, T: Transport> {
    partition: PartitionRef,
    node_id: NodeId,
    raft: RaftConfig,
    network: NetworkManager<T>,
    storage: S,
    namespace: StorageNamespace,
    log: RaftLog<S>,
    state_machine: StateMachine,
    role: RaftRole,
    current_term: Term,
    voted_for: Option<NodeId>,
    leader: Option<NodeId>,
    configuration: Configuration,
    config_history: Vec<(LogIndex, Configuration)>,
    leader_state: Option<LeaderState>,
    votes_received: HashSet<NodeId>,
    pending_snapshot: Option<PendingSnapshot>,
    election_deadline: Instant,
    heartbeat_deadline: Instant,
    command_waiters: HashMap<(SessionId, u64), oneshot::Sender<SubmitReply>>,
    index_waiters: HashMap<LogIndex, oneshot::Sender<SubmitReply>>,
    event_sinks: HashMap<SessionId, mpsc::Sender<SessionEventFrame>>,
    last_timestamp: i64,
    tx: mpsc::Sender<ReplicaMessage>,
    rx: mpsc::Receiver<ReplicaMessage>,
}

impl<S: StorageAdaptor, T: Transport> ReplicaActor<S, T> {
    async fn run(&mut self) {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(ReplicaMessage::Shutdown) | None => break,
                    Some(message) => self.handle(message).await,
                },
                _ = tokio::time::sleep_until(deadline) => self.on_deadline().await,
            }
        }
        debug!(partition = %self.partition, "replica actor stopped");
    }

    fn next_deadline(&self) -> Instant {
        match self.role {
            RaftRole::Leader => self.heartbeat_deadline,
            RaftRole::Follower | RaftRole::Candidate => self.election_deadline,
            _ => Instant::now() + Duration::from_secs(3600),
        }
    }

    async fn on_deadline(&mut self) {
        match self.role {
            RaftRole::Leader => {
                self.heartbeat_deadline = Instant::now() + self.raft.heartbeat_interval;
                self.broadcast_append();
            }
            RaftRole::Follower | RaftRole::Candidate => self.start_election().await,
            _ => {}
        }
    }

    fn reset_election_deadline(&mut self) {
        self.election_deadline = Instant::now() + self.raft.random_election_timeout();
    }

    fn guard(&self) -> Guard {
        Guard {
            term: self.current_term,
            role: self.role,
        }
    }

    fn guard_valid(&self, guard: Guard) -> bool {
        guard.term == self.current_term && guard.role == self.role
    }

    fn now_ms() -> i64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default()
    }

    /// Unrecoverable local failure: the replica leaves the partition until
    /// an operator intervenes. Never silently swallowed.
    fn fail(&mut self, error: Error) {
        error!(
            partition = %self.partition,
            node = %self.node_id,
            "replica going inactive: {error}"
        );
        self.fail_waiters(Error::unavailable("replica inactive"));
        self.set_role(RaftRole::Inactive);
        self.leader_state = None;
    }

    fn set_role(&mut self, role: RaftRole) {
        if self.role != role {
            info!(
                partition = %self.partition,
                node = %self.node_id,
                term = %self.current_term,
                from = %self.role,
                to = %role,
                "role transition"
            );
            self.role = role;
            self.state_machine.set_role(role);
        }
    }

    fn fail_waiters(&mut self, error: Error) {
        let detail = ErrorDetail::from(&error);
        let commit_index = self.log.commit_index();
        let leader = self.leader.clone();
        for (_, waiter) in self.command_waiters.drain() {
            let _ = waiter.send(SubmitReply {
                result: Err(detail.clone()),
                commit_index,
                leader: leader.clone(),
            });
        }
        for (_, waiter) in self.index_waiters.drain() {
            let _ = waiter.send(SubmitReply {
                result: Err(detail.clone()),
                commit_index,
                leader: leader.clone(),
            });
        }
        if let Some(state) = self.leader_state.as_mut() {
            for read in state.pending_reads.drain(..) {
                let _ = read.reply.send(QueryReply {
                    result: Err(detail.clone()),
                    commit_index,
                    leader: leader.clone(),
                });
            }
            if let Some((_, waiter)) = state.config_waiter.take() {
                let _ = waiter.send(Err(detail.clone()));
            }
        }
    }

    async fn persist_vote(&mut self) -> ConsensusResult<()> {
        self.storage
            .save_vote(
                &self.namespace,
                VoteRecord {
                    current_term: self.current_term.value(),
                    voted_for: self.voted_for.as_ref().map(|n| n.to_string()),
                },
            )
            .await
            .map_err(Error::from)
    }

    /// Observe a higher term: adopt it and fall back to the configured
    /// base role.
    async fn step_down(&mut self, term: Term, leader: Option<NodeId>) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            if let Err(e) = self.persist_vote().await {
                self.fail(e);
                return;
            }
        }
        self.leader = leader.clone();
        self.fail_waiters(Error::not_leader("leadership lost", leader));
        self.set_role(base_role(&self.configuration, &self.node_id));
        self.leader_state = None;
        self.votes_received.clear();
        self.reset_election_deadline();
    }

    async fn handle(&mut self, message: ReplicaMessage) {
        match message {
            ReplicaMessage::AppendEntries(request, reply) => {
                let response = self.handle_append_entries(request).await;
                let _ = reply.send(response);
            }
            ReplicaMessage::RequestVote(request, reply) => {
                let response = self.handle_request_vote(request).await;
                let _ = reply.send(response);
            }
            ReplicaMessage::InstallSnapshot(request, reply) => {
                let response = self.handle_install_snapshot(request).await;
                let _ = reply.send(response);
            }
            ReplicaMessage::Submit(submission, reply) => {
                self.handle_submit(submission, reply).await;
            }
            ReplicaMessage::Query {
                session_id,
                operation,
                args,
                consistency,
                last_commit,
                reply,
            } => {
                self.handle_query(session_id, operation, args, consistency, last_commit, reply);
            }
            ReplicaMessage::Reconfigure(change, reply) => {
                self.handle_reconfigure(change, reply).await;
            }
            ReplicaMessage::RegisterEventSink {
                session_id,
                sink,
                reply,
            } => {
                let known = self.state_machine.session_exists(session_id);
                if known {
                    for event in self.state_machine.session_events(session_id) {
                        let frame = SessionEventFrame {
                            session_id,
                            event_index: event.event_index,
                            previous_index: event.previous_index,
                            payload: event.payload,
                        };
                        if sink.try_send(frame).is_err() {
                            break;
                        }
                    }
                    self.event_sinks.insert(session_id, sink);
                }
                let _ = reply.send(known);
            }
            ReplicaMessage::Status(reply) => {
                let _ = reply.send(ReplicaStatus {
                    partition: self.partition.clone(),
                    role: self.role,
                    term: self.current_term,
                    leader: self.leader.clone(),
                    commit_index: self.log.commit_index(),
                    last_applied: self.state_machine.last_applied(),
                    first_index: self.log.first_index(),
                    last_index: self.log.last_index(),
                    configuration: self.configuration.clone(),
                });
            }
            ReplicaMessage::VoteReply {
                peer,
                guard,
                response,
            } => self.handle_vote_reply(peer, guard, response).await,
            ReplicaMessage::AppendReply {
                peer,
                guard,
                round,
                prev_sent,
                sent,
                response,
            } => {
                self.handle_append_reply(peer, guard, round, prev_sent, sent, response)
                    .await;
            }
            ReplicaMessage::SnapshotReply {
                peer,
                guard,
                sent_len,
                done,
                response,
            } => {
                self.handle_snapshot_reply(peer, guard, sent_len, done, response)
                    .await;
            }
            // Shutdown is intercepted by the run loop before dispatch.
            ReplicaMessage::Shutdown => {}
        }
    }

    // ---- Elections ----

    async fn start_election(&mut self) {
        if !self.configuration.is_voter(&self.node_id) {
            self.reset_election_deadline();
            return;
        }
        self.current_term = self.current_term.next();
        self.voted_for = Some(self.node_id.clone());
        if let Err(e) = self.persist_vote().await {
            self.fail(e);
            return;
        }
        self.set_role(RaftRole::Candidate);
        self.leader = None;
        self.votes_received = HashSet::from([self.node_id.clone()]);
        self.reset_election_deadline();

        info!(
            partition = %self.partition,
            node = %self.node_id,
            term = %self.current_term,
            "starting election"
        );

        if self.votes_received.len() >= self.configuration.quorum() {
            self.become_leader().await;
            return;
        }

        let guard = self.guard();
        let request = RequestVoteRequest {
            id: Uuid::new_v4(),
            partition: self.partition.clone(),
            term: self.current_term,
            candidate: self.node_id.clone(),
            last_index: self.log.last_index(),
            last_term: self.log.last_term(),
        };
        let timeout = self.raft.election_timeout_min;
        for peer in self.configuration.voters().cloned().collect::<Vec<_>>() {
            if peer == self.node_id {
                continue;
            }
            let network = self.network.clone();
            let tx = self.tx.clone();
            let mut request = request.clone();
            request.id = Uuid::new_v4();
            tokio::spawn(async move {
                if let Ok(response) = network.request(&peer, request, timeout).await {
                    let _ = tx
                        .send(ReplicaMessage::VoteReply {
                            peer,
                            guard,
                            response,
                        })
                        .await;
                }
            });
        }
    }

    async fn handle_request_vote(&mut self, request: RequestVoteRequest) -> RequestVoteResponse {
        if self.role == RaftRole::Inactive {
            return RequestVoteResponse {
                id: request.id,
                term: self.current_term,
                vote_granted: false,
            };
        }
        if request.term > self.current_term {
            self.step_down(request.term, None).await;
        }

        let up_to_date = request.last_term > self.log.last_term()
            || (request.last_term == self.log.last_term()
                && request.last_index >= self.log.last_index());
        let vote_granted = request.term == self.current_term
            && up_to_date
            && self
                .voted_for
                .as_ref()
                .map(|v| v == &request.candidate)
                .unwrap_or(true);

        if vote_granted {
            if self.voted_for.as_ref() != Some(&request.candidate) {
                self.voted_for = Some(request.candidate.clone());
                if let Err(e) = self.persist_vote().await {
                    self.fail(e);
                    return RequestVoteResponse {
                        id: request.id,
                        term: self.current_term,
                        vote_granted: false,
                    };
                }
            }
            self.reset_election_deadline();
            debug!(
                partition = %self.partition,
                candidate = %request.candidate,
                term = %request.term,
                "vote granted"
            );
        }
        RequestVoteResponse {
            id: request.id,
            term: self.current_term,
            vote_granted,
        }
    }

    async fn handle_vote_reply(
        &mut self,
        peer: NodeId,
        guard: Guard,
        response: RequestVoteResponse,
    ) {
        if response.term > self.current_term {
            self.step_down(response.term, None).await;
            return;
        }
        if !self.guard_valid(guard) || self.role != RaftRole::Candidate {
            return;
        }
        if response.vote_granted {
            self.votes_received.insert(peer);
            if self.votes_received.len() >= self.configuration.quorum() {
                self.become_leader().await;
            }
        }
    }

    async fn become_leader(&mut self) {
        info!(
            partition = %self.partition,
            node = %self.node_id,
            term = %self.current_term,
            "won election"
        );
        self.set_role(RaftRole::Leader);
        self.leader = Some(self.node_id.clone());

        let mut state = LeaderState::new(Instant::now());
        let next = self.log.last_index() + 1;
        for peer in self.configuration.replicas().cloned().collect::<Vec<_>>() {
            if peer == self.node_id {
                continue;
            }
            state.progress.insert(
                peer,
                Progress {
                    next_index: next,
                    match_index: 0,
                    inflight: false,
                    snapshot_offset: None,
                },
            );
        }
        self.leader_state = Some(state);

        // A no-op at the new term lets prior-term entries commit through
        // the current-term commit rule.
        match self.append_leader_entry(EntryPayload::Initialize).await {
            Ok(index) => {
                if let Some(state) = self.leader_state.as_mut() {
                    state.initialize_index = index;
                }
            }
            Err(e) => {
                self.fail(e);
                return;
            }
        }
        self.heartbeat_deadline = Instant::now() + self.raft.heartbeat_interval;
        self.broadcast_append();
    }

    // ---- Log writes (leader) ----

    async fn append_leader_entry(&mut self, payload: EntryPayload) -> ConsensusResult<LogIndex> {
        let index = self.log.last_index() + 1;
        let timestamp = Self::now_ms().max(self.last_timestamp);
        let entry = LogEntry {
            index,
            term: self.current_term,
            timestamp,
            payload,
        };
        self.log.append(vec![entry]).await?;
        self.last_timestamp = timestamp;
        self.advance_commit().await;
        Ok(index)
    }

    // ---- Replication (leader) ----

    fn broadcast_append(&mut self) {
        let Some(state) = self.leader_state.as_mut() else {
            return;
        };
        state.round += 1;
        let round = state.round;
        state.round_sent_at.insert(round, Instant::now());
        state.round_acks.insert(round, HashSet::new());

        // Drop bookkeeping for long-confirmed rounds.
        let confirmed = state.confirmed_round;
        state.round_sent_at.retain(|&r, _| r + 64 > round && r >= confirmed);
        state.round_acks.retain(|&r, _| r + 64 > round && r >= confirmed);

        for peer in self.configuration.replicas().cloned().collect::<Vec<_>>() {
            if peer != self.node_id {
                self.replicate_to(peer, round);
            }
        }
        // A single-voter partition has no peers to ack; the leader's own
        // vote already satisfies the quorum for this round.
        self.confirm_rounds(round);
    }

    fn replicate_to(&mut self, peer: NodeId, round: u64) {
        let first_index = self.log.first_index();
        let last_index = self.log.last_index();
        let snapshot = self.log.snapshot();
        let Some(state) = self.leader_state.as_mut() else {
            return;
        };
        let Some(progress) = state.progress.get_mut(&peer) else {
            return;
        };
        if progress.inflight {
            return;
        }

        // A follower that needs compacted entries gets the snapshot.
        if let Some(snapshot) = snapshot {
            if progress.next_index <= snapshot.index && progress.next_index < first_index {
                progress.inflight = true;
                if progress.snapshot_offset.is_none() {
                    progress.snapshot_offset = Some(0);
                }
                self.send_snapshot_chunk(peer);
                return;
            }
        }

        let prev_index = progress.next_index - 1;
        let Some(prev_term) = self.log.term(prev_index) else {
            // The needed entry was compacted between checks; next tick
            // takes the snapshot path.
            progress.next_index = first_index.min(prev_index).max(1);
            return;
        };
        let to = last_index.min(progress.next_index + self.raft.max_entries_per_append as u64 - 1);
        let entries = if progress.next_index <= to {
            self.log.range(progress.next_index, to + 1)
        } else {
            Vec::new()
        };
        let sent = entries.len();
        progress.inflight = true;

        let request = AppendEntriesRequest {
            id: Uuid::new_v4(),
            partition: self.partition.clone(),
            term: self.current_term,
            leader: self.node_id.clone(),
            prev_index,
            prev_term,
            entries,
            commit: self.log.commit_index(),
        };
        let guard = self.guard();
        let network = self.network.clone();
        let tx = self.tx.clone();
        let timeout = self.raft.heartbeat_interval * 3;
        tokio::spawn(async move {
            let response = network.request(&peer, request, timeout).await.ok();
            let _ = tx
                .send(ReplicaMessage::AppendReply {
                    peer,
                    guard,
                    round,
                    prev_sent: prev_index,
                    sent,
                    response,
                })
                .await;
        });
    }

    async fn handle_append_reply(
        &mut self,
        peer: NodeId,
        guard: Guard,
        round: u64,
        prev_sent: LogIndex,
        sent: usize,
        response: Option<AppendEntriesResponse>,
    ) {
        if let Some(response) = &response {
            if response.term > self.current_term {
                self.step_down(response.term, None).await;
                return;
            }
        }
        if !self.guard_valid(guard) || self.role != RaftRole::Leader {
            return;
        }
        let Some(state) = self.leader_state.as_mut() else {
            return;
        };
        let Some(progress) = state.progress.get_mut(&peer) else {
            return;
        };
        progress.inflight = false;

        let Some(response) = response else {
            // Lost or timed out; the next heartbeat retries.
            return;
        };

        if response.succeeded {
            let matched = prev_sent + sent as u64;
            if matched > progress.match_index {
                progress.match_index = matched;
            }
            progress.next_index = progress.match_index + 1;
            let behind = progress.next_index <= self.log.last_index();

            if self.configuration.is_voter(&peer) {
                if let Some(acks) = state.round_acks.get_mut(&round) {
                    acks.insert(peer.clone());
                }
                self.confirm_rounds(round);
            }
            self.advance_commit().await;
            if behind {
                self.replicate_to(peer, round);
            }
        } else {
            // Conflict-term fast backoff: jump to the follower's first
            // index of its conflicting term.
            progress.next_index = response
                .conflict_index
                .unwrap_or_else(|| prev_sent.max(1))
                .max(1)
                .min(self.log.last_index() + 1);
            self.replicate_to(peer, round);
        }
    }

    /// Count a majority of heartbeat acks for a round: this confirms the
    /// leader still held leadership when the round was sent, refreshing
    /// the lease and releasing linearizable reads queued before it.
    fn confirm_rounds(&mut self, round: u64) {
        let quorum = self.configuration.quorum();
        let self_votes = usize::from(self.configuration.is_voter(&self.node_id));
        let lease = self.raft.leader_lease();

        let Some(state) = self.leader_state.as_mut() else {
            return;
        };
        let acked = state
            .round_acks
            .get(&round)
            .map(|acks| acks.len())
            .unwrap_or(0);
        if acked + self_votes < quorum {
            return;
        }
        if round <= state.confirmed_round {
            return;
        }
        state.confirmed_round = round;
        if let Some(sent_at) = state.round_sent_at.get(&round) {
            state.lease_expiry = *sent_at + lease;
        }
        self.serve_ready_reads();
    }

    /// Serve parked linearizable reads whose round has been confirmed and
    /// whose recorded commit point has been applied.
    fn serve_ready_reads(&mut self) {
        let last_applied = self.state_machine.last_applied();
        let commit_index = self.log.commit_index();
        let leader = Some(self.node_id.clone());

        let Some(state) = self.leader_state.as_mut() else {
            return;
        };
        // Until this leader's own-term no-op is committed and applied, the
        // commit index can trail entries the previous leader already
        // committed; no read may be served below that point.
        if !state.own_term_committed || last_applied < state.initialize_index {
            return;
        }
        let confirmed = state.confirmed_round;
        let mut ready = Vec::new();
        let mut waiting = Vec::new();
        for read in state.pending_reads.drain(..) {
            if read.round <= confirmed && read.min_apply <= last_applied {
                ready.push(read);
            } else {
                waiting.push(read);
            }
        }
        state.pending_reads = waiting;
        for read in ready {
            let result = self
                .state_machine
                .query(read.session_id, &read.operation, &read.args)
                .map_err(ErrorDetail::from);
            let _ = read.reply.send(QueryReply {
                result,
                commit_index,
                leader: leader.clone(),
            });
        }
    }

    async fn advance_commit(&mut self) {
        if self.role != RaftRole::Leader {
            return;
        }
        let Some(state) = self.leader_state.as_ref() else {
            return;
        };
        let mut matches: Vec<LogIndex> = Vec::new();
        for voter in self.configuration.voters() {
            if voter == &self.node_id {
                matches.push(self.log.last_index());
            } else {
                matches.push(
                    state
                        .progress
                        .get(voter)
                        .map(|p| p.match_index)
                        .unwrap_or(0),
                );
            }
        }
        if matches.is_empty() {
            return;
        }
        matches.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matches[self.configuration.quorum() - 1];

        // Only an entry of the current term commits by counting; earlier
        // terms commit transitively through it.
        if candidate > self.log.commit_index()
            && self.log.term(candidate) == Some(self.current_term)
        {
            self.log.set_commit_index(candidate);
            self.on_commit_advanced().await;
        }
        self.apply_committed().await;
    }

    async fn on_commit_advanced(&mut self) {
        let commit = self.log.commit_index();
        let mut step_down_after_removal = false;
        if let Some(state) = self.leader_state.as_mut() {
            if state.initialize_index > 0 && state.initialize_index <= commit {
                state.own_term_committed = true;
            }
            if let Some(config_index) = state.config_change_index {
                if config_index <= commit {
                    state.config_change_index = None;
                    if let Some((index, waiter)) = state.config_waiter.take() {
                        if index <= commit {
                            let _ = waiter.send(Ok(()));
                        } else {
                            state.config_waiter = Some((index, waiter));
                        }
                    }
                    // A leader that removed or demoted itself steps down
                    // once the change is committed.
                    if !self.configuration.is_voter(&self.node_id) {
                        step_down_after_removal = true;
                    }
                }
            }
        }
        if step_down_after_removal {
            info!(
                partition = %self.partition,
                node = %self.node_id,
                "stepping down: no longer a voter after committed reconfiguration"
            );
            self.step_down(self.current_term, None).await;
        }
    }

    // ---- Apply loop ----

    async fn apply_committed(&mut self) {
        while self.state_machine.last_applied() < self.log.commit_index() {
            let index = self.state_machine.last_applied() + 1;
            let Some(entry) = self.log.get(index).cloned() else {
                break;
            };
            let effects = self.state_machine.apply(&entry);
            self.process_effects(effects);
        }
        self.maybe_compact().await;
        if self.role == RaftRole::Leader {
            self.serve_ready_reads();
        }
    }

    fn process_effects(&mut self, effects: Vec<ApplyEffect>) {
        let commit_index = self.log.commit_index();
        let leader = self.leader.clone();
        for effect in effects {
            match effect {
                ApplyEffect::SessionOpened { index, result } => {
                    if let Some(waiter) = self.index_waiters.remove(&index) {
                        let _ = waiter.send(SubmitReply {
                            result: result.map(|(session_id, timeout_ms)| {
                                SubmitOutput::SessionOpened {
                                    session_id,
                                    timeout_ms,
                                }
                            }),
                            commit_index,
                            leader: leader.clone(),
                        });
                    }
                }
                ApplyEffect::KeepAliveApplied {
                    index,
                    session_id,
                    success,
                } => {
                    if let Some(waiter) = self.index_waiters.remove(&index) {
                        let result = if success {
                            Ok(SubmitOutput::Applied)
                        } else {
                            Err(self.state_machine.missing_session_error(session_id).into())
                        };
                        let _ = waiter.send(SubmitReply {
                            result,
                            commit_index,
                            leader: leader.clone(),
                        });
                    }
                }
                ApplyEffect::SessionClosed {
                    index,
                    session_id,
                    existed,
                } => {
                    self.event_sinks.remove(&session_id);
                    if let Some(waiter) = self.index_waiters.remove(&index) {
                        let result = if existed {
                            Ok(SubmitOutput::Applied)
                        } else {
                            Err(self.state_machine.missing_session_error(session_id).into())
                        };
                        let _ = waiter.send(SubmitReply {
                            result,
                            commit_index,
                            leader: leader.clone(),
                        });
                    }
                }
                ApplyEffect::CommandApplied {
                    session_id,
                    sequence,
                    outcome,
                } => {
                    if let Some(waiter) = self.command_waiters.remove(&(session_id, sequence)) {
                        let _ = waiter.send(SubmitReply {
                            result: outcome.map(SubmitOutput::CommandResult),
                            commit_index,
                            leader: leader.clone(),
                        });
                    }
                }
                ApplyEffect::EventsPublished { session_id, events } => {
                    if self.role != RaftRole::Leader {
                        continue;
                    }
                    let mut drop_sink = false;
                    if let Some(sink) = self.event_sinks.get(&session_id) {
                        for event in events {
                            let frame = SessionEventFrame {
                                session_id,
                                event_index: event.event_index,
                                previous_index: event.previous_index,
                                payload: event.payload,
                            };
                            if sink.try_send(frame).is_err() {
                                drop_sink = true;
                                break;
                            }
                        }
                    }
                    if drop_sink {
                        self.event_sinks.remove(&session_id);
                    }
                }
                ApplyEffect::SessionExpired { session_id } => {
                    debug!(
                        partition = %self.partition,
                        session = %session_id,
                        "session expired"
                    );
                    self.event_sinks.remove(&session_id);
                }
            }
        }
    }

    async fn maybe_compact(&mut self) {
        let last_applied = self.state_machine.last_applied();
        let snapshot_floor = self.log.snapshot().map(|s| s.index).unwrap_or(0);
        if last_applied < snapshot_floor + self.raft.snapshot_threshold {
            return;
        }
        // The service is consulted before any snapshot work happens and
        // may veto the round.
        if !self.state_machine.can_compact(last_applied) {
            debug!(partition = %self.partition, "service vetoed compaction");
            return;
        }
        let machine = match self.state_machine.backup() {
            Ok(machine) => machine,
            Err(e) => {
                self.fail(e);
                return;
            }
        };
        let envelope = ReplicaSnapshot {
            configuration: self.configuration.clone(),
            configuration_index: self.effective_configuration_index(),
            machine,
        };
        let mut data = Vec::new();
        if let Err(e) = ciborium::ser::into_writer(&envelope, &mut data) {
            self.fail(Error::storage(format!("snapshot envelope encode: {e}")));
            return;
        }
        let Some(term) = self.log.term(last_applied) else {
            return;
        };
        let timestamp = self
            .log
            .get(last_applied)
            .map(|e| e.timestamp)
            .unwrap_or(self.last_timestamp);
        let meta = SnapshotMeta {
            index: last_applied,
            term: term.value(),
            timestamp,
        };
        if let Err(e) = self.log.compact(meta, Bytes::from(data)).await {
            self.fail(e);
            return;
        }
        info!(
            partition = %self.partition,
            index = last_applied,
            "took snapshot and compacted log"
        );
    }

    fn effective_configuration_index(&self) -> LogIndex {
        self.config_history
            .last()
            .map(|(index, _)| *index)
            .unwrap_or(0)
    }

    // ---- Configuration ----

    fn adopt_configuration(&mut self, index: LogIndex, configuration: Configuration) {
        info!(
            partition = %self.partition,
            index,
            members = configuration.members.len(),
            voters = configuration.voter_count(),
            "adopting configuration"
        );
        self.config_history.push((index, configuration.clone()));
        self.configuration = configuration;

        if self.role == RaftRole::Leader {
            let next = self.log.last_index() + 1;
            if let Some(state) = self.leader_state.as_mut() {
                let members: Vec<NodeId> =
                    self.configuration.replicas().cloned().collect();
                for peer in &members {
                    if peer != &self.node_id && !state.progress.contains_key(peer) {
                        state.progress.insert(
                            peer.clone(),
                            Progress {
                                next_index: next,
                                match_index: 0,
                                inflight: false,
                                snapshot_offset: None,
                            },
                        );
                    }
                }
                state
                    .progress
                    .retain(|peer, _| members.iter().any(|m| m == peer));
            }
        } else if !matches!(self.role, RaftRole::Candidate) {
            let base = base_role(&self.configuration, &self.node_id);
            // A promotion or demotion adjusts the base role in place; a
            // node that vanished from the membership goes inactive.
            if base != self.role {
                self.set_role(base);
                if base == RaftRole::Follower {
                    self.reset_election_deadline();
                }
            }
        }
    }

    fn revert_configurations_beyond(&mut self, index: LogIndex) {
        while self
            .config_history
            .last()
            .map(|(i, _)| *i > index)
            .unwrap_or(false)
        {
            self.config_history.pop();
        }
        if let Some((_, configuration)) = self.config_history.last() {
            self.configuration = configuration.clone();
        }
    }

    async fn handle_reconfigure(
        &mut self,
        change: ConfigurationChange,
        reply: oneshot::Sender<Result<(), ErrorDetail>>,
    ) {
        if self.role != RaftRole::Leader {
            let _ = reply.send(Err(Error::not_leader(
                "reconfiguration requires the leader",
                self.leader.clone(),
            )
            .into()));
            return;
        }
        let (own_term_committed, change_inflight) = self
            .leader_state
            .as_ref()
            .map(|s| (s.own_term_committed, s.config_change_index.is_some()))
            .unwrap_or((false, false));
        if !own_term_committed {
            let _ = reply.send(Err(Error::unavailable(
                "leader has not yet committed an entry of its own term",
            )
            .into()));
            return;
        }
        if change_inflight {
            let _ = reply.send(Err(Error::illegal_state(
                "a configuration change is already in flight",
            )
            .into()));
            return;
        }
        let new_configuration = match self.configuration.apply_change(&change) {
            Ok(configuration) => configuration,
            Err(message) => {
                let _ = reply.send(Err(Error::illegal_state(message).into()));
                return;
            }
        };
        if new_configuration.voter_count() == 0 {
            let _ = reply.send(Err(Error::illegal_state(
                "a partition cannot be left without voters",
            )
            .into()));
            return;
        }

        // The change is adopted on receipt and the waiter parked before
        // the append: a single-voter partition commits the entry inside
        // the append itself, and the commit bookkeeping resolves the
        // waiter.
        let index = self.log.last_index() + 1;
        self.adopt_configuration(index, new_configuration.clone());
        if let Some(state) = self.leader_state.as_mut() {
            state.config_change_index = Some(index);
            state.config_waiter = Some((index, reply));
        }
        if let Err(e) = self
            .append_leader_entry(EntryPayload::Configuration(new_configuration))
            .await
        {
            // fail() answers the parked waiter with the failure.
            self.fail(e);
            return;
        }
        self.broadcast_append();
    }

    // ---- AppendEntries (replica side) ----

    async fn handle_append_entries(
        &mut self,
        request: AppendEntriesRequest,
    ) -> AppendEntriesResponse {
        let request_id = request.id;
        let reject = move |term: Term, last: LogIndex, conflict: Option<LogIndex>| {
            AppendEntriesResponse {
                id: request_id,
                term,
                succeeded: false,
                last_log_index: last,
                conflict_index: conflict,
            }
        };

        if self.role == RaftRole::Inactive || request.term < self.current_term {
            return reject(self.current_term, self.log.last_index(), None);
        }

        // Recognize the sender as leader for this term.
        if request.term > self.current_term
            || self.role == RaftRole::Candidate
            || self.leader.as_ref() != Some(&request.leader)
        {
            self.step_down(request.term, Some(request.leader.clone())).await;
            if self.role == RaftRole::Inactive {
                return reject(self.current_term, self.log.last_index(), None);
            }
        }
        // A reserve replica receiving entries has been promoted by a
        // configuration it has not seen yet; treat it as passive until
        // the configuration entry arrives.
        if self.role == RaftRole::Reserve {
            self.set_role(RaftRole::Passive);
        }
        self.leader = Some(request.leader.clone());
        self.reset_election_deadline();

        // Log consistency check.
        if request.prev_index > 0 {
            match self.log.term(request.prev_index) {
                None => {
                    let conflict = if request.prev_index > self.log.last_index() {
                        self.log.last_index() + 1
                    } else {
                        self.log.first_index()
                    };
                    return reject(self.current_term, self.log.last_index(), Some(conflict));
                }
                Some(term) if term != request.prev_term => {
                    let conflict = self.log.first_index_of_term_at(request.prev_index);
                    return reject(self.current_term, self.log.last_index(), Some(conflict));
                }
                Some(_) => {}
            }
        }

        // Append, truncating a conflicting suffix.
        let mut to_append: Vec<LogEntry> = Vec::new();
        let mut truncated = false;
        for entry in request.entries {
            if truncated {
                to_append.push(entry);
                continue;
            }
            match self.log.term(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    if entry.index <= self.log.commit_index() {
                        self.fail(Error::illegal_state(format!(
                            "leader would overwrite committed entry {} in {}",
                            entry.index, self.partition
                        )));
                        return reject(self.current_term, self.log.last_index(), None);
                    }
                    if let Err(e) = self.log.truncate_after(entry.index - 1).await {
                        self.fail(e);
                        return reject(self.current_term, self.log.last_index(), None);
                    }
                    self.revert_configurations_beyond(entry.index - 1);
                    truncated = true;
                    to_append.push(entry);
                }
                None => to_append.push(entry),
            }
        }

        let adopted: Vec<(LogIndex, Configuration)> = to_append
            .iter()
            .filter_map(|entry| match &entry.payload {
                EntryPayload::Configuration(configuration) => {
                    Some((entry.index, configuration.clone()))
                }
                _ => None,
            })
            .collect();

        if let Some(last) = to_append.last() {
            self.last_timestamp = self.last_timestamp.max(last.timestamp);
        }
        if !to_append.is_empty() {
            if let Err(e) = self.log.append(to_append).await {
                self.fail(e);
                return reject(self.current_term, self.log.last_index(), None);
            }
        }

        // Configuration entries take effect on receipt, not on commit.
        for (index, configuration) in adopted {
            self.adopt_configuration(index, configuration);
        }

        self.log.set_commit_index(request.commit);
        self.apply_committed().await;

        AppendEntriesResponse {
            id: request.id,
            term: self.current_term,
            succeeded: true,
            last_log_index: self.log.last_index(),
            conflict_index: None,
        }
    }

    // ---- Snapshot install (replica side) ----

    async fn handle_install_snapshot(
        &mut self,
        request: InstallSnapshotRequest,
    ) -> InstallSnapshotResponse {
        if self.role == RaftRole::Inactive || request.term < self.current_term {
            return InstallSnapshotResponse {
                id: request.id,
                term: self.current_term,
                accepted: false,
                next_offset: 0,
            };
        }
        if request.term > self.current_term || self.leader.as_ref() != Some(&request.leader) {
            self.step_down(request.term, Some(request.leader.clone())).await;
        }
        self.reset_election_deadline();

        let restart = match &self.pending_snapshot {
            Some(pending) => pending.index != request.index,
            None => true,
        };
        if restart {
            if request.offset != 0 {
                return InstallSnapshotResponse {
                    id: request.id,
                    term: self.current_term,
                    accepted: false,
                    next_offset: 0,
                };
            }
            self.pending_snapshot = Some(PendingSnapshot {
                index: request.index,
                term: request.term_at,
                timestamp: request.timestamp,
                buffer: Vec::new(),
            });
        }
        let Some(pending) = self.pending_snapshot.as_mut() else {
            return InstallSnapshotResponse {
                id: request.id,
                term: self.current_term,
                accepted: false,
                next_offset: 0,
            };
        };
        if request.offset != pending.buffer.len() as u64 {
            return InstallSnapshotResponse {
                id: request.id,
                term: self.current_term,
                accepted: false,
                next_offset: pending.buffer.len() as u64,
            };
        }
        pending.buffer.extend_from_slice(&request.data);
        let next_offset = pending.buffer.len() as u64;

        if request.done {
            let Some(pending) = self.pending_snapshot.take() else {
                return InstallSnapshotResponse {
                    id: request.id,
                    term: self.current_term,
                    accepted: false,
                    next_offset: 0,
                };
            };
            let envelope: ReplicaSnapshot =
                match ciborium::de::from_reader(pending.buffer.as_slice()) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        self.fail(Error::storage(format!("snapshot envelope decode: {e}")));
                        return InstallSnapshotResponse {
                            id: request.id,
                            term: self.current_term,
                            accepted: false,
                            next_offset: 0,
                        };
                    }
                };
            if let Err(e) = self.state_machine.restore(&envelope.machine) {
                self.fail(e);
                return InstallSnapshotResponse {
                    id: request.id,
                    term: self.current_term,
                    accepted: false,
                    next_offset: 0,
                };
            }
            let meta = SnapshotMeta {
                index: pending.index,
                term: pending.term.value(),
                timestamp: pending.timestamp,
            };
            if let Err(e) = self
                .log
                .reset_to_snapshot(meta, Bytes::from(pending.buffer))
                .await
            {
                self.fail(e);
                return InstallSnapshotResponse {
                    id: request.id,
                    term: self.current_term,
                    accepted: false,
                    next_offset: 0,
                };
            }
            self.config_history = vec![(envelope.configuration_index, envelope.configuration.clone())];
            self.configuration = envelope.configuration;
            self.last_timestamp = self.last_timestamp.max(pending.timestamp);
            info!(
                partition = %self.partition,
                index = meta.index,
                "installed snapshot"
            );
        }

        InstallSnapshotResponse {
            id: request.id,
            term: self.current_term,
            accepted: true,
            next_offset,
        }
    }

    // ---- Snapshot send (leader side) ----

    fn send_snapshot_chunk(&mut self, peer: NodeId) {
        if self.log.snapshot().is_none() {
            if let Some(state) = self.leader_state.as_mut() {
                if let Some(progress) = state.progress.get_mut(&peer) {
                    progress.inflight = false;
                    progress.snapshot_offset = None;
                }
            }
            return;
        }
        let storage = self.storage.clone();
        let namespace = self.namespace.clone();
        let network = self.network.clone();
        let tx = self.tx.clone();
        let guard = self.guard();
        let partition = self.partition.clone();
        let node_id = self.node_id.clone();
        let term = self.current_term;
        let chunk_size = self.raft.snapshot_chunk_size;
        let timeout = self.raft.heartbeat_interval * 6;

        let offset = match self.leader_state.as_ref() {
            Some(state) => state
                .progress
                .get(&peer)
                .and_then(|p| p.snapshot_offset)
                .unwrap_or(0),
            None => return,
        };

        tokio::spawn(async move {
            // The durable snapshot is reloaded for every chunk: compaction
            // may replace it mid-transfer, and a changed index makes the
            // follower restart the transfer at offset zero.
            let loaded = storage.load_snapshot(&namespace).await.ok().flatten();
            let Some((meta, data)) = loaded else {
                let _ = tx
                    .send(ReplicaMessage::SnapshotReply {
                        peer,
                        guard,
                        sent_len: 0,
                        done: false,
                        response: None,
                    })
                    .await;
                return;
            };
            let start = (offset as usize).min(data.len());
            let end = (start + chunk_size).min(data.len());
            let done = end == data.len();
            let request = InstallSnapshotRequest {
                id: Uuid::new_v4(),
                partition,
                term,
                leader: node_id,
                index: meta.index,
                term_at: Term::new(meta.term),
                timestamp: meta.timestamp,
                offset: start as u64,
                data: data.slice(start..end),
                done,
            };
            let response = network.request(&peer, request, timeout).await.ok();
            let _ = tx
                .send(ReplicaMessage::SnapshotReply {
                    peer,
                    guard,
                    sent_len: end - start,
                    done,
                    response,
                })
                .await;
        });
    }

    async fn handle_snapshot_reply(
        &mut self,
        peer: NodeId,
        guard: Guard,
        sent_len: usize,
        done: bool,
        response: Option<InstallSnapshotResponse>,
    ) {
        if let Some(response) = &response {
            if response.term > self.current_term {
                self.step_down(response.term, None).await;
                return;
            }
        }
        if !self.guard_valid(guard) || self.role != RaftRole::Leader {
            return;
        }
        let snapshot_index = self.log.snapshot().map(|s| s.index).unwrap_or(0);
        let Some(state) = self.leader_state.as_mut() else {
            return;
        };
        let Some(progress) = state.progress.get_mut(&peer) else {
            return;
        };
        progress.inflight = false;

        let Some(response) = response else {
            return;
        };
        if !response.accepted {
            progress.snapshot_offset = Some(response.next_offset);
            self.send_snapshot_chunk_with_inflight(peer);
            return;
        }
        if done {
            progress.snapshot_offset = None;
            progress.next_index = snapshot_index + 1;
            progress.match_index = progress.match_index.max(snapshot_index);
            let round = state.round;
            self.replicate_to(peer, round);
        } else {
            let offset = progress.snapshot_offset.unwrap_or(0) + sent_len as u64;
            progress.snapshot_offset = Some(offset);
            self.send_snapshot_chunk_with_inflight(peer);
        }
    }

    fn send_snapshot_chunk_with_inflight(&mut self, peer: NodeId) {
        if let Some(state) = self.leader_state.as_mut() {
            if let Some(progress) = state.progress.get_mut(&peer) {
                progress.inflight = true;
            }
        }
        self.send_snapshot_chunk(peer);
    }

    // ---- Client submissions ----

    async fn handle_submit(&mut self, submission: Submission, reply: oneshot::Sender<SubmitReply>) {
        if self.role != RaftRole::Leader {
            let error = match &self.leader {
                Some(leader) => Error::not_leader("not the partition leader", Some(leader.clone())),
                None => Error::no_leader("no leader elected for the partition"),
            };
            let _ = reply.send(SubmitReply {
                result: Err(error.into()),
                commit_index: self.log.commit_index(),
                leader: self.leader.clone(),
            });
            return;
        }

        let payload = match submission {
            Submission::OpenSession {
                member,
                primitive,
                service_type,
                timeout_ms,
            } => EntryPayload::OpenSession(OpenSessionEntry {
                member,
                primitive,
                service_type,
                timeout_ms,
            }),
            Submission::KeepAlive {
                session_id,
                command_ack,
                event_ack,
            } => EntryPayload::KeepAlive(KeepAliveEntry {
                session_id,
                command_ack,
                event_ack,
            }),
            Submission::CloseSession { session_id } => {
                EntryPayload::CloseSession(CloseSessionEntry { session_id })
            }
            Submission::Command {
                session_id,
                sequence,
                operation,
                args,
            } => {
                // Only a decisively closed session is rejected up front; a
                // session this replica has not applied yet still gets its
                // command appended, and the apply loop gives the
                // authoritative answer once the open entry precedes it.
                if self.state_machine.session_was_closed(session_id) {
                    let _ = reply.send(SubmitReply {
                        result: Err(self.state_machine.missing_session_error(session_id).into()),
                        commit_index: self.log.commit_index(),
                        leader: self.leader.clone(),
                    });
                    return;
                }
                EntryPayload::Command(CommandEntry {
                    session_id,
                    sequence,
                    operation,
                    args,
                })
            }
        };

        // The waiter is parked before the append: a single-voter partition
        // commits and applies the entry inside the append itself, and the
        // apply effect resolves the waiter.
        let waiter_key = match &payload {
            EntryPayload::Command(command) => {
                self.command_waiters
                    .insert((command.session_id, command.sequence), reply);
                WaiterKey::Command(command.session_id, command.sequence)
            }
            _ => {
                let index = self.log.last_index() + 1;
                self.index_waiters.insert(index, reply);
                WaiterKey::Index(index)
            }
        };

        if let Err(e) = self.append_leader_entry(payload).await {
            let detail = ErrorDetail::from(&e);
            let waiter = match waiter_key {
                WaiterKey::Command(session_id, sequence) => {
                    self.command_waiters.remove(&(session_id, sequence))
                }
                WaiterKey::Index(index) => self.index_waiters.remove(&index),
            };
            self.fail(e);
            if let Some(waiter) = waiter {
                let _ = waiter.send(SubmitReply {
                    result: Err(detail),
                    commit_index: self.log.commit_index(),
                    leader: self.leader.clone(),
                });
            }
            return;
        }
        self.broadcast_append();
    }

    // ---- Queries ----

    fn handle_query(
        &mut self,
        session_id: SessionId,
        operation: String,
        args: Bytes,
        consistency: ConsistencyLevel,
        last_commit: LogIndex,
        reply: oneshot::Sender<QueryReply>,
    ) {
        let commit_index = self.log.commit_index();
        let leader = self.leader.clone();
        let respond = |result: Result<Bytes, ErrorDetail>, reply: oneshot::Sender<QueryReply>| {
            let _ = reply.send(QueryReply {
                result,
                commit_index,
                leader,
            });
        };

        match consistency {
            ConsistencyLevel::Eventual => {
                let result = self
                    .state_machine
                    .query(session_id, &operation, &args)
                    .map_err(ErrorDetail::from);
                respond(result, reply);
            }
            ConsistencyLevel::Sequential => {
                // The session's reads must be monotonic in observed commit
                // index; a lagging replica refuses rather than travel back
                // in time.
                if last_commit > self.log.commit_index() {
                    respond(
                        Err(Error::read_stale(format!(
                            "replica at commit {} behind session at {}",
                            self.log.commit_index(),
                            last_commit
                        ))
                        .into()),
                        reply,
                    );
                    return;
                }
                let result = self
                    .state_machine
                    .query(session_id, &operation, &args)
                    .map_err(ErrorDetail::from);
                respond(result, reply);
            }
            ConsistencyLevel::LinearizableLease => {
                if self.role != RaftRole::Leader {
                    respond(
                        Err(Error::not_leader(
                            "lease reads require the leader",
                            self.leader.clone(),
                        )
                        .into()),
                        reply,
                    );
                    return;
                }
                // The lease is only usable once an entry of this leader's
                // own term has committed; before that the local state may
                // trail writes the previous leader committed.
                let lease_valid = self
                    .leader_state
                    .as_ref()
                    .map(|s| s.own_term_committed && Instant::now() < s.lease_expiry)
                    .unwrap_or(false);
                if lease_valid {
                    let result = self
                        .state_machine
                        .query(session_id, &operation, &args)
                        .map_err(ErrorDetail::from);
                    respond(result, reply);
                } else {
                    // Lease lapsed or not yet earned; fall back to a
                    // confirmed round.
                    self.enqueue_linearizable_read(session_id, operation, args, reply);
                }
            }
            ConsistencyLevel::Linearizable => {
                if self.role != RaftRole::Leader {
                    respond(
                        Err(Error::not_leader(
                            "linearizable reads require the leader",
                            self.leader.clone(),
                        )
                        .into()),
                        reply,
                    );
                    return;
                }
                self.enqueue_linearizable_read(session_id, operation, args, reply);
            }
        }
    }

    /// Park a read until the next heartbeat round is confirmed by a
    /// majority, proving this replica was still leader after the read
    /// was accepted.
    fn enqueue_linearizable_read(
        &mut self,
        session_id: SessionId,
        operation: String,
        args: Bytes,
        reply: oneshot::Sender<QueryReply>,
    ) {
        let commit_index = self.log.commit_index();
        let Some(state) = self.leader_state.as_mut() else {
            let _ = reply.send(QueryReply {
                result: Err(Error::no_leader("leader state unavailable").into()),
                commit_index,
                leader: self.leader.clone(),
            });
            return;
        };
        // A fresh leader's commit index trails its own-term no-op; the
        // read point must cover that entry before the read can be served.
        let min_apply = commit_index.max(state.initialize_index);
        state.pending_reads.push(PendingRead {
            round: state.round + 1,
            min_apply,
            session_id,
            operation,
            args,
            reply,
        });
        self.heartbeat_deadline = Instant::now() + self.raft.heartbeat_interval;
        self.broadcast_append();
    }
}
