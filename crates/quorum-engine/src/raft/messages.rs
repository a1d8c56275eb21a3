//! Wire RPC types.
//!
//! Raft RPCs flow replica-to-replica; submit and query RPCs flow from the
//! partition client to the leader (or, for weaker reads, any replica).
//! Every message carries the sender's term and leader estimate where
//! relevant so stale-leader replies can be discarded by the receiving
//! actor.

use bytes::Bytes;
use quorum_network::ServiceMessage;
use quorum_topology::NodeId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorDetail;
use crate::foundation::{ConsistencyLevel, LogIndex, PartitionRef, SessionId, Term};
use crate::raft::types::{ConfigurationChange, LogEntry};

/// Normative action tag for command submission
pub const SUBMIT_COMMAND_ACTION: &str = "submitCommand";

/// Log replication / heartbeat request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Request ID
    pub id: Uuid,
    /// Target partition
    pub partition: PartitionRef,
    /// Leader's term
    pub term: Term,
    /// The leader sending this request
    pub leader: NodeId,
    /// Index of the entry preceding `entries`
    pub prev_index: LogIndex,
    /// Term of the entry at `prev_index`
    pub prev_term: Term,
    /// Entries to append (empty for heartbeats)
    pub entries: Vec<LogEntry>,
    /// Leader's commit index
    pub commit: LogIndex,
}

/// Log replication / heartbeat response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Request ID this responds to
    pub id: Uuid,
    /// Responder's term
    pub term: Term,
    /// Whether the entries were appended
    pub succeeded: bool,
    /// Responder's last log index
    pub last_log_index: LogIndex,
    /// On rejection: first index of the responder's conflicting term, so
    /// the leader can skip the whole term instead of probing entry by entry
    pub conflict_index: Option<LogIndex>,
}

impl ServiceMessage for AppendEntriesRequest {
    type Response = AppendEntriesResponse;
    fn service_id() -> &'static str {
        "raft.appendEntries"
    }
}

/// Vote solicitation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// Request ID
    pub id: Uuid,
    /// Target partition
    pub partition: PartitionRef,
    /// Candidate's term
    pub term: Term,
    /// The candidate requesting the vote
    pub candidate: NodeId,
    /// Candidate's last log index
    pub last_index: LogIndex,
    /// Candidate's last log term
    pub last_term: Term,
}

/// Vote response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// Request ID this responds to
    pub id: Uuid,
    /// Responder's term
    pub term: Term,
    /// Whether the vote was granted
    pub vote_granted: bool,
}

impl ServiceMessage for RequestVoteRequest {
    type Response = RequestVoteResponse;
    fn service_id() -> &'static str {
        "raft.requestVote"
    }
}

/// One chunk of a snapshot transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// Request ID
    pub id: Uuid,
    /// Target partition
    pub partition: PartitionRef,
    /// Leader's term
    pub term: Term,
    /// The leader sending this snapshot
    pub leader: NodeId,
    /// Log index the snapshot covers
    pub index: LogIndex,
    /// Term of the entry at `index`
    pub term_at: Term,
    /// Timestamp of the entry at `index`
    pub timestamp: i64,
    /// Byte offset of this chunk
    pub offset: u64,
    /// Chunk data
    pub data: Bytes,
    /// Whether this is the final chunk
    pub done: bool,
}

/// Snapshot chunk acknowledgement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// Request ID this responds to
    pub id: Uuid,
    /// Responder's term
    pub term: Term,
    /// Whether the chunk was accepted at its offset
    pub accepted: bool,
    /// The offset the responder expects next
    pub next_offset: u64,
}

impl ServiceMessage for InstallSnapshotRequest {
    type Response = InstallSnapshotResponse;
    fn service_id() -> &'static str {
        "raft.installSnapshot"
    }
}

/// Admin request to change a partition's membership
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconfigureRequest {
    /// Request ID
    pub id: Uuid,
    /// Target partition
    pub partition: PartitionRef,
    /// The single-member change to apply
    pub change: ConfigurationChange,
}

/// Reconfiguration response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconfigureResponse {
    /// Request ID this responds to
    pub id: Uuid,
    /// Success, or the error that prevented the change
    pub result: Result<(), ErrorDetail>,
}

impl ServiceMessage for ReconfigureRequest {
    type Response = ReconfigureResponse;
    fn service_id() -> &'static str {
        "raft.reconfigure"
    }
}

/// A session-scoped submission. Session lifecycle operations are command
/// subtypes: they travel the same path and are replicated as log entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Submission {
    /// Open a new session
    OpenSession {
        /// Node the client is connected through
        member: NodeId,
        /// Primitive name
        primitive: String,
        /// Service type hosting the primitive
        service_type: String,
        /// Requested session timeout in milliseconds
        timeout_ms: u64,
    },
    /// Refresh a session, acknowledging commands and events
    KeepAlive {
        /// Session to refresh
        session_id: SessionId,
        /// Highest command sequence whose result arrived
        command_ack: u64,
        /// Highest event index that arrived
        event_ack: LogIndex,
    },
    /// Close a session
    CloseSession {
        /// Session to close
        session_id: SessionId,
    },
    /// A state-machine command
    Command {
        /// Owning session
        session_id: SessionId,
        /// Per-session sequence number
        sequence: u64,
        /// Operation name
        operation: String,
        /// Operation arguments
        args: Bytes,
    },
}

/// Command submission request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitCommandRequest {
    /// Request ID
    pub id: Uuid,
    /// Target partition
    pub partition: PartitionRef,
    /// The submission
    pub submission: Submission,
}

/// Output of a successful submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SubmitOutput {
    /// A session was opened
    SessionOpened {
        /// The new session's ID
        session_id: SessionId,
        /// Granted timeout in milliseconds
        timeout_ms: u64,
    },
    /// A keep-alive or close was applied
    Applied,
    /// A command produced a result
    CommandResult(Bytes),
}

/// Command submission response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitCommandResponse {
    /// Request ID this responds to
    pub id: Uuid,
    /// The output, or the error the caller must recover from
    pub result: Result<SubmitOutput, ErrorDetail>,
    /// Responder's commit index at reply time
    pub commit_index: LogIndex,
    /// Responder's leader estimate
    pub leader: Option<NodeId>,
}

impl ServiceMessage for SubmitCommandRequest {
    type Response = SubmitCommandResponse;
    fn service_id() -> &'static str {
        "primitive.submitCommand"
    }
}

/// Query request, served under the requested consistency level
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Request ID
    pub id: Uuid,
    /// Target partition
    pub partition: PartitionRef,
    /// Session the read belongs to
    pub session_id: SessionId,
    /// Operation name
    pub operation: String,
    /// Operation arguments
    pub args: Bytes,
    /// Requested consistency level
    pub consistency: ConsistencyLevel,
    /// Highest commit index this session has observed (sequential reads)
    pub last_commit: LogIndex,
}

/// Query response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Request ID this responds to
    pub id: Uuid,
    /// The result, or the error the caller must recover from
    pub result: Result<Bytes, ErrorDetail>,
    /// Responder's commit index at reply time
    pub commit_index: LogIndex,
    /// Responder's leader estimate
    pub leader: Option<NodeId>,
}

impl ServiceMessage for QueryRequest {
    type Response = QueryResponse;
    fn service_id() -> &'static str {
        "primitive.query"
    }
}

/// Metadata keys for the session event stream
pub mod event_stream {
    /// Stream type registered with the network manager
    pub const STREAM_TYPE: &str = "session.events";
    /// Metadata key: target partition (display form `group/partition`)
    pub const PARTITION_KEY: &str = "partition";
    /// Metadata key: session ID
    pub const SESSION_KEY: &str = "session";
}

/// One session event pushed to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEventFrame {
    /// Session the event belongs to
    pub session_id: SessionId,
    /// Log index at which the event was published
    pub event_index: LogIndex,
    /// Event index of the previous event for this session
    pub previous_index: LogIndex,
    /// Service-defined event payload
    pub payload: Bytes,
}
