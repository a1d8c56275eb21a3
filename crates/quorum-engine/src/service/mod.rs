//! Primitive services.
//!
//! A primitive service is the deterministic state machine a partition
//! hosts. It is driven exclusively from its replica's apply loop, so it
//! observes a total order and must never consult wall-clock time, random
//! numbers or external I/O; all time comes from the replicated entry
//! timestamp in the context.

mod counter;
mod directory;
mod host;
mod map;
mod registry;

pub use counter::CounterService;
pub use directory::{DirectoryService, PrimitiveRecord, RegisterPrimitive};
pub use host::{ApplyEffect, StateMachine};
pub use map::{MapEntry, MapEvent, MapService};
pub use registry::{ServiceRegistry, ServiceRegistryBuilder};

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::foundation::{LogIndex, RaftRole, SessionId};
use crate::session::CloseReason;

/// Errors a primitive service may return. Messages must be deterministic:
/// they are cached in session response caches and compared across replicas.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// The operation name is not understood
    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    /// The arguments did not decode
    #[error("bad arguments: {0}")]
    BadArguments(String),

    /// The operation failed
    #[error("{0}")]
    Failed(String),
}

/// Where a published event is delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTarget {
    /// The session that issued the current command
    CurrentSession,
    /// One specific session
    Session(SessionId),
    /// Every open session on the partition
    AllSessions,
}

/// Context for applying a command.
#[derive(Debug)]
pub struct CommandContext<'a> {
    /// Log index of the entry being applied
    pub index: LogIndex,
    /// Replicated timestamp of the entry
    pub timestamp: i64,
    /// Role of the replica driving the apply
    pub role: RaftRole,
    /// Session that issued the command
    pub session_id: SessionId,
    events: &'a mut Vec<(EventTarget, Bytes)>,
}

impl<'a> CommandContext<'a> {
    pub(crate) fn new(
        index: LogIndex,
        timestamp: i64,
        role: RaftRole,
        session_id: SessionId,
        events: &'a mut Vec<(EventTarget, Bytes)>,
    ) -> Self {
        Self {
            index,
            timestamp,
            role,
            session_id,
            events,
        }
    }

    /// Publish an event to the issuing session
    pub fn publish(&mut self, payload: Bytes) {
        self.events.push((EventTarget::CurrentSession, payload));
    }

    /// Publish an event to a chosen audience
    pub fn publish_to(&mut self, target: EventTarget, payload: Bytes) {
        self.events.push((target, payload));
    }
}

/// Context for applying a query.
#[derive(Debug, Clone, Copy)]
pub struct QueryContext {
    /// Highest applied log index
    pub index: LogIndex,
    /// Timestamp of the last applied entry
    pub timestamp: i64,
    /// Role of the replica serving the read
    pub role: RaftRole,
    /// Session the read belongs to
    pub session_id: SessionId,
}

/// A deterministic replicated state machine.
pub trait PrimitiveService: Send + 'static {
    /// Apply a mutating command. Called once per committed command in log
    /// order; must be deterministic.
    fn apply_command(
        &mut self,
        ctx: &mut CommandContext<'_>,
        operation: &str,
        args: &[u8],
    ) -> Result<Bytes, ServiceError>;

    /// Apply a read-only query against current state.
    fn apply_query(
        &self,
        ctx: &QueryContext,
        operation: &str,
        args: &[u8],
    ) -> Result<Bytes, ServiceError>;

    /// A session bound to this service was opened
    fn session_opened(&mut self, _session: SessionId) {}

    /// A session bound to this service went away
    fn session_closed(&mut self, _session: SessionId, _reason: CloseReason) {}

    /// Serialize service state for a snapshot
    fn backup(&self, out: &mut Vec<u8>) -> Result<(), ServiceError>;

    /// Replace service state from a snapshot
    fn restore(&mut self, data: &[u8]) -> Result<(), ServiceError>;

    /// Whether the log up to `index` may be compacted away. Consulted
    /// before the snapshot is taken; returning `false` defers compaction.
    fn can_delete(&self, _index: LogIndex) -> bool {
        true
    }
}

/// Decode CBOR operation arguments
pub fn decode_args<T: DeserializeOwned>(args: &[u8]) -> Result<T, ServiceError> {
    ciborium::de::from_reader(args).map_err(|e| ServiceError::BadArguments(e.to_string()))
}

/// Encode a CBOR operation result
pub fn encode_value<T: Serialize>(value: &T) -> Result<Bytes, ServiceError> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)
        .map_err(|e| ServiceError::Failed(format!("encode: {e}")))?;
    Ok(Bytes::from(buf))
}
