//! Deterministic state machine host.
//!
//! One [`StateMachine`] per partition replica: it owns the primitive
//! service instance and the session table and is driven entry by entry
//! from the replica's apply loop. Everything here is synchronous and
//! deterministic; identical entry sequences produce identical state and
//! identical effects on every replica.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ConsensusResult, Error, ErrorDetail};
use crate::foundation::{LogIndex, PartitionRef, RaftRole, SessionId};
use crate::raft::{CommandEntry, EntryPayload, LogEntry};
use crate::session::{CloseReason, CommandDisposition, CommandOutcome, Session, SessionEvent,
    SessionManager};

use super::{CommandContext, EventTarget, PrimitiveService, QueryContext, ServiceRegistry};

/// Effect of applying one entry, surfaced to the replica so it can answer
/// waiting clients and push events.
#[derive(Debug)]
pub enum ApplyEffect {
    /// A session-open entry was applied
    SessionOpened {
        /// Index of the open entry (doubles as the waiter key)
        index: LogIndex,
        /// The new session, or why it could not be opened
        result: Result<(SessionId, u64), ErrorDetail>,
    },
    /// A keep-alive entry was applied
    KeepAliveApplied {
        /// Index of the keep-alive entry
        index: LogIndex,
        /// Session it addressed
        session_id: SessionId,
        /// False if the session is unknown
        success: bool,
    },
    /// A close-session entry was applied
    SessionClosed {
        /// Index of the close entry
        index: LogIndex,
        /// Session it addressed
        session_id: SessionId,
        /// Whether the session existed
        existed: bool,
    },
    /// A command was applied (or deduplicated)
    CommandApplied {
        /// Owning session
        session_id: SessionId,
        /// Command sequence
        sequence: u64,
        /// The (possibly cached) outcome
        outcome: CommandOutcome,
    },
    /// Events were published for a session at this entry
    EventsPublished {
        /// Target session
        session_id: SessionId,
        /// The newly published events
        events: Vec<SessionEvent>,
    },
    /// A session lapsed (timeout or event overflow) and was closed
    SessionExpired {
        /// The session that went away
        session_id: SessionId,
    },
}

#[derive(Serialize, Deserialize)]
struct MachineSnapshot {
    service_type: Option<String>,
    service_state: Bytes,
    sessions: Vec<Session>,
    closed_sessions: Vec<SessionId>,
    last_applied: LogIndex,
    last_timestamp: i64,
}

/// Per-partition deterministic container for sessions plus the primitive
/// service.
pub struct StateMachine {
    partition: PartitionRef,
    registry: ServiceRegistry,
    service_type: Option<String>,
    service: Option<Box<dyn PrimitiveService>>,
    sessions: SessionManager,
    last_applied: LogIndex,
    last_timestamp: i64,
    role: RaftRole,
}

impl StateMachine {
    /// Create an empty state machine
    pub fn new(partition: PartitionRef, registry: ServiceRegistry, max_pending_events: usize) -> Self {
        Self {
            partition,
            registry,
            service_type: None,
            service: None,
            sessions: SessionManager::new(max_pending_events),
            last_applied: 0,
            last_timestamp: 0,
            role: RaftRole::Follower,
        }
    }

    /// Highest applied log index
    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Update the role exposed in service contexts
    pub fn set_role(&mut self, role: RaftRole) {
        self.role = role;
    }

    /// Whether a session is currently open
    pub fn session_exists(&self, id: SessionId) -> bool {
        self.sessions.get(id).is_some()
    }

    /// Whether a session once existed and has been closed or expired
    pub fn session_was_closed(&self, id: SessionId) -> bool {
        self.sessions.was_closed(id)
    }

    /// The error for an operation on a session that is not open:
    /// `ClosedSession` if it once existed, `UnknownSession` otherwise.
    pub fn missing_session_error(&self, id: SessionId) -> Error {
        if self.sessions.was_closed(id) {
            Error::closed_session(format!("session {id} has been closed"))
        } else {
            Error::unknown_session(format!("session {id} is not open"))
        }
    }

    /// Unacknowledged events for a session, oldest first (replayed to a
    /// reconnecting client)
    pub fn session_events(&self, id: SessionId) -> Vec<SessionEvent> {
        self.sessions
            .get(id)
            .map(|s| s.events.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Apply one committed entry, returning its effects in order.
    pub fn apply(&mut self, entry: &LogEntry) -> Vec<ApplyEffect> {
        self.last_applied = entry.index;
        self.last_timestamp = entry.timestamp;

        let mut effects = Vec::new();
        match &entry.payload {
            EntryPayload::Initialize | EntryPayload::Configuration(_) => {}
            EntryPayload::OpenSession(open) => {
                let result = self.open_session(entry, open);
                effects.push(ApplyEffect::SessionOpened {
                    index: entry.index,
                    result,
                });
            }
            EntryPayload::KeepAlive(keep_alive) => {
                let success = self.sessions.keep_alive(
                    keep_alive.session_id,
                    keep_alive.command_ack,
                    keep_alive.event_ack,
                    entry.timestamp,
                );
                effects.push(ApplyEffect::KeepAliveApplied {
                    index: entry.index,
                    session_id: keep_alive.session_id,
                    success,
                });
            }
            EntryPayload::CloseSession(close) => {
                let existed = self.close_session(close.session_id, CloseReason::Closed);
                effects.push(ApplyEffect::SessionClosed {
                    index: entry.index,
                    session_id: close.session_id,
                    existed,
                });
            }
            EntryPayload::Command(command) => {
                self.apply_command_entry(entry, command, &mut effects);
            }
        }

        // Expiration is judged against the replicated entry timestamp, so
        // every replica closes the same sessions at the same index.
        for session_id in self.sessions.expired(entry.timestamp) {
            debug!(partition = %self.partition, session = %session_id, "session expired");
            self.close_session(session_id, CloseReason::Expired);
            effects.push(ApplyEffect::SessionExpired { session_id });
        }

        effects
    }

    fn open_session(
        &mut self,
        entry: &LogEntry,
        open: &crate::raft::OpenSessionEntry,
    ) -> Result<(SessionId, u64), ErrorDetail> {
        if self.service.is_none() {
            match self.registry.create(&open.service_type) {
                Some(service) => {
                    self.service = Some(service);
                    self.service_type = Some(open.service_type.clone());
                }
                None => {
                    return Err(Error::illegal_state(format!(
                        "unknown service type: {}",
                        open.service_type
                    ))
                    .into());
                }
            }
        }
        if self.service_type.as_deref() != Some(open.service_type.as_str()) {
            return Err(Error::protocol_mismatch(format!(
                "partition {} hosts {}, not {}",
                self.partition,
                self.service_type.as_deref().unwrap_or("nothing"),
                open.service_type
            ))
            .into());
        }

        let session_id = SessionId::new(entry.index);
        self.sessions.open(
            session_id,
            open.member.clone(),
            open.primitive.clone(),
            open.service_type.clone(),
            open.timeout_ms,
            entry.timestamp,
        );
        if let Some(service) = self.service.as_mut() {
            service.session_opened(session_id);
        }
        Ok((session_id, open.timeout_ms))
    }

    fn close_session(&mut self, session_id: SessionId, reason: CloseReason) -> bool {
        match self.sessions.close(session_id) {
            Some(_) => {
                if let Some(service) = self.service.as_mut() {
                    service.session_closed(session_id, reason);
                }
                true
            }
            None => false,
        }
    }

    fn apply_command_entry(
        &mut self,
        entry: &LogEntry,
        command: &CommandEntry,
        effects: &mut Vec<ApplyEffect>,
    ) {
        self.sessions.touch(command.session_id, entry.timestamp);
        match self
            .sessions
            .command_disposition(command.session_id, command.sequence)
        {
            None => effects.push(ApplyEffect::CommandApplied {
                session_id: command.session_id,
                sequence: command.sequence,
                outcome: Err(self.missing_session_error(command.session_id).into()),
            }),
            Some(CommandDisposition::Duplicate(outcome)) => {
                effects.push(ApplyEffect::CommandApplied {
                    session_id: command.session_id,
                    sequence: command.sequence,
                    outcome,
                });
            }
            Some(CommandDisposition::Evicted) => effects.push(ApplyEffect::CommandApplied {
                session_id: command.session_id,
                sequence: command.sequence,
                outcome: Err(Error::illegal_state(format!(
                    "result for sequence {} is no longer retained",
                    command.sequence
                ))
                .into()),
            }),
            Some(CommandDisposition::Buffer) => {
                self.sessions.buffer_command(
                    command.session_id,
                    command.sequence,
                    command.operation.clone(),
                    command.args.clone(),
                );
            }
            Some(CommandDisposition::Apply) => {
                self.run_command(
                    entry,
                    command.session_id,
                    command.sequence,
                    &command.operation,
                    &command.args,
                    effects,
                );
                // Commands that arrived ahead of their turn apply as soon
                // as the gap fills, in sequence order.
                while let Some((sequence, operation, args)) =
                    self.sessions.take_ready_buffered(command.session_id)
                {
                    self.run_command(
                        entry,
                        command.session_id,
                        sequence,
                        &operation,
                        &args,
                        effects,
                    );
                }
            }
        }
    }

    fn run_command(
        &mut self,
        entry: &LogEntry,
        session_id: SessionId,
        sequence: u64,
        operation: &str,
        args: &[u8],
        effects: &mut Vec<ApplyEffect>,
    ) {
        let mut published: Vec<(EventTarget, Bytes)> = Vec::new();
        let outcome: CommandOutcome = match self.service.as_mut() {
            Some(service) => {
                let mut ctx = CommandContext::new(
                    entry.index,
                    entry.timestamp,
                    self.role,
                    session_id,
                    &mut published,
                );
                service
                    .apply_command(&mut ctx, operation, args)
                    .map_err(|e| Error::command_failed(e.to_string()).into())
            }
            None => Err(Error::illegal_state("no service bound to partition").into()),
        };
        self.sessions
            .record_result(session_id, sequence, outcome.clone());
        effects.push(ApplyEffect::CommandApplied {
            session_id,
            sequence,
            outcome,
        });

        let mut touched: Vec<SessionId> = Vec::new();
        let mut overflowed: Vec<SessionId> = Vec::new();
        for (target, payload) in published {
            let targets: Vec<SessionId> = match target {
                EventTarget::CurrentSession => vec![session_id],
                EventTarget::Session(id) => vec![id],
                EventTarget::AllSessions => self.sessions.ids(),
            };
            for target in targets {
                if self.sessions.get(target).is_none() {
                    continue;
                }
                let within_cap = self.sessions.publish_event(target, entry.index, payload.clone());
                if !touched.contains(&target) {
                    touched.push(target);
                }
                if !within_cap && !overflowed.contains(&target) {
                    overflowed.push(target);
                }
            }
        }
        for target in touched {
            if overflowed.contains(&target) {
                continue;
            }
            if let Some(session) = self.sessions.get(target) {
                let events: Vec<SessionEvent> = session
                    .events
                    .iter()
                    .filter(|e| e.event_index == entry.index)
                    .cloned()
                    .collect();
                if !events.is_empty() {
                    effects.push(ApplyEffect::EventsPublished {
                        session_id: target,
                        events,
                    });
                }
            }
        }
        for target in overflowed {
            warn!(
                partition = %self.partition,
                session = %target,
                "closing session: pending event cap exceeded"
            );
            self.close_session(target, CloseReason::Overflow);
            effects.push(ApplyEffect::SessionExpired {
                session_id: target,
            });
        }
    }

    /// Serve a read against applied state.
    pub fn query(
        &self,
        session_id: SessionId,
        operation: &str,
        args: &[u8],
    ) -> ConsensusResult<Bytes> {
        if self.sessions.get(session_id).is_none() {
            return Err(self.missing_session_error(session_id));
        }
        let Some(service) = self.service.as_ref() else {
            return Err(Error::illegal_state("no service bound to partition"));
        };
        let ctx = QueryContext {
            index: self.last_applied,
            timestamp: self.last_timestamp,
            role: self.role,
            session_id,
        };
        service
            .apply_query(&ctx, operation, args)
            .map_err(|e| Error::command_failed(e.to_string()))
    }

    /// Whether the log up to `index` may be compacted. The service is
    /// consulted before any snapshot is taken and may veto.
    pub fn can_compact(&self, index: LogIndex) -> bool {
        self.service
            .as_ref()
            .map(|s| s.can_delete(index))
            .unwrap_or(true)
    }

    /// Serialize the full machine state (service + sessions).
    pub fn backup(&self) -> ConsensusResult<Bytes> {
        let mut service_state = Vec::new();
        if let Some(service) = self.service.as_ref() {
            service
                .backup(&mut service_state)
                .map_err(|e| Error::storage(format!("service backup: {e}")))?;
        }
        let snapshot = MachineSnapshot {
            service_type: self.service_type.clone(),
            service_state: Bytes::from(service_state),
            sessions: self.sessions.backup(),
            closed_sessions: self.sessions.closed_ids(),
            last_applied: self.last_applied,
            last_timestamp: self.last_timestamp,
        };
        let mut buf = Vec::new();
        ciborium::ser::into_writer(&snapshot, &mut buf)
            .map_err(|e| Error::storage(format!("snapshot encode: {e}")))?;
        Ok(Bytes::from(buf))
    }

    /// Replace the full machine state from a snapshot.
    pub fn restore(&mut self, data: &[u8]) -> ConsensusResult<()> {
        let snapshot: MachineSnapshot = ciborium::de::from_reader(data)
            .map_err(|e| Error::storage(format!("snapshot decode: {e}")))?;

        self.service = None;
        self.service_type = None;
        if let Some(service_type) = snapshot.service_type {
            let mut service = self.registry.create(&service_type).ok_or_else(|| {
                Error::illegal_state(format!(
                    "snapshot requires unregistered service type: {service_type}"
                ))
            })?;
            service
                .restore(&snapshot.service_state)
                .map_err(|e| Error::storage(format!("service restore: {e}")))?;
            self.service = Some(service);
            self.service_type = Some(service_type);
        }
        self.sessions.restore(snapshot.sessions);
        self.sessions.restore_closed(snapshot.closed_sessions);
        self.last_applied = snapshot.last_applied;
        self.last_timestamp = snapshot.last_timestamp;
        Ok(())
    }
}
