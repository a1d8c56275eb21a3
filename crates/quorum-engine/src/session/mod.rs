//! Server-side session state.
//!
//! The session is the unit of linearizability: commands carry a dense
//! per-session sequence, results are cached for dedup until the client
//! acknowledges them, and events are queued until acknowledged. The table
//! is driven exclusively from applied log entries, so every replica
//! reconstructs identical session state, including expirations (which are
//! judged against replicated entry timestamps, never the local clock).

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use bytes::Bytes;
use quorum_topology::NodeId;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ErrorDetail;
use crate::foundation::{LogIndex, SessionId};

/// Why a session went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client closed it
    Closed,
    /// It expired without keep-alives
    Expired,
    /// It exceeded its pending-event cap
    Overflow,
}

/// An event queued for delivery to a session's client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    /// Log index at which the event was published
    pub event_index: LogIndex,
    /// Event index of the previous event for this session (chain order)
    pub previous_index: LogIndex,
    /// Service-defined payload
    pub payload: Bytes,
}

/// Cached outcome of an applied command
pub type CommandOutcome = Result<Bytes, ErrorDetail>;

/// One client session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Session ID (log index of its open entry)
    pub id: SessionId,
    /// Node the client connected through
    pub member: NodeId,
    /// Primitive name
    pub primitive: String,
    /// Service type hosting the primitive
    pub service_type: String,
    /// Session timeout in milliseconds
    pub timeout_ms: u64,
    /// Timestamp of the last entry that refreshed this session
    pub last_updated: i64,
    /// Highest command sequence applied
    pub last_applied_seq: u64,
    /// Sequences at or below this are acknowledged; their results are evicted
    pub complete_seq: u64,
    /// Cached results for sequences in `(complete_seq, last_applied_seq]`
    pub response_cache: BTreeMap<u64, CommandOutcome>,
    /// Commands that arrived ahead of their turn, keyed by sequence
    #[serde(skip)]
    pub buffered: BTreeMap<u64, (String, Bytes)>,
    /// Index of the most recently published event
    pub event_index: LogIndex,
    /// Highest event index the client has acknowledged
    pub complete_index: LogIndex,
    /// Unacknowledged events, oldest first
    pub events: VecDeque<SessionEvent>,
}

impl Session {
    fn new(
        id: SessionId,
        member: NodeId,
        primitive: String,
        service_type: String,
        timeout_ms: u64,
        now: i64,
    ) -> Self {
        Self {
            id,
            member,
            primitive,
            service_type,
            timeout_ms,
            last_updated: now,
            last_applied_seq: 0,
            complete_seq: 0,
            response_cache: BTreeMap::new(),
            buffered: BTreeMap::new(),
            event_index: 0,
            complete_index: 0,
            events: VecDeque::new(),
        }
    }

    /// Whether this session has lapsed at the given replicated timestamp
    pub fn is_expired(&self, now: i64) -> bool {
        now - self.last_updated > self.timeout_ms as i64
    }
}

/// How an incoming command sequence relates to the session's progress
#[derive(Debug)]
pub enum CommandDisposition {
    /// Already applied; return the cached result
    Duplicate(CommandOutcome),
    /// Already applied and acknowledged; the result is gone
    Evicted,
    /// Next in sequence; apply now
    Apply,
    /// Ahead of its turn; hold until the gap fills
    Buffer,
}

/// Bound on closed-session tombstones; evicted smallest-id-first so every
/// replica evicts identically.
const MAX_CLOSED_TOMBSTONES: usize = 4096;

/// Deterministic per-partition session table.
#[derive(Debug)]
pub struct SessionManager {
    sessions: BTreeMap<SessionId, Session>,
    closed: BTreeSet<SessionId>,
    max_pending_events: usize,
}

impl SessionManager {
    /// Create an empty table
    pub fn new(max_pending_events: usize) -> Self {
        Self {
            sessions: BTreeMap::new(),
            closed: BTreeSet::new(),
            max_pending_events,
        }
    }

    /// Number of open sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Look up a session
    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    /// Look up a session mutably
    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    /// Open session IDs in ascending order
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    /// Create a session. The ID is the log index of the open entry, which
    /// makes it identical on every replica.
    pub fn open(
        &mut self,
        id: SessionId,
        member: NodeId,
        primitive: String,
        service_type: String,
        timeout_ms: u64,
        now: i64,
    ) -> &Session {
        debug!(session = %id, %member, primitive, "session opened");
        self.sessions.entry(id).or_insert_with(|| {
            Session::new(id, member, primitive, service_type, timeout_ms, now)
        })
    }

    /// Refresh a session's liveness without acknowledging anything.
    /// Command traffic proves the client is alive just as well as a
    /// keep-alive does.
    pub fn touch(&mut self, id: SessionId, now: i64) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.last_updated = now;
        }
    }

    /// Refresh a session and trim acknowledged results and events.
    pub fn keep_alive(
        &mut self,
        id: SessionId,
        command_ack: u64,
        event_ack: LogIndex,
        now: i64,
    ) -> bool {
        let Some(session) = self.sessions.get_mut(&id) else {
            return false;
        };
        session.last_updated = now;
        if command_ack > session.complete_seq {
            session.complete_seq = command_ack;
            session.response_cache.retain(|&seq, _| seq > command_ack);
        }
        if event_ack > session.complete_index {
            session.complete_index = event_ack;
            session.events.retain(|e| e.event_index > event_ack);
        }
        true
    }

    /// Remove a session, leaving a tombstone so later operations on it can
    /// be told apart from operations on sessions that never existed.
    pub fn close(&mut self, id: SessionId) -> Option<Session> {
        let session = self.sessions.remove(&id);
        if session.is_some() {
            self.closed.insert(id);
            while self.closed.len() > MAX_CLOSED_TOMBSTONES {
                self.closed.pop_first();
            }
        }
        session
    }

    /// Whether a session existed and has since been closed or expired
    pub fn was_closed(&self, id: SessionId) -> bool {
        self.closed.contains(&id)
    }

    /// Closed-session tombstones, for snapshots
    pub fn closed_ids(&self) -> Vec<SessionId> {
        self.closed.iter().copied().collect()
    }

    /// Restore closed-session tombstones from a snapshot
    pub fn restore_closed(&mut self, ids: Vec<SessionId>) {
        self.closed = ids.into_iter().collect();
    }

    /// Sessions that have lapsed at the given replicated timestamp, in
    /// ascending ID order so every replica expires them identically.
    pub fn expired(&self, now: i64) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|s| s.is_expired(now))
            .map(|s| s.id)
            .collect()
    }

    /// Classify a command sequence against the session's progress
    pub fn command_disposition(&self, id: SessionId, sequence: u64) -> Option<CommandDisposition> {
        let session = self.sessions.get(&id)?;
        Some(if sequence <= session.last_applied_seq {
            match session.response_cache.get(&sequence) {
                Some(outcome) => CommandDisposition::Duplicate(outcome.clone()),
                None => CommandDisposition::Evicted,
            }
        } else if sequence == session.last_applied_seq + 1 {
            CommandDisposition::Apply
        } else {
            CommandDisposition::Buffer
        })
    }

    /// Record an applied command's result and advance the session
    pub fn record_result(&mut self, id: SessionId, sequence: u64, outcome: CommandOutcome) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.last_applied_seq = sequence;
            session.response_cache.insert(sequence, outcome);
        }
    }

    /// Hold a command that arrived ahead of its turn
    pub fn buffer_command(&mut self, id: SessionId, sequence: u64, operation: String, args: Bytes) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.buffered.insert(sequence, (operation, args));
        }
    }

    /// Take the buffered command that is now next in sequence, if any
    pub fn take_ready_buffered(&mut self, id: SessionId) -> Option<(u64, String, Bytes)> {
        let session = self.sessions.get_mut(&id)?;
        let next = session.last_applied_seq + 1;
        session
            .buffered
            .remove(&next)
            .map(|(operation, args)| (next, operation, args))
    }

    /// Queue an event for a session. Returns `false` if the session has
    /// exceeded its pending-event cap and must be closed.
    pub fn publish_event(&mut self, id: SessionId, index: LogIndex, payload: Bytes) -> bool {
        let Some(session) = self.sessions.get_mut(&id) else {
            return true;
        };
        let event = SessionEvent {
            event_index: index,
            previous_index: session.event_index,
            payload,
        };
        session.event_index = index;
        session.events.push_back(event);
        session.events.len() <= self.max_pending_events
    }

    /// Serialize the table for a snapshot
    pub fn backup(&self) -> Vec<Session> {
        self.sessions.values().cloned().collect()
    }

    /// Replace the table from a snapshot
    pub fn restore(&mut self, sessions: Vec<Session>) {
        self.sessions = sessions.into_iter().map(|s| (s.id, s)).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SessionManager {
        SessionManager::new(16)
    }

    fn open(m: &mut SessionManager, id: u64, timeout_ms: u64, now: i64) -> SessionId {
        let sid = SessionId::new(id);
        m.open(
            sid,
            NodeId::new("client-node"),
            "my-counter".to_string(),
            "counter".to_string(),
            timeout_ms,
            now,
        );
        sid
    }

    #[test]
    fn duplicate_sequences_return_cached_results() {
        let mut m = manager();
        let sid = open(&mut m, 1, 1000, 0);

        assert!(matches!(
            m.command_disposition(sid, 1),
            Some(CommandDisposition::Apply)
        ));
        m.record_result(sid, 1, Ok(Bytes::from("one")));

        match m.command_disposition(sid, 1) {
            Some(CommandDisposition::Duplicate(Ok(bytes))) => {
                assert_eq!(bytes, Bytes::from("one"))
            }
            other => panic!("expected cached duplicate, got {other:?}"),
        }
        assert!(matches!(
            m.command_disposition(sid, 2),
            Some(CommandDisposition::Apply)
        ));
        assert!(matches!(
            m.command_disposition(sid, 5),
            Some(CommandDisposition::Buffer)
        ));
    }

    #[test]
    fn keep_alive_trims_acknowledged_results() {
        let mut m = manager();
        let sid = open(&mut m, 1, 1000, 0);
        for seq in 1..=4 {
            m.record_result(sid, seq, Ok(Bytes::from(format!("r{seq}"))));
        }

        assert!(m.keep_alive(sid, 3, 0, 50));
        let session = m.get(sid).unwrap();
        assert_eq!(session.complete_seq, 3);
        assert_eq!(session.response_cache.len(), 1);
        assert_eq!(session.last_updated, 50);

        // An acknowledged sequence retried later has lost its result.
        assert!(matches!(
            m.command_disposition(sid, 2),
            Some(CommandDisposition::Evicted)
        ));
    }

    #[test]
    fn buffered_commands_drain_in_sequence_order() {
        let mut m = manager();
        let sid = open(&mut m, 1, 1000, 0);

        m.buffer_command(sid, 3, "op3".to_string(), Bytes::new());
        m.buffer_command(sid, 2, "op2".to_string(), Bytes::new());
        assert!(m.take_ready_buffered(sid).is_none());

        m.record_result(sid, 1, Ok(Bytes::new()));
        let (seq, op, _) = m.take_ready_buffered(sid).unwrap();
        assert_eq!((seq, op.as_str()), (2, "op2"));

        m.record_result(sid, 2, Ok(Bytes::new()));
        let (seq, op, _) = m.take_ready_buffered(sid).unwrap();
        assert_eq!((seq, op.as_str()), (3, "op3"));
    }

    #[test]
    fn expiry_uses_replicated_time_strictly() {
        let mut m = manager();
        let a = open(&mut m, 1, 1000, 0);
        let b = open(&mut m, 2, 5000, 0);

        assert!(m.expired(1000).is_empty(), "exactly at timeout is alive");
        assert_eq!(m.expired(1001), vec![a]);

        m.keep_alive(a, 0, 0, 900);
        assert!(m.expired(1001).is_empty());
        assert_eq!(m.expired(6000), vec![a, b]);
    }

    #[test]
    fn events_chain_and_trim_on_ack() {
        let mut m = manager();
        let sid = open(&mut m, 1, 1000, 0);

        assert!(m.publish_event(sid, 10, Bytes::from("e1")));
        assert!(m.publish_event(sid, 12, Bytes::from("e2")));

        let session = m.get(sid).unwrap();
        assert_eq!(session.events[0].previous_index, 0);
        assert_eq!(session.events[1].previous_index, 10);
        assert_eq!(session.event_index, 12);

        m.keep_alive(sid, 0, 10, 20);
        let session = m.get(sid).unwrap();
        assert_eq!(session.events.len(), 1);
        assert_eq!(session.events[0].event_index, 12);
        assert_eq!(session.complete_index, 10);
    }

    #[test]
    fn event_overflow_is_reported() {
        let mut m = SessionManager::new(2);
        let sid = open(&mut m, 1, 1000, 0);
        assert!(m.publish_event(sid, 1, Bytes::new()));
        assert!(m.publish_event(sid, 2, Bytes::new()));
        assert!(!m.publish_event(sid, 3, Bytes::new()));
    }

    #[test]
    fn backup_restore_round_trip() {
        let mut m = manager();
        let sid = open(&mut m, 7, 1000, 0);
        m.record_result(sid, 1, Ok(Bytes::from("r1")));
        m.publish_event(sid, 9, Bytes::from("e"));

        let mut restored = manager();
        restored.restore(m.backup());
        let session = restored.get(sid).unwrap();
        assert_eq!(session.last_applied_seq, 1);
        assert_eq!(session.events.len(), 1);
        assert_eq!(session.primitive, "my-counter");
    }
}
