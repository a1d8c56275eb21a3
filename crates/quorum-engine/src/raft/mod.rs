//! Per-partition Raft consensus.
//!
//! Each partition is replicated by a set of [`replica::ReplicaActor`]s,
//! one per hosting node. The actor is the partition's single writer: every
//! public entry point enqueues a typed message on its mailbox and all
//! state mutation happens on the actor task.

mod log;
pub mod messages;
mod replica;
mod types;

pub use log::RaftLog;
pub use replica::{
    spawn_replica, QueryReply, ReplicaHandle, ReplicaOptions, ReplicaStatus, SubmitReply,
};
pub use types::{
    CloseSessionEntry, CommandEntry, Configuration, ConfigurationChange, EntryPayload,
    KeepAliveEntry, LogEntry, OpenSessionEntry, RaftMember,
};
