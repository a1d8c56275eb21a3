//! Core types shared across the engine.

mod events;
mod types;

pub use events::EventBus;
pub use types::{
    ConsistencyLevel, LogIndex, MemberRole, PartitionId, PartitionRef, RaftRole, SessionId, Term,
};
