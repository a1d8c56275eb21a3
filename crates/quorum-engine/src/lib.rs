//! Replicated state-machine core.
//!
//! Quorum hosts named primitives (counters, maps, the management
//! directory) on partitioned, Raft-replicated state machines. Clients
//! obtain session handles to primitives; commands are linearized through
//! the partition's leader and applied exactly once per session sequence,
//! surviving retries, leader failover and reordering. Reads run under a
//! chosen consistency level, from fully linearizable to eventual.
//!
//! The crate is organized the way the data flows:
//!
//! - [`raft`] — per-partition consensus replicas (election, replication,
//!   snapshot install, membership changes) behind a single-writer actor
//! - [`session`] — the server-side session table giving exactly-once
//!   command semantics and ordered event delivery
//! - [`service`] — the deterministic primitive-service host and registry
//! - [`partition`] — partition groups, routing and the RPC façades
//! - [`client`] — the partition router / session client
//! - [`node`] — composition of topology, messaging, partitions and client

pub mod client;
pub mod config;
pub mod error;
pub mod foundation;
pub mod partition;
pub mod raft;
pub mod service;
pub mod session;

mod node;

pub use client::{QuorumClient, SessionHandle, SessionState};
pub use config::{EngineConfig, NodeConfig, PartitionGroupConfig, PartitionGroupKind, RaftConfig};
pub use error::{ConsensusResult, Error, ErrorKind};
pub use foundation::{ConsistencyLevel, PartitionId, PartitionRef, RaftRole, SessionId, Term};
pub use node::QuorumNode;
pub use service::{PrimitiveService, ServiceRegistry};
