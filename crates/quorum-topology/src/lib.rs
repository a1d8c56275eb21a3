//! Cluster membership view and discovery glue.
//!
//! Discovery providers hand the core an advisory stream of join/leave
//! events plus a point-in-time node snapshot. The consensus layer treats
//! this as input only: partition voter sets are governed by committed
//! configuration entries, never directly by discovery.

mod discovery;
mod manager;
mod node;

pub use discovery::{DiscoveryProvider, PeerEvent, StaticDiscovery};
pub use manager::{TopologyManager, TopologyManagerConfig};
pub use node::{Node, NodeId};

use thiserror::Error;

/// Errors from topology operations
#[derive(Debug, Error)]
pub enum TopologyError {
    /// The discovery provider failed
    #[error("discovery provider error: {0}")]
    Provider(String),

    /// The manager is not running
    #[error("topology manager not started")]
    NotStarted,
}
