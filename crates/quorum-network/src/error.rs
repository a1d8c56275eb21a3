//! Network layer errors.

use quorum_topology::NodeId;
use thiserror::Error;

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;

/// Errors from the messaging plane
#[derive(Debug, Error)]
pub enum NetworkError {
    /// The request deadline elapsed before a response arrived
    #[error("request timed out")]
    Timeout,

    /// The peer is not reachable
    #[error("peer {0} unreachable")]
    Unreachable(NodeId),

    /// The remote handler failed
    #[error("remote error: {0}")]
    Remote(String),

    /// No handler is registered for the requested service
    #[error("no handler for service {0}")]
    NoHandler(String),

    /// Payload could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The manager has been shut down
    #[error("network manager shut down")]
    Shutdown,

    /// Underlying transport failure
    #[error("transport error: {0}")]
    Transport(#[from] quorum_transport::TransportError),
}
