//! Error types for the consensus core.

use std::fmt;

use quorum_topology::NodeId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for consensus operations
pub type ConsensusResult<T> = Result<T, Error>;

/// Main error type for the consensus core
#[derive(Debug, Error)]
pub struct Error {
    /// Error kind
    kind: ErrorKind,
    /// Error context
    context: ErrorContext,
}

impl Error {
    /// Create a new error
    pub fn new(kind: ErrorKind, context: ErrorContext) -> Self {
        Self { kind, context }
    }

    /// Create error with string context
    pub fn with_context(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            context: ErrorContext::Message(context.into()),
        }
    }

    /// Get error kind
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// No leader is currently known for the partition
    pub fn no_leader(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::NoLeader, msg)
    }

    /// This replica is not the leader; carries the current leader estimate
    pub fn not_leader(msg: impl Into<String>, hint: Option<NodeId>) -> Self {
        Self {
            kind: ErrorKind::NotLeader,
            context: ErrorContext::Leadership {
                message: msg.into(),
                leader_hint: hint,
            },
        }
    }

    /// The operation deadline elapsed
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Timeout, msg)
    }

    /// The partition is temporarily unreachable
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Unavailable, msg)
    }

    /// The session has been closed or expired
    pub fn closed_session(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::ClosedSession, msg)
    }

    /// The session is not known to the partition
    pub fn unknown_session(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::UnknownSession, msg)
    }

    /// The operation is invalid in the current state; not retried
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::IllegalState, msg)
    }

    /// The two ends disagree on the protocol; not retried
    pub fn protocol_mismatch(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::ProtocolMismatch, msg)
    }

    /// The primitive service rejected the command
    pub fn command_failed(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::CommandFailed, msg)
    }

    /// The replica has not caught up to the session's observed commit index
    pub fn read_stale(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::ReadStale, msg)
    }

    /// Configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Configuration, msg)
    }

    /// Storage failure; the owning replica goes inactive
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Storage, msg)
    }

    /// Internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Internal, msg)
    }

    /// Check if this is a not-leader error
    pub fn is_not_leader(&self) -> bool {
        matches!(self.kind, ErrorKind::NotLeader)
    }

    /// Whether a retry with the same sequence number is safe and useful
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::NoLeader
                | ErrorKind::NotLeader
                | ErrorKind::Timeout
                | ErrorKind::Unavailable
                | ErrorKind::ReadStale
        )
    }

    /// Get the leader hint from a not-leader error
    pub fn leader_hint(&self) -> Option<&NodeId> {
        match &self.context {
            ErrorContext::Leadership { leader_hint, .. } => leader_hint.as_ref(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            ErrorContext::Message(msg) => write!(f, "{}: {}", self.kind, msg),
            ErrorContext::Chain { message, source } => {
                write!(f, "{}: {} (caused by: {})", self.kind, message, source)
            }
            ErrorContext::Leadership {
                message,
                leader_hint,
            } => {
                if let Some(leader) = leader_hint {
                    write!(f, "{}: {} (current leader: {})", self.kind, message, leader)
                } else {
                    write!(f, "{}: {} (no known leader)", self.kind, message)
                }
            }
        }
    }
}

/// Error kinds visible to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// No leader is known for the partition
    NoLeader,
    /// This replica is not the leader
    NotLeader,
    /// Operation timed out
    Timeout,
    /// Partition temporarily unreachable
    Unavailable,
    /// Session closed or expired
    ClosedSession,
    /// Session unknown to the partition
    UnknownSession,
    /// Invalid state for the operation
    IllegalState,
    /// Protocol disagreement between peers
    ProtocolMismatch,
    /// Primitive service error
    CommandFailed,
    /// Replica behind the session's observed commit index
    ReadStale,
    /// Configuration error
    Configuration,
    /// Storage error
    Storage,
    /// Internal error
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::NoLeader => write!(f, "No leader"),
            ErrorKind::NotLeader => write!(f, "Not the leader"),
            ErrorKind::Timeout => write!(f, "Timeout"),
            ErrorKind::Unavailable => write!(f, "Unavailable"),
            ErrorKind::ClosedSession => write!(f, "Session closed"),
            ErrorKind::UnknownSession => write!(f, "Unknown session"),
            ErrorKind::IllegalState => write!(f, "Illegal state"),
            ErrorKind::ProtocolMismatch => write!(f, "Protocol mismatch"),
            ErrorKind::CommandFailed => write!(f, "Command failed"),
            ErrorKind::ReadStale => write!(f, "Stale read"),
            ErrorKind::Configuration => write!(f, "Configuration error"),
            ErrorKind::Storage => write!(f, "Storage error"),
            ErrorKind::Internal => write!(f, "Internal error"),
        }
    }
}

/// Error context
#[derive(Debug)]
pub enum ErrorContext {
    /// Simple message
    Message(String),
    /// Error chain with source
    Chain {
        /// Error message
        message: String,
        /// Source error
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// Leadership error with the current leader estimate
    Leadership {
        /// Error message
        message: String,
        /// Current leader if known
        leader_hint: Option<NodeId>,
    },
}

/// Wire representation of an error, carried inside response payloads so
/// the caller can apply the right recovery policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Error kind
    pub kind: ErrorKind,
    /// Human-readable message
    pub message: String,
    /// Leader estimate for `NotLeader`
    pub leader_hint: Option<NodeId>,
}

impl From<&Error> for ErrorDetail {
    fn from(error: &Error) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            leader_hint: error.leader_hint().cloned(),
        }
    }
}

impl From<Error> for ErrorDetail {
    fn from(error: Error) -> Self {
        Self::from(&error)
    }
}

impl From<ErrorDetail> for Error {
    fn from(detail: ErrorDetail) -> Self {
        match detail.kind {
            ErrorKind::NotLeader => Error::not_leader(detail.message, detail.leader_hint),
            kind => Error::with_context(kind, detail.message),
        }
    }
}

impl From<quorum_storage::StorageError> for Error {
    fn from(err: quorum_storage::StorageError) -> Self {
        Self {
            kind: ErrorKind::Storage,
            context: ErrorContext::Chain {
                message: "storage operation failed".to_string(),
                source: Box::new(err),
            },
        }
    }
}

impl From<quorum_network::NetworkError> for Error {
    fn from(err: quorum_network::NetworkError) -> Self {
        use quorum_network::NetworkError;
        match err {
            NetworkError::Timeout => Error::timeout("request timed out"),
            NetworkError::Unreachable(node) => {
                Error::unavailable(format!("peer {node} unreachable"))
            }
            NetworkError::Shutdown => Error::unavailable("network manager shut down"),
            other => Self {
                kind: ErrorKind::Internal,
                context: ErrorContext::Chain {
                    message: "network error".to_string(),
                    source: Box::new(other),
                },
            },
        }
    }
}

impl From<quorum_topology::TopologyError> for Error {
    fn from(err: quorum_topology::TopologyError) -> Self {
        Self {
            kind: ErrorKind::Configuration,
            context: ErrorContext::Chain {
                message: "topology error".to_string(),
                source: Box::new(err),
            },
        }
    }
}
