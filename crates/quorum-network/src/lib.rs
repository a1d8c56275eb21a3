//! Messaging plane for node-to-node communication.
//!
//! Provides typed request/response RPC and server-push streaming over a
//! pluggable [`quorum_transport::Transport`]. Delivery is at-most-once per
//! attempt and this layer performs no deduplication; exactly-once effects
//! are the session layer's job. Cancelling an in-flight request sends a
//! best-effort cancel frame to the peer, which may still complete the work
//! (cancellation is a hint).

mod codec;
mod error;
mod manager;
mod message;
mod service;
mod stream;

pub use codec::{decode, encode};
pub use error::{NetworkError, NetworkResult};
pub use manager::NetworkManager;
pub use message::ServiceMessage;
pub use service::{Service, ServiceContext, StreamingService};
pub use stream::{StreamReceiver, StreamSender};
