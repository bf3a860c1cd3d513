//! Cairn Mesh - peer session, gossip and link quality state machines
//!
//! Everything here is pure bookkeeping driven by the node's event loop:
//! no sockets and no tasks. Time comes in as arguments or through the
//! [`retry::Clock`] trait so the machines can be tested without waiting.

pub mod gossip;
pub mod quality;
pub mod retry;
pub mod session;

use cairn_core::PeerId;
use session::ConnectionState;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MeshError {
    #[error("Invalid session transition for {peer}: {from} -> {to}")]
    InvalidTransition {
        peer: PeerId,
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("Refusing to connect to own identifier")]
    SelfConnection,

    #[error("No session for {0}")]
    UnknownSession(PeerId),
}

pub type Result<T> = std::result::Result<T, MeshError>;

impl From<MeshError> for cairn_core::Error {
    fn from(err: MeshError) -> Self {
        match err {
            MeshError::SelfConnection => cairn_core::Error::SelfConnection,
            other => cairn_core::Error::Protocol(other.to_string()),
        }
    }
}

/// Mesh timing configuration
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Bound on a single connection attempt
    pub connect_timeout: Duration,
    /// Backoff between failed attempts
    pub retry: retry::RetryPolicy,
    /// Upper bound of the random delay before a gossip-driven connect
    pub gossip_jitter: Duration,
    /// Bounded wait for a block request
    pub request_timeout: Duration,
    /// Interval between quality samples
    pub quality_interval: Duration,
    /// A ping unanswered for this long counts as lost
    pub ping_timeout: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            retry: retry::RetryPolicy::default(),
            gossip_jitter: Duration::from_millis(2000),
            request_timeout: Duration::from_secs(5),
            quality_interval: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(3),
        }
    }
}
