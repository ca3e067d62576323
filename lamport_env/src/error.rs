//! Error types for the environment abstraction.

use thiserror::Error;

/// Errors that can occur at the transport seam.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Write failed (connection closed, reset, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Target peer has no live connection
    #[error("Peer unreachable: {0}")]
    NodeUnreachable(String),

    /// Target peer is not part of the topology
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),

    /// Transport has been shut down
    #[error("Transport closed")]
    Closed,
}

impl EnvError {
    /// Creates a network error.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkError(msg.into())
    }

    /// Creates an unreachable error.
    pub fn unreachable(peer: impl std::fmt::Display) -> Self {
        Self::NodeUnreachable(peer.to_string())
    }
}
