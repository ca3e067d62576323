//! Error taxonomy for the peer engine and its link layer.
//!
//! Codec and link errors are recoverable: they are contained where they
//! occur and surface as [`Diagnostic`](crate::log::Diagnostic) records.
//! Configuration errors are fatal and stop a peer before it starts.

use lamport_env::{EnvError, PeerId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use thiserror::Error;

/// Malformed inbound frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Bytes are not a single well-formed UTF-8 JSON record
    #[error("Framing error: {0}")]
    Framing(String),

    /// Record is well-formed but fields are missing or mistyped
    #[error("Schema error: {0}")]
    Schema(String),
}

impl CodecError {
    /// Returns the diagnostic kind for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CodecError::Framing(_) => ErrorKind::Framing,
            CodecError::Schema(_) => ErrorKind::Schema,
        }
    }
}

/// Invalid startup configuration. The peer refuses to start.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Topology has no peers")]
    EmptyTopology,

    #[error("Duplicate peer id in topology: {0}")]
    DuplicatePeer(PeerId),

    #[error("Address {addr} is assigned to both {first} and {second}")]
    DuplicateAddress {
        addr: SocketAddr,
        first: PeerId,
        second: PeerId,
    },

    #[error("Peer {0} is not part of the topology")]
    UnknownPeer(PeerId),

    #[error("Invalid tick speed: {0}")]
    InvalidSpeed(String),

    #[error("Invalid action weights: {0}")]
    InvalidWeights(String),

    #[error("Invalid run duration: {0}")]
    InvalidRunDuration(String),

    #[error("Invalid link settings: {0}")]
    InvalidLink(String),

    #[error("Failed to read config {path}: {reason}")]
    Unreadable { path: String, reason: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),
}

/// Link layer failures.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Gave up connecting to {peer} after {attempts} attempts")]
    RetriesExhausted { peer: PeerId, attempts: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out after {0}ms")]
    Timeout(u64),

    #[error("Link shut down")]
    Cancelled,
}

impl From<LinkError> for EnvError {
    fn from(error: LinkError) -> Self {
        match error {
            LinkError::Timeout(ms) => EnvError::Timeout(ms),
            LinkError::Cancelled => EnvError::Closed,
            LinkError::RetriesExhausted { peer, .. } => EnvError::unreachable(peer),
            other => EnvError::network(other.to_string()),
        }
    }
}

/// Errors from starting a peer.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("Peer task failed: {0}")]
    Task(String),
}

/// Category of a contained error, as recorded in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Framing,
    Schema,
    Connection,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Framing => "framing",
            ErrorKind::Schema => "schema",
            ErrorKind::Connection => "connection",
        };
        f.write_str(name)
    }
}
