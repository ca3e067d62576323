//! Lamport Core - logical clocks over a peer-to-peer mesh
//!
//! Each peer ticks at its own rate. On every tick it either drains one
//! message from its inbound queue or performs a weighted-random local
//! action, and its Lamport clock advances accordingly:
//! 1. **Local event or send**: `clock + 1`
//! 2. **Receive**: `max(clock, received) + 1`
//!
//! Peers exchange newline-delimited JSON over TCP. Every action and every
//! contained error lands in an append-only event log for later analysis of
//! drift and backlog.

pub mod actions;
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod link;
pub mod log;
pub mod metrics;
pub mod node;
pub mod peer;
pub mod queue;

// Re-export key types for convenience
pub use actions::{Action, ActionTable, ActionWeights};
pub use clock::LamportClock;
pub use codec::{decode, encode, Message, DELIMITER};
pub use config::{
    tick_period, LinkConfig, PeerConfig, PeerEntry, Speed, Topology, MAX_RUN_DURATION_SECS,
};
pub use error::{CodecError, ConfigError, ErrorKind, LinkError, PeerError};
pub use link::{read_frames, ReadSummary, TcpLink};
pub use log::{Diagnostic, EventKind, EventLog, EventRecord, EventSink, JsonLinesSink, LogEntry, MemorySink};
pub use metrics::PeerSummary;
pub use node::{PeerHandle, PeerNode};
pub use peer::{EventCounts, PeerEngine, PeerReport, PeerState, TickOutcome};
pub use queue::InboundQueue;
