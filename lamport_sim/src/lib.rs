//! Lamport Deterministic Simulation Harness
//!
//! Runs the real [`lamport_core::PeerEngine`] against an in-memory network
//! and a virtual clock, so multi-peer behavior can be replayed exactly
//! from a seed.
//!
//! # Core Principle
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: one virtual clock, advanced tick by tick by the scheduler
//! - **Network**: an in-memory router with partitions and deaf links
//! - **Randomness**: every RNG stream derived from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SimWorld                            │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ SimContext (virtual clock, seeded RNG streams)       │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │       │                        │                            │
//! │  ┌────▼────┐              ┌────▼────┐                       │
//! │  │  Peer   │              │  Peer   │     ...               │
//! │  │   #0    │              │   #1    │                       │
//! │  └────┬────┘              └────┬────┘                       │
//! │       │        SimNetwork      │                            │
//! │  ┌────▼────────────────────────▼────┐                       │
//! │  │  SimRouter + SimNetworkController │                      │
//! │  │  (decode, deliver, inject faults) │                      │
//! │  └───────────────────────────────────┘                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use lamport_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42)
//!     .with_duration(30.0)
//!     .run(ScenarioId::Simplex)
//!     .await;
//! assert!(result.passed);
//! ```

mod context;
mod exporter;
mod network;
mod runner;
pub mod scenarios;
mod world;

pub use context::SimContext;
pub use exporter::{LinkExport, PeerExport, SimExport};
pub use network::{LinkStats, SimNetwork, SimNetworkController, SimRouter};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use world::{SimConfig, SimPeer, SimWorld};
