//! Lamport Mesh Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" seam that lets a peer engine run in
//! both **Production** (tokio + TCP) and **Simulation** (virtual clock +
//! in-memory router) environments.
//!
//! # Core Concept
//!
//! Everything a peer engine needs from the outside world goes through two traits:
//! - Time and randomness (`now()`, `system_time()`, `sleep()`, `rng()`)
//! - Outbound frames (`send()`, `broadcast()`, `shutdown()`)
//!
//! By deriving all entropy from a single 64-bit seed, any simulated run
//! becomes reproducible via its seed number.
//!
//! # Example
//!
//! ```ignore
//! use lamport_env::{PeerContext, NetworkTransport};
//!
//! async fn tick_loop<Ctx: PeerContext, Net: NetworkTransport>(
//!     ctx: &Ctx,
//!     net: &Net,
//! ) {
//!     loop {
//!         act(net).await;
//!         ctx.sleep(Duration::from_millis(250)).await;
//!     }
//! }
//! ```

mod context;
mod network;
mod types;
mod error;
mod tokio_impl;

pub use context::PeerContext;
pub use network::NetworkTransport;
pub use types::PeerId;
pub use error::EnvError;
pub use tokio_impl::TokioContext;
