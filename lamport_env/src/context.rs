//! Core environment context trait for Lamport mesh peers.

use async_trait::async_trait;
use rand_chacha::ChaCha8Rng;
use std::future::Future;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;

/// The central interface for Environment Interaction.
///
/// This trait abstracts the "real world" so that a peer engine can run
/// against wall-clock time (tokio) or against a virtual clock driven by
/// the simulation harness.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`, OS entropy
/// - **Simulation**: `SimContext` - virtual clock, `ChaCha8Rng(seed)`
///
/// # Determinism
///
/// For simulation, all methods that would normally introduce non-determinism
/// (time, randomness) are controlled by the implementation.
#[async_trait]
pub trait PeerContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Drives tick scheduling and the elapsed-seconds side of drift.
    /// In simulation, this is the virtual clock time.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time stamped on messages and log records.
    ///
    /// In simulation, this is derived from virtual clock + epoch offset.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances virtual clock
    async fn sleep(&self, duration: Duration);

    /// Spawns a named background task (link dialing, the tick loop).
    fn spawn<F>(&self, name: &str, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static;

    /// Derives an RNG stream for one consumer (e.g. one peer's action draws).
    ///
    /// The implementation combines the global seed with `stream` so that
    /// distinct streams are independent but reproducible.
    fn rng(&self, stream: u64) -> ChaCha8Rng;

    /// Returns the context's seed, logged at peer startup so a run can be
    /// replayed.
    ///
    /// In production, returns 0 (not seeded).
    fn seed(&self) -> u64;
}
