//! Network transport abstraction for peers.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::PeerId;

/// Abstraction for outbound frame delivery between peers.
///
/// Frames are opaque, already-encoded, newline-terminated records. Inbound
/// delivery is not part of this trait: implementations push decoded
/// messages straight into the receiving peer's inbound queue.
///
/// # Implementations
///
/// - **Production**: `TcpLink` (one TCP stream per ordered peer pair)
/// - **Simulation**: `SimNetwork` (in-memory router with fault injection)
///
/// # Frame Flow
///
/// ```text
/// Peer A                     Transport                   Peer B
///   |                           |                          |
///   |-- send(B, frame) -------->|                          |
///   |                           |-- decode + push -------->| inbound queue
///   |                           |                          |-- tick pops
/// ```
#[async_trait]
pub trait NetworkTransport: Send + Sync + 'static {
    /// Sends one encoded frame to a neighbor.
    ///
    /// # Returns
    /// * `Ok(())` - Frame fully written (or handed to the simulated router)
    /// * `Err(EnvError)` - Write failed after the transport's bounded retries
    async fn send(&self, target: PeerId, frame: &[u8]) -> Result<(), EnvError>;

    /// Sends one frame to every neighbor.
    ///
    /// Returns the neighbors that accepted the frame. Per-target failures are
    /// returned alongside so the caller can record them.
    async fn broadcast(&self, frame: &[u8]) -> (Vec<PeerId>, Vec<(PeerId, EnvError)>) {
        let mut delivered = Vec::new();
        let mut failed = Vec::new();
        for target in self.neighbors() {
            match self.send(target, frame).await {
                Ok(()) => delivered.push(target),
                Err(e) => failed.push((target, e)),
            }
        }
        (delivered, failed)
    }

    /// Returns every neighbor in the fixed topology, ascending.
    fn neighbors(&self) -> Vec<PeerId>;

    /// Returns this peer's ID.
    fn local_id(&self) -> PeerId;

    /// Returns neighbors that could not be reached after retries were exhausted.
    fn unreachable(&self) -> Vec<PeerId> {
        Vec::new()
    }

    /// Closes all connections. Idempotent.
    async fn shutdown(&self);
}
