//! Production implementation of PeerContext using Tokio.

use crate::PeerContext;
use async_trait::async_trait;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Production context backed by Tokio and OS entropy.
///
/// Time comes from the system clock. RNG streams are seeded from the OS
/// unless a seed is supplied, in which case action draws are reproducible
/// even though tick timing is not.
pub struct TokioContext {
    /// Start time for monotonic duration calculations
    start: Instant,

    /// Optional master seed
    seed: Option<u64>,
}

impl TokioContext {
    /// Creates a new unseeded TokioContext.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            seed: None,
        }
    }

    /// Creates a context whose RNG streams derive from `seed`.
    pub fn seeded(seed: u64) -> Self {
        Self {
            start: Instant::now(),
            seed: Some(seed),
        }
    }

    /// Creates an Arc-wrapped context for sharing across tasks.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for TokioContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerContext for TokioContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn spawn<F>(&self, name: &str, future: F) -> JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let span = tracing::debug_span!("task", name = %name);
        tokio::spawn(future.instrument(span))
    }

    fn rng(&self, stream: u64) -> ChaCha8Rng {
        match self.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed.wrapping_mul(0x517cc1b727220a95) ^ stream),
            None => ChaCha8Rng::from_entropy(),
        }
    }

    fn seed(&self) -> u64 {
        self.seed.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    #[tokio::test]
    async fn test_tokio_context_time() {
        let ctx = TokioContext::new();
        let t1 = ctx.now();
        ctx.sleep(Duration::from_millis(10)).await;
        let t2 = ctx.now();

        assert!(t2 > t1);
        assert!(t2 - t1 >= Duration::from_millis(10));
    }

    #[test]
    fn test_tokio_context_seeded_streams() {
        let ctx = TokioContext::seeded(42);
        let a = ctx.rng(1).next_u64();
        let b = ctx.rng(1).next_u64();
        let c = ctx.rng(2).next_u64();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(ctx.seed(), 42);
    }

    #[tokio::test]
    async fn test_tokio_context_spawn_returns_output() {
        let ctx = TokioContext::seeded(3);
        let handle = ctx.spawn("answer", async { 6 * 7 });
        assert_eq!(handle.await.unwrap(), 42);
    }

    #[test]
    fn test_tokio_context_unseeded() {
        let ctx = TokioContext::new();
        assert_eq!(ctx.seed(), 0);
        // Entropy-seeded streams should not collide
        assert_ne!(ctx.rng(1).next_u64(), ctx.rng(1).next_u64());
    }
}
