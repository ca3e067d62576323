//! Lamport logical clock.
//!
//! The counter advances by exactly one per event. An earlier variant that
//! advanced by elapsed real seconds was dropped: two events close together
//! in wall time could tie or invert. Wall-clock drift is measured on the
//! side via [`LamportClock::drift`] and never feeds back into the counter.

use std::time::Duration;

/// Per-peer causal counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LamportClock {
    value: u64,
}

impl LamportClock {
    /// Creates a clock at zero.
    pub fn new() -> Self {
        Self { value: 0 }
    }

    /// Current counter value.
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Internal event or send: counter += 1.
    pub fn advance_on_local_event(&mut self) -> u64 {
        self.value = self.value.saturating_add(1);
        self.value
    }

    /// Receive: counter = max(counter, received) + 1.
    pub fn advance_on_receive(&mut self, received: u64) -> u64 {
        self.value = self.value.max(received).saturating_add(1);
        self.value
    }

    /// Logical value minus elapsed real seconds since the peer started.
    pub fn drift(&self, elapsed: Duration) -> f64 {
        self.value as f64 - elapsed.as_secs_f64()
    }
}
