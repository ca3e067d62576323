//! Weighted action space for a peer's idle ticks.

use crate::error::ConfigError;
use lamport_env::PeerId;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// What a peer does on a tick that found its queue empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Local event, no message
    Internal,

    /// Send to exactly one neighbor
    SendTo(PeerId),

    /// Send to every neighbor
    Broadcast,
}

/// Relative weights of the action variants.
///
/// `send` is the weight of *each* single-neighbor send, so with two
/// neighbors and `standard()` weights the draw matches a uniform 1..=10
/// roll: 1 → first neighbor, 2 → second, 3 → both, 4..=10 → internal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionWeights {
    pub internal: u32,
    pub send: u32,
    pub broadcast: u32,
}

impl ActionWeights {
    pub const fn new(internal: u32, send: u32, broadcast: u32) -> Self {
        Self {
            internal,
            send,
            broadcast,
        }
    }

    /// Mostly internal events, occasional traffic.
    pub const fn standard() -> Self {
        Self::new(7, 1, 1)
    }

    /// Traffic on most ticks.
    pub const fn chatty() -> Self {
        Self::new(1, 1, 1)
    }

    /// Standard mix with broadcasts three times as likely.
    pub const fn broadcast_heavy() -> Self {
        Self::new(7, 1, 3)
    }

    /// Every idle tick sends to one neighbor.
    pub const fn send_only() -> Self {
        Self::new(0, 1, 0)
    }

    /// Never sends.
    pub const fn silent() -> Self {
        Self::new(1, 0, 0)
    }

    /// Looks up a named preset.
    pub fn preset(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "standard" => Some(Self::standard()),
            "chatty" => Some(Self::chatty()),
            "broadcast_heavy" | "broadcast-heavy" | "weighted" => Some(Self::broadcast_heavy()),
            "send_only" | "send-only" => Some(Self::send_only()),
            "silent" => Some(Self::silent()),
            _ => None,
        }
    }
}

impl Default for ActionWeights {
    fn default() -> Self {
        Self::standard()
    }
}

/// Weight table resolved once against a peer's neighbors.
#[derive(Debug, Clone)]
pub struct ActionTable {
    actions: Vec<Action>,
    weights: Vec<u32>,
    index: WeightedIndex<u32>,
}

impl ActionTable {
    /// Resolves `weights` against `neighbors`.
    ///
    /// Zero-weight variants are dropped. Without neighbors, only internal
    /// events remain. A table with nothing left is a configuration error.
    pub fn new(weights: ActionWeights, neighbors: &[PeerId]) -> Result<Self, ConfigError> {
        let mut entries: Vec<(Action, u32)> = Vec::with_capacity(neighbors.len() + 2);

        if weights.internal > 0 {
            entries.push((Action::Internal, weights.internal));
        }
        if weights.send > 0 {
            entries.extend(neighbors.iter().map(|n| (Action::SendTo(*n), weights.send)));
        }
        if weights.broadcast > 0 && !neighbors.is_empty() {
            entries.push((Action::Broadcast, weights.broadcast));
        }

        if entries.is_empty() {
            return Err(ConfigError::InvalidWeights(format!(
                "no selectable action for weights {:?} with {} neighbor(s)",
                weights,
                neighbors.len()
            )));
        }

        let (actions, weights): (Vec<_>, Vec<_>) = entries.into_iter().unzip();
        let index = WeightedIndex::new(&weights)
            .map_err(|e| ConfigError::InvalidWeights(e.to_string()))?;

        Ok(Self {
            actions,
            weights,
            index,
        })
    }

    /// Draws one action.
    pub fn choose<R: Rng + ?Sized>(&self, rng: &mut R) -> Action {
        self.actions[self.index.sample(rng)]
    }

    /// Resolved entries, in table order.
    pub fn entries(&self) -> impl Iterator<Item = (Action, u32)> + '_ {
        self.actions.iter().copied().zip(self.weights.iter().copied())
    }

    /// Probability of `action` under this table.
    pub fn probability(&self, action: Action) -> f64 {
        let total: u64 = self.weights.iter().map(|w| *w as u64).sum();
        let hit: u64 = self
            .entries()
            .filter(|(a, _)| *a == action)
            .map(|(_, w)| w as u64)
            .sum();
        hit as f64 / total as f64
    }
}
