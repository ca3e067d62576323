//! Peer configuration injected at startup.
//!
//! Everything here is validated before a peer binds a socket; any
//! [`ConfigError`] is fatal and the peer refuses to start.

use crate::actions::{ActionTable, ActionWeights};
use crate::error::ConfigError;
use lamport_env::PeerId;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// One topology entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub id: PeerId,
    pub addr: SocketAddr,
}

/// Fixed full-mesh topology: every peer links to every other peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<PeerEntry>", into = "Vec<PeerEntry>")]
pub struct Topology {
    peers: BTreeMap<PeerId, SocketAddr>,
}

impl Topology {
    pub fn new(entries: impl IntoIterator<Item = PeerEntry>) -> Result<Self, ConfigError> {
        let mut peers = BTreeMap::new();
        let mut by_addr: BTreeMap<SocketAddr, PeerId> = BTreeMap::new();

        for entry in entries {
            if peers.insert(entry.id, entry.addr).is_some() {
                return Err(ConfigError::DuplicatePeer(entry.id));
            }
            if let Some(first) = by_addr.insert(entry.addr, entry.id) {
                return Err(ConfigError::DuplicateAddress {
                    addr: entry.addr,
                    first,
                    second: entry.id,
                });
            }
        }

        if peers.is_empty() {
            return Err(ConfigError::EmptyTopology);
        }
        Ok(Self { peers })
    }

    /// Peers `0..count` on `127.0.0.1:base_port + i`.
    pub fn localhost(count: u32, base_port: u16) -> Result<Self, ConfigError> {
        let entries = (0..count)
            .map(|i| {
                let port = u16::try_from(i)
                    .ok()
                    .and_then(|offset| base_port.checked_add(offset))
                    .ok_or_else(|| {
                        ConfigError::InvalidLink(format!("port overflow for peer {}", i))
                    })?;
                Ok(PeerEntry {
                    id: PeerId::new(i),
                    addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Self::new(entries)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn address(&self, id: PeerId) -> Option<SocketAddr> {
        self.peers.get(&id).copied()
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    /// Every other peer, ascending.
    pub fn neighbors_of(&self, id: PeerId) -> Vec<PeerId> {
        self.peers.keys().copied().filter(|p| *p != id).collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = PeerEntry> + '_ {
        self.peers.iter().map(|(id, addr)| PeerEntry { id: *id, addr: *addr })
    }
}

impl TryFrom<Vec<PeerEntry>> for Topology {
    type Error = ConfigError;

    fn try_from(entries: Vec<PeerEntry>) -> Result<Self, Self::Error> {
        Self::new(entries)
    }
}

impl From<Topology> for Vec<PeerEntry> {
    fn from(topology: Topology) -> Self {
        topology.entries().collect()
    }
}

/// Tick rate, in ticks per second.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speed {
    /// Exactly this many ticks per second
    Fixed(f64),

    /// Integer rate drawn once at startup from `min..=max`
    Range { min: u32, max: u32 },
}

impl Speed {
    /// Low-variation preset: 4..=6 ticks per second.
    pub const LOW_VARIATION: Speed = Speed::Range { min: 4, max: 6 };

    /// High-variation preset: 1..=6 ticks per second.
    pub const HIGH_VARIATION: Speed = Speed::Range { min: 1, max: 6 };

    /// Slowest accepted rate: one tick every 1000 seconds.
    pub const MIN_RATE: f64 = 0.001;

    /// Fastest accepted rate.
    pub const MAX_RATE: f64 = 1_000.0;

    pub fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            Speed::Fixed(rate) if !(Self::MIN_RATE..=Self::MAX_RATE).contains(&rate) => {
                Err(ConfigError::InvalidSpeed(format!(
                    "fixed rate must be within {}..={} ticks/s, got {}",
                    Self::MIN_RATE,
                    Self::MAX_RATE,
                    rate
                )))
            }
            Speed::Range { min, max } if min == 0 || min > max || f64::from(max) > Self::MAX_RATE => {
                Err(ConfigError::InvalidSpeed(format!(
                    "range must satisfy 1 <= min <= max <= {}, got {}..={}",
                    Self::MAX_RATE,
                    min,
                    max
                )))
            }
            Speed::Fixed(rate) => tick_period(rate).map(|_| ()),
            Speed::Range { .. } => Ok(()),
        }
    }

    /// Resolves to a concrete rate.
    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match *self {
            Speed::Fixed(rate) => rate,
            Speed::Range { min, max } => rng.gen_range(min..=max) as f64,
        }
    }
}

impl Default for Speed {
    fn default() -> Self {
        Speed::HIGH_VARIATION
    }
}

/// Period of one tick at `ticks_per_sec`. Never zero.
pub fn tick_period(ticks_per_sec: f64) -> Result<Duration, ConfigError> {
    match Duration::try_from_secs_f64(1.0 / ticks_per_sec) {
        Ok(period) if !period.is_zero() => Ok(period),
        _ => Err(ConfigError::InvalidSpeed(format!(
            "{} ticks/s has no usable tick period",
            ticks_per_sec
        ))),
    }
}

/// Connection behavior of the TCP link layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Dial attempts per neighbor before giving up
    pub connect_attempts: u32,

    /// First retry delay; doubles per attempt
    pub initial_backoff_ms: u64,

    /// Retry delay ceiling
    pub max_backoff_ms: u64,

    /// Upper bound on one dial attempt
    pub connect_timeout_ms: u64,

    /// Upper bound on writing one frame
    pub write_timeout_ms: u64,

    /// Longest accepted inbound frame
    pub max_frame_bytes: usize,
}

impl LinkConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(self.initial_backoff_ms.saturating_mul(factor)).min(self.max_backoff())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_attempts == 0 {
            return Err(ConfigError::InvalidLink("connect_attempts must be at least 1".into()));
        }
        if self.write_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidLink("timeouts must be positive".into()));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(ConfigError::InvalidLink(
                "max_backoff_ms must not be below initial_backoff_ms".into(),
            ));
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::InvalidLink("max_frame_bytes must be positive".into()));
        }
        Ok(())
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 10,
            initial_backoff_ms: 50,
            max_backoff_ms: 1_000,
            connect_timeout_ms: 500,
            write_timeout_ms: 500,
            max_frame_bytes: 64 * 1024,
        }
    }
}

/// Longest accepted run duration: one year.
pub const MAX_RUN_DURATION_SECS: f64 = 365.0 * 24.0 * 3600.0;

/// Everything a peer needs at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: PeerId,

    pub topology: Topology,

    #[serde(default)]
    pub speed: Speed,

    #[serde(default)]
    pub weights: ActionWeights,

    /// Stop after this many seconds; `None` runs until stopped
    #[serde(default)]
    pub run_duration_secs: Option<f64>,

    /// Seed for action and speed draws; `None` uses OS entropy
    #[serde(default)]
    pub seed: Option<u64>,

    #[serde(default)]
    pub link: LinkConfig,
}

impl PeerConfig {
    pub fn new(id: PeerId, topology: Topology) -> Self {
        Self {
            id,
            topology,
            speed: Speed::default(),
            weights: ActionWeights::default(),
            run_duration_secs: None,
            seed: None,
            link: LinkConfig::default(),
        }
    }

    pub fn with_speed(mut self, speed: Speed) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_weights(mut self, weights: ActionWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_run_duration(mut self, duration: Duration) -> Self {
        self.run_duration_secs = Some(duration.as_secs_f64());
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_link(mut self, link: LinkConfig) -> Self {
        self.link = link;
        self
    }

    pub fn neighbors(&self) -> Vec<PeerId> {
        self.topology.neighbors_of(self.id)
    }

    pub fn run_duration(&self) -> Result<Option<Duration>, ConfigError> {
        let Some(secs) = self.run_duration_secs else {
            return Ok(None);
        };
        if !(secs > 0.0 && secs <= MAX_RUN_DURATION_SECS) {
            return Err(ConfigError::InvalidRunDuration(format!(
                "run_duration_secs must be within (0, {}], got {}",
                MAX_RUN_DURATION_SECS, secs
            )));
        }
        Duration::try_from_secs_f64(secs)
            .map(Some)
            .map_err(|e| ConfigError::InvalidRunDuration(e.to_string()))
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.topology
            .address(self.id)
            .ok_or(ConfigError::UnknownPeer(self.id))
    }

    /// Checks every field; returns the resolved action table on success.
    pub fn validate(&self) -> Result<ActionTable, ConfigError> {
        if !self.topology.contains(self.id) {
            return Err(ConfigError::UnknownPeer(self.id));
        }
        self.speed.validate()?;
        self.link.validate()?;
        self.run_duration()?;
        ActionTable::new(self.weights, &self.neighbors())
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_json_str(&json)
    }
}
