//! SimWorld - the simulation harness container.
//!
//! Owns every simulated peer and fires their ticks in virtual-time order.
//! The shared clock jumps straight from one tick to the next, so a
//! minute of simulated traffic runs in milliseconds and is fully
//! determined by the seed.

use crate::context::SimContext;
use crate::network::{SimNetwork, SimNetworkController, SimRouter};

use chrono::{DateTime, Utc};
use lamport_core::{
    ActionTable, ActionWeights, ConfigError, Diagnostic, EventLog, EventRecord,
    InboundQueue, MemorySink, PeerEngine, PeerReport, PeerSummary, Speed,
};
use lamport_env::{PeerContext, PeerId};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// One simulated peer's setup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimPeer {
    pub ticks_per_sec: f64,
    pub weights: ActionWeights,
}

impl SimPeer {
    pub fn new(ticks_per_sec: f64, weights: ActionWeights) -> Self {
        Self {
            ticks_per_sec,
            weights,
        }
    }
}

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Peers `0..n`, fully meshed
    pub peers: Vec<SimPeer>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            peers: vec![SimPeer::new(1.0, ActionWeights::standard()); 3],
        }
    }
}

struct SimPeerHandle {
    engine: PeerEngine<SimContext, SimNetwork>,
    sink: MemorySink,
    period: Duration,
    next_fire: Duration,
}

/// The SimWorld - container for the entire simulation.
pub struct SimWorld {
    config: SimConfig,
    context: Arc<SimContext>,
    router: Arc<SimRouter>,
    peers: Vec<SimPeerHandle>,
    tick_count: u64,
}

impl SimWorld {
    pub fn new(config: SimConfig) -> Result<Self, ConfigError> {
        if config.peers.is_empty() {
            return Err(ConfigError::EmptyTopology);
        }

        let context = SimContext::shared(config.seed);
        let controller = Arc::new(SimNetworkController::new());
        let ids: Vec<PeerId> = (0..config.peers.len() as u32).map(PeerId::new).collect();

        let mut router = SimRouter::new(controller);
        let mut staged = Vec::with_capacity(ids.len());
        for (id, spec) in ids.iter().zip(&config.peers) {
            Speed::Fixed(spec.ticks_per_sec).validate()?;
            let neighbors: Vec<PeerId> = ids.iter().copied().filter(|n| n != id).collect();
            let actions = ActionTable::new(spec.weights, &neighbors)?;

            let queue = Arc::new(InboundQueue::new());
            let sink = MemorySink::new();
            let clock = Arc::clone(&context);
            let log = Arc::new(
                EventLog::new(*id)
                    .with_sink(Arc::new(sink.clone()))
                    .with_clock(move || DateTime::<Utc>::from(clock.system_time())),
            );
            router.attach(*id, Arc::clone(&queue), Arc::clone(&log));
            staged.push((*id, neighbors, actions, queue, log, sink, spec.ticks_per_sec));
        }

        let router = Arc::new(router);
        let peers = staged
            .into_iter()
            .map(|(id, neighbors, actions, queue, log, sink, ticks_per_sec)| {
                let network = Arc::new(SimNetwork::new(id, neighbors, Arc::clone(&router)));
                let engine = PeerEngine::new(
                    Arc::clone(&context),
                    network,
                    queue,
                    log,
                    actions,
                    ticks_per_sec,
                )?;
                Ok(SimPeerHandle {
                    period: engine.period(),
                    engine,
                    sink,
                    next_fire: Duration::ZERO,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        debug!(seed = context.seed(), peers = peers.len(), "Simulation world built");

        Ok(Self {
            config,
            context,
            router,
            peers,
            tick_count: 0,
        })
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<SimContext> {
        &self.context
    }

    pub fn router(&self) -> &Arc<SimRouter> {
        &self.router
    }

    pub fn controller(&self) -> &Arc<SimNetworkController> {
        self.router.controller()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.iter().map(|p| p.engine.id()).collect()
    }

    /// Fires every tick due within the next `duration` of virtual time,
    /// earliest first (ties go to the lower peer id). Returns the number
    /// of ticks fired.
    pub async fn run_for(&mut self, duration: Duration) -> u64 {
        let end = self.context.now() + duration;
        let mut fired = 0;

        loop {
            let next = self
                .peers
                .iter()
                .enumerate()
                .min_by_key(|(i, p)| (p.next_fire, *i))
                .map(|(i, p)| (i, p.next_fire));
            let Some((index, at)) = next else { break };
            if at >= end {
                break;
            }

            self.context.advance_to(at);
            let peer = &mut self.peers[index];
            peer.engine.step().await;
            peer.next_fire += peer.period;
            fired += 1;
        }

        self.context.advance_to(end);
        self.tick_count += fired;
        debug!(fired, time_secs = self.time(), "Simulation advanced");
        fired
    }

    /// Returns the current simulation time in seconds.
    pub fn time(&self) -> f64 {
        self.context.now().as_secs_f64()
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn handle(&self, peer: PeerId) -> Option<&SimPeerHandle> {
        self.peers.get(peer.as_u32() as usize)
    }

    pub fn records(&self, peer: PeerId) -> Vec<EventRecord> {
        self.handle(peer).map(|p| p.sink.records()).unwrap_or_default()
    }

    pub fn diagnostics(&self, peer: PeerId) -> Vec<Diagnostic> {
        self.handle(peer).map(|p| p.sink.diagnostics()).unwrap_or_default()
    }

    pub fn queue_len(&self, peer: PeerId) -> usize {
        self.handle(peer).map(|p| p.engine.queue().len()).unwrap_or(0)
    }

    pub fn clock(&self, peer: PeerId) -> u64 {
        self.handle(peer).map(|p| p.engine.clock()).unwrap_or(0)
    }

    pub fn report(&self, peer: PeerId) -> Option<PeerReport> {
        self.handle(peer).map(|p| p.engine.report())
    }

    pub fn summary(&self, peer: PeerId) -> PeerSummary {
        PeerSummary::from_records(&self.records(peer))
    }
}
