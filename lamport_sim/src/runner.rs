//! Scenario runner - executes deterministic peer scenarios.

use crate::context::SimContext;
use crate::scenarios::ScenarioId;
use crate::world::{SimConfig, SimPeer, SimWorld};

use lamport_core::{ActionWeights, ErrorKind, EventKind, PeerSummary, Speed, MAX_RUN_DURATION_SECS};
use lamport_env::{PeerContext, PeerId};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// RNG stream for drawing peer speeds.
const SPEED_STREAM: u64 = u64::MAX;

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total ticks executed across all peers
    pub total_ticks: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,

    /// Per-peer summaries, by peer id
    pub summaries: Vec<PeerSummary>,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    /// Frames written by any peer
    pub messages_sent: u64,

    /// Messages pushed into a queue
    pub messages_delivered: u64,

    /// Frames written to a deaf link
    pub undelivered: u64,

    /// Frames refused by a partition
    pub dropped: u64,

    /// Diagnostics recorded by any peer
    pub diagnostics: u64,

    /// Largest backlog seen by any peer
    pub max_queue_len: usize,

    /// Largest drift seen by any peer
    pub max_drift: f64,
}

/// Runs scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Virtual duration of each scenario in seconds
    duration_secs: f64,
}

impl ScenarioRunner {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            duration_secs: 30.0,
        }
    }

    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration_secs = secs;
        self
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Runs a scenario and returns the result.
    pub async fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.run_detailed(scenario).await.0
    }

    /// Runs a scenario and also hands back the finished world.
    pub async fn run_detailed(&self, scenario: ScenarioId) -> (ScenarioResult, Option<SimWorld>) {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let outcome = match scenario {
            ScenarioId::Simplex => self.run_simplex().await,
            ScenarioId::SlowReceiver => self.run_slow_receiver().await,
            ScenarioId::DeafNeighbor => self.run_deaf_neighbor().await,
            ScenarioId::MalformedFrame => self.run_malformed_frame().await,
            ScenarioId::FullMesh => self.run_full_mesh().await,
        };

        match outcome {
            Ok((world, verdict)) => {
                let result = self.result(scenario, &world, verdict);
                (result, Some(world))
            }
            Err(reason) => {
                warn!(scenario = scenario.name(), %reason, "Scenario setup failed");
                let result = ScenarioResult {
                    scenario,
                    seed: self.seed,
                    passed: false,
                    total_ticks: 0,
                    final_time_secs: 0.0,
                    failure_reason: Some(reason),
                    metrics: ScenarioMetrics::default(),
                    summaries: Vec::new(),
                };
                (result, None)
            }
        }
    }

    /// Clamped to `0..=MAX_RUN_DURATION_SECS`; NaN runs for zero time.
    fn duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.duration_secs.clamp(0.0, MAX_RUN_DURATION_SECS))
            .unwrap_or_default()
    }

    fn world(&self, peers: Vec<SimPeer>) -> Result<SimWorld, String> {
        SimWorld::new(SimConfig {
            seed: self.seed,
            peers,
        })
        .map_err(|e| e.to_string())
    }

    fn result(&self, scenario: ScenarioId, world: &SimWorld, verdict: Result<(), String>) -> ScenarioResult {
        let summaries: Vec<PeerSummary> = world.peer_ids().into_iter().map(|id| world.summary(id)).collect();
        let totals = world.router().totals();
        let diagnostics: usize = world
            .peer_ids()
            .into_iter()
            .map(|id| world.diagnostics(id).len())
            .sum();

        let metrics = ScenarioMetrics {
            messages_sent: totals.sent,
            messages_delivered: totals.delivered,
            undelivered: totals.undelivered,
            dropped: totals.dropped,
            diagnostics: diagnostics as u64,
            max_queue_len: summaries.iter().map(|s| s.max_queue_len).max().unwrap_or(0),
            max_drift: summaries
                .iter()
                .map(|s| s.max_drift)
                .fold(f64::NEG_INFINITY, f64::max),
        };

        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: verdict.is_ok(),
            total_ticks: world.tick_count(),
            final_time_secs: world.time(),
            failure_reason: verdict.err(),
            metrics,
            summaries,
        }
    }

    /// Simplex: A (1 tick/s) only sends, B (6 ticks/s) never sends.
    ///
    /// **Assertion**: B applies every message and ends with the higher clock.
    async fn run_simplex(&self) -> Result<(SimWorld, Result<(), String>), String> {
        let mut world = self.world(vec![
            SimPeer::new(1.0, ActionWeights::send_only()),
            SimPeer::new(6.0, ActionWeights::silent()),
        ])?;
        world.run_for(self.duration()).await;

        let (a, b) = (PeerId::new(0), PeerId::new(1));
        let verdict = check_clocks(&world).and_then(|_| check_causality(&world)).and_then(|_| {
            let sa = world.summary(a);
            let sb = world.summary(b);
            info!(a_clock = sa.final_clock, b_clock = sb.final_clock, "Simplex clocks");

            if sb.counts.receive != sa.counts.send {
                return Err(format!(
                    "B applied {} of {} messages",
                    sb.counts.receive, sa.counts.send
                ));
            }
            if sb.final_clock <= sa.final_clock {
                return Err(format!(
                    "B's clock {} did not exceed A's {}",
                    sb.final_clock, sa.final_clock
                ));
            }
            Ok(())
        });
        Ok((world, verdict))
    }

    /// Slow receiver: A (6 ticks/s) only sends, B (1 tick/s) never sends.
    ///
    /// **Assertion**: B's backlog grows and never meaningfully shrinks.
    async fn run_slow_receiver(&self) -> Result<(SimWorld, Result<(), String>), String> {
        let mut world = self.world(vec![
            SimPeer::new(6.0, ActionWeights::send_only()),
            SimPeer::new(1.0, ActionWeights::silent()),
        ])?;
        world.run_for(self.duration()).await;

        let b = world.summary(PeerId::new(1));
        info!(
            growth = b.queue_growth(),
            max_queue_len = b.max_queue_len,
            "Receiver backlog"
        );

        let verdict = check_clocks(&world).and_then(|_| {
            if b.queue_growth() <= 0 {
                return Err(format!("backlog did not grow ({})", b.queue_growth()));
            }
            if !b.queue_trend_non_decreasing(1) {
                return Err("backlog shrank while the sender outpaced the receiver".to_string());
            }
            Ok(())
        });
        Ok((world, verdict))
    }

    /// Deaf neighbor: three peers all-to-all, C never reads A.
    ///
    /// **Assertion**: the A->C backlog keeps growing and C never applies
    /// a message from A.
    async fn run_deaf_neighbor(&self) -> Result<(SimWorld, Result<(), String>), String> {
        // A and B drain faster than they receive, so both keep acting
        let mut world = self.world(vec![
            SimPeer::new(4.0, ActionWeights::chatty()),
            SimPeer::new(4.0, ActionWeights::chatty()),
            SimPeer::new(3.0, ActionWeights::chatty()),
        ])?;
        let (a, b, c) = (PeerId::new(0), PeerId::new(1), PeerId::new(2));
        world.controller().deafen(c, a);

        let half = self.duration() / 2;
        world.run_for(half).await;
        let midway = world.router().link_stats(a, c).undelivered;
        world.run_for(self.duration() - half).await;
        let end = world.router().link_stats(a, c).undelivered;
        info!(midway, end, "Undelivered A->C frames");

        let verdict = check_clocks(&world).and_then(|_| {
            if midway == 0 || end <= midway {
                return Err(format!("A->C backlog did not keep growing ({} then {})", midway, end));
            }
            if world
                .records(c)
                .iter()
                .any(|r| r.kind == EventKind::Receive && r.sender == Some(a))
            {
                return Err("C applied a message from A".to_string());
            }
            if world.router().link_stats(b, c).delivered == 0 {
                return Err("C received nothing from B".to_string());
            }
            Ok(())
        });
        Ok((world, verdict))
    }

    /// Malformed frame: garbage injected into B's inbound path mid-run.
    ///
    /// **Assertion**: framing and schema diagnostics are recorded, B's
    /// queue is unchanged and B keeps ticking.
    async fn run_malformed_frame(&self) -> Result<(SimWorld, Result<(), String>), String> {
        let mut world = self.world(vec![
            SimPeer::new(2.0, ActionWeights::standard()),
            SimPeer::new(2.0, ActionWeights::standard()),
        ])?;
        let b = PeerId::new(1);

        let half = self.duration() / 2;
        world.run_for(half).await;

        let before = world.queue_len(b);
        let ticks_before = world.records(b).len();
        let injected = world
            .router()
            .inject_raw(b, b"\xff\xfe\x00 not a frame\n{\"sender_id\":\"peer-x\",\"logical_clock\":-1}\n")
            .await
            .map_err(|e| e.to_string())?;
        let after = world.queue_len(b);
        debug!(?injected, before, after, "Injected garbage");

        world.run_for(self.duration() - half).await;

        let kinds: Vec<ErrorKind> = world.diagnostics(b).iter().map(|d| d.kind).collect();
        let verdict = if injected != (0, 2) {
            Err(format!("expected 2 rejected frames, got {:?}", injected))
        } else if before != after {
            Err(format!("queue length changed from {} to {}", before, after))
        } else if !kinds.contains(&ErrorKind::Framing) || !kinds.contains(&ErrorKind::Schema) {
            Err(format!("missing diagnostics, saw {:?}", kinds))
        } else if world.records(b).len() <= ticks_before {
            Err("B stopped ticking after the garbage".to_string())
        } else {
            check_clocks(&world)
        };
        Ok((world, verdict))
    }

    /// Full mesh: three peers at speeds drawn from 1..=6 ticks/s.
    ///
    /// **Assertion**: clocks strictly increase, causal order holds and
    /// every delivered message is applied at most once.
    async fn run_full_mesh(&self) -> Result<(SimWorld, Result<(), String>), String> {
        let mut rng = SimContext::new(self.seed).rng(SPEED_STREAM);
        let peers = (0..3)
            .map(|_| SimPeer::new(Speed::HIGH_VARIATION.draw(&mut rng), ActionWeights::standard()))
            .collect();
        let mut world = self.world(peers)?;
        world.run_for(self.duration()).await;

        let verdict = check_clocks(&world).and_then(|_| check_causality(&world)).and_then(|_| {
            for id in world.peer_ids() {
                let applied = world.summary(id).counts.receive;
                let delivered: u64 = world
                    .peer_ids()
                    .into_iter()
                    .map(|from| world.router().link_stats(from, id).delivered)
                    .sum();
                let backlog = world.queue_len(id) as u64;
                if applied + backlog != delivered {
                    return Err(format!(
                        "{}: applied {} + queued {} != delivered {}",
                        id, applied, backlog, delivered
                    ));
                }
            }
            Ok(())
        });
        Ok((world, verdict))
    }
}

/// Every peer's clock strictly increases record to record.
fn check_clocks(world: &SimWorld) -> Result<(), String> {
    for id in world.peer_ids() {
        let records = world.records(id);
        if let Some(pair) = records.windows(2).find(|w| w[1].logical_clock <= w[0].logical_clock) {
            return Err(format!(
                "{}: clock went from {} to {} at tick {}",
                id, pair[0].logical_clock, pair[1].logical_clock, pair[1].tick
            ));
        }
    }
    Ok(())
}

/// The k-th message a receiver applies from a sender carries that sender's
/// k-th send to it; the receive must be stamped later than the send.
fn check_causality(world: &SimWorld) -> Result<(), String> {
    for receiver in world.peer_ids() {
        let receives = world.records(receiver);
        for sender in world.peer_ids() {
            if sender == receiver {
                continue;
            }
            let sends: Vec<u64> = world
                .records(sender)
                .iter()
                .filter(|r| r.kind == EventKind::Send && r.targets.contains(&receiver))
                .map(|r| r.logical_clock)
                .collect();
            let applied: Vec<u64> = receives
                .iter()
                .filter(|r| r.kind == EventKind::Receive && r.sender == Some(sender))
                .map(|r| r.logical_clock)
                .collect();

            if applied.len() > sends.len() {
                return Err(format!(
                    "{} applied {} messages from {} but only {} were sent",
                    receiver,
                    applied.len(),
                    sender,
                    sends.len()
                ));
            }
            if let Some((sent, got)) = sends.iter().zip(&applied).find(|(s, r)| r <= s) {
                return Err(format!(
                    "{} stamped a receive at {} for a message sent at {} by {}",
                    receiver, got, sent, sender
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_is_clamped() {
        let year = Duration::from_secs_f64(MAX_RUN_DURATION_SECS);
        assert_eq!(ScenarioRunner::new(1).with_duration(1e30).duration(), year);
        assert_eq!(ScenarioRunner::new(1).with_duration(-4.0).duration(), Duration::ZERO);
        assert_eq!(ScenarioRunner::new(1).with_duration(f64::NAN).duration(), Duration::ZERO);
        assert_eq!(ScenarioRunner::new(1).with_duration(2.5).duration(), Duration::from_millis(2500));
    }

    #[tokio::test]
    async fn test_simplex_passes() {
        let result = ScenarioRunner::new(42).with_duration(20.0).run(ScenarioId::Simplex).await;
        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.summaries[1].final_clock > result.summaries[0].final_clock);
        assert_eq!(result.summaries[0].counts.send, 20);
    }

    #[tokio::test]
    async fn test_slow_receiver_backlog_grows() {
        let result = ScenarioRunner::new(42)
            .with_duration(20.0)
            .run(ScenarioId::SlowReceiver)
            .await;
        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.summaries[1].queue_growth() >= 80);
        assert!(result.metrics.max_queue_len >= 90);
    }

    #[tokio::test]
    async fn test_deaf_neighbor_backlog_unbounded() {
        for seed in [1, 42, 1234] {
            let result = ScenarioRunner::new(seed)
                .with_duration(30.0)
                .run(ScenarioId::DeafNeighbor)
                .await;
            assert!(result.passed, "seed {}: {:?}", seed, result.failure_reason);
            assert!(result.metrics.undelivered > 0);
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_is_contained() {
        let result = ScenarioRunner::new(7)
            .with_duration(10.0)
            .run(ScenarioId::MalformedFrame)
            .await;
        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.metrics.diagnostics >= 2);
    }

    #[tokio::test]
    async fn test_full_mesh_across_seeds() {
        for seed in 0..5 {
            let result = ScenarioRunner::new(seed)
                .with_duration(30.0)
                .run(ScenarioId::FullMesh)
                .await;
            assert!(result.passed, "seed {}: {:?}", seed, result.failure_reason);
            assert_eq!(result.summaries.len(), 3);
        }
    }

    #[tokio::test]
    async fn test_result_serializes_scenario_name() {
        let result = ScenarioRunner::new(3).with_duration(2.0).run(ScenarioId::Simplex).await;
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["scenario"], "simplex");
        assert_eq!(json["seed"], 3);
    }
}
