//! Peer Engine - the per-peer tick loop.
//!
//! Each tick, the engine either drains exactly one inbound message or
//! performs one weighted-random local action, updates the Lamport clock
//! accordingly, and appends one record to the event log.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        PeerEngine                            │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │ Context: PeerContext                                   │  │
//! │  │  • now() → tick schedule, drift                        │  │
//! │  │  • system_time() → message / record timestamps         │  │
//! │  │  • rng() → action draws                                │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │        ▲ pop (single consumer)          │ send / broadcast   │
//! │  ┌─────┴────────┐  ┌──────────────┐  ┌──▼────────────────┐   │
//! │  │ InboundQueue │  │ LamportClock │  │ NetworkTransport  │   │
//! │  └─────▲────────┘  └──────────────┘  └───────────────────┘   │
//! │        │ push (one producer per neighbor connection)         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine is the sole mutator of its clock and the sole consumer of
//! its queue. Ticks never overlap: an overrunning tick causes the missed
//! ticks to be skipped, not replayed.

use crate::actions::{Action, ActionTable};
use crate::clock::LamportClock;
use crate::codec::{encode, Message};
use crate::config::tick_period;
use crate::error::{ConfigError, ErrorKind};
use crate::log::{Diagnostic, EventKind, EventLog, EventRecord};
use crate::queue::InboundQueue;

use chrono::{DateTime, Utc};
use lamport_env::{EnvError, NetworkTransport, PeerContext, PeerId};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Where the engine is within a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Waiting for the next tick
    Idle,
    /// Applying one queued message
    Draining,
    /// Performing an internal event or send
    Acting,
    /// Stopped; further ticks are no-ops
    Terminated,
}

/// Result of one tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Acted(EventRecord),
    Terminated,
}

/// Actions taken, by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCounts {
    pub internal: u64,
    pub send: u64,
    pub receive: u64,
}

impl EventCounts {
    fn bump(&mut self, kind: EventKind) {
        match kind {
            EventKind::Internal => self.internal += 1,
            EventKind::Send => self.send += 1,
            EventKind::Receive => self.receive += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.internal + self.send + self.receive
    }
}

/// Final state of a peer, handed back to whoever started it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerReport {
    pub id: PeerId,
    pub ticks_per_sec: f64,
    pub final_clock: u64,
    pub ticks: u64,
    pub skipped_ticks: u64,
    pub counts: EventCounts,
    pub send_failures: u64,
    pub queue_len_at_exit: usize,
    pub unreachable_neighbors: Vec<PeerId>,
}

/// A peer's scheduling loop.
///
/// Generic over the context and network implementations, so the same
/// engine runs against tokio + TCP or the simulation harness.
pub struct PeerEngine<Ctx, Net>
where
    Ctx: PeerContext,
    Net: NetworkTransport,
{
    id: PeerId,
    context: Arc<Ctx>,
    network: Arc<Net>,
    queue: Arc<InboundQueue>,
    log: Arc<EventLog>,
    actions: ActionTable,
    rng: ChaCha8Rng,
    clock: LamportClock,
    state: PeerState,

    /// Configured tick rate
    ticks_per_sec: f64,
    period: Duration,

    /// Stop after this long, measured from `started_at`
    run_duration: Option<Duration>,

    /// Context time at construction
    started_at: Duration,

    tick_count: u64,
    skipped_ticks: u64,
    counts: EventCounts,
    send_failures: u64,
}

impl<Ctx, Net> PeerEngine<Ctx, Net>
where
    Ctx: PeerContext,
    Net: NetworkTransport,
{
    /// Creates an engine. The action RNG stream is derived from the peer id.
    ///
    /// Fails when `ticks_per_sec` has no representable, non-zero period.
    pub fn new(
        context: Arc<Ctx>,
        network: Arc<Net>,
        queue: Arc<InboundQueue>,
        log: Arc<EventLog>,
        actions: ActionTable,
        ticks_per_sec: f64,
    ) -> Result<Self, ConfigError> {
        let period = tick_period(ticks_per_sec)?;
        let id = network.local_id();
        let rng = context.rng(id.as_u32() as u64);
        let started_at = context.now();

        Ok(Self {
            id,
            context,
            network,
            queue,
            log,
            actions,
            rng,
            clock: LamportClock::new(),
            state: PeerState::Idle,
            ticks_per_sec,
            period,
            run_duration: None,
            started_at,
            tick_count: 0,
            skipped_ticks: 0,
            counts: EventCounts::default(),
            send_failures: 0,
        })
    }

    pub fn with_run_duration(mut self, duration: Option<Duration>) -> Self {
        self.run_duration = duration;
        self
    }

    pub fn with_rng(mut self, rng: ChaCha8Rng) -> Self {
        self.rng = rng;
        self
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn clock(&self) -> u64 {
        self.clock.value()
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn counts(&self) -> EventCounts {
        self.counts
    }

    pub fn ticks_per_sec(&self) -> f64 {
        self.ticks_per_sec
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn queue(&self) -> &Arc<InboundQueue> {
        &self.queue
    }

    /// Time since the engine was created.
    pub fn elapsed(&self) -> Duration {
        self.context.now().saturating_sub(self.started_at)
    }

    /// True once the configured run duration has passed.
    pub fn run_expired(&self) -> bool {
        self.run_duration.is_some_and(|limit| self.elapsed() >= limit)
    }

    /// Runs one tick. Never blocks on the queue.
    pub async fn step(&mut self) -> TickOutcome {
        if self.state == PeerState::Terminated {
            return TickOutcome::Terminated;
        }

        self.tick_count += 1;
        let queue_len = self.queue.len();

        let record = match self.queue.try_pop_front() {
            Some(message) => {
                self.state = PeerState::Draining;
                let clock = self.clock.advance_on_receive(message.logical_clock);
                self.make_record(EventKind::Receive, clock, queue_len, Vec::new(), Some(message.sender_id))
            }
            None => {
                self.state = PeerState::Acting;
                match self.actions.choose(&mut self.rng) {
                    Action::Internal => {
                        let clock = self.clock.advance_on_local_event();
                        self.make_record(EventKind::Internal, clock, queue_len, Vec::new(), None)
                    }
                    Action::SendTo(target) => self.send(Some(target), queue_len).await,
                    Action::Broadcast => self.send(None, queue_len).await,
                }
            }
        };

        self.counts.bump(record.kind);
        self.log.record(record.clone());
        self.state = PeerState::Idle;
        TickOutcome::Acted(record)
    }

    /// Sends to `target`, or to every neighbor when `None`.
    async fn send(&mut self, target: Option<PeerId>, queue_len: usize) -> EventRecord {
        let clock = self.clock.advance_on_local_event();
        let message = Message::new(self.id, clock, self.wall_clock());
        let frame = encode(&message);

        let (delivered, failed) = match target {
            Some(target) => match self.network.send(target, &frame).await {
                Ok(()) => (vec![target], Vec::new()),
                Err(e) => (Vec::new(), vec![(target, e)]),
            },
            None => self.network.broadcast(&frame).await,
        };

        for (neighbor, error) in failed {
            self.record_send_failure(neighbor, error);
        }

        self.make_record(EventKind::Send, clock, queue_len, delivered, None)
    }

    fn record_send_failure(&mut self, neighbor: PeerId, error: EnvError) {
        self.send_failures += 1;
        self.log.diagnostic(Diagnostic {
            timestamp: self.wall_clock(),
            peer: self.id,
            kind: ErrorKind::Connection,
            neighbor: Some(neighbor),
            detail: format!("send failed: {}", error),
        });
    }

    fn make_record(
        &self,
        kind: EventKind,
        logical_clock: u64,
        queue_len: usize,
        targets: Vec<PeerId>,
        sender: Option<PeerId>,
    ) -> EventRecord {
        let elapsed = self.elapsed();
        EventRecord {
            timestamp: self.wall_clock(),
            peer: self.id,
            kind,
            logical_clock,
            queue_len,
            elapsed_secs: elapsed.as_secs_f64(),
            drift: self.clock.drift(elapsed),
            tick: self.tick_count,
            targets,
            sender,
        }
    }

    fn wall_clock(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.context.system_time())
    }

    /// Ticks at the configured rate until `shutdown` fires or the run
    /// duration elapses, then tears down and reports.
    pub async fn run(mut self, shutdown: CancellationToken) -> PeerReport {
        let period = self.period();
        let period_ns = period.as_nanos().max(1);

        info!(
            peer = %self.id,
            ticks_per_sec = self.ticks_per_sec,
            period_ms = period.as_millis() as u64,
            neighbors = self.network.neighbors().len(),
            "Peer engine starting"
        );

        let mut next_tick = self.context.now();
        loop {
            if shutdown.is_cancelled() || self.run_expired() {
                break;
            }

            self.step().await;

            next_tick += period;
            let now = self.context.now();
            if now > next_tick {
                let missed = (now - next_tick).as_nanos() / period_ns + 1;
                self.skipped_ticks += missed as u64;
                next_tick += Duration::from_nanos((missed * period_ns) as u64);
                debug!(peer = %self.id, missed = missed as u64, "Tick overran, skipping");
            }

            let wait = next_tick.saturating_sub(now);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.context.sleep(wait) => {}
            }
        }

        self.terminate().await
    }

    /// Stops ticking, closes the transport and flushes the log.
    pub async fn terminate(&mut self) -> PeerReport {
        if self.state != PeerState::Terminated {
            self.state = PeerState::Terminated;
            self.network.shutdown().await;
            self.log.flush();
            info!(
                peer = %self.id,
                clock = self.clock.value(),
                ticks = self.tick_count,
                skipped = self.skipped_ticks,
                backlog = self.queue.len(),
                "Peer engine stopped"
            );
        }
        self.report()
    }

    pub fn report(&self) -> PeerReport {
        PeerReport {
            id: self.id,
            ticks_per_sec: self.ticks_per_sec,
            final_clock: self.clock.value(),
            ticks: self.tick_count,
            skipped_ticks: self.skipped_ticks,
            counts: self.counts,
            send_failures: self.send_failures,
            queue_len_at_exit: self.queue.len(),
            unreachable_neighbors: self.network.unreachable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionWeights;
    use crate::codec::decode;
    use crate::log::MemorySink;
    use async_trait::async_trait;
    use lamport_env::TokioContext;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Captures frames instead of writing them anywhere.
    struct RecordingTransport {
        local: PeerId,
        neighbors: Vec<PeerId>,
        sent: Mutex<Vec<(PeerId, Vec<u8>)>>,
        failing: Option<PeerId>,
        delay: Option<Duration>,
        closed: AtomicBool,
    }

    impl RecordingTransport {
        fn new(local: u32, neighbors: &[u32]) -> Self {
            Self {
                local: PeerId::new(local),
                neighbors: neighbors.iter().map(|n| PeerId::new(*n)).collect(),
                sent: Mutex::new(Vec::new()),
                failing: None,
                delay: None,
                closed: AtomicBool::new(false),
            }
        }

        fn failing(mut self, peer: u32) -> Self {
            self.failing = Some(PeerId::new(peer));
            self
        }

        /// Every send blocks for `delay` before succeeding.
        fn slow(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        fn sent(&self) -> Vec<(PeerId, Vec<u8>)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NetworkTransport for RecordingTransport {
        async fn send(&self, target: PeerId, frame: &[u8]) -> Result<(), EnvError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing == Some(target) {
                return Err(EnvError::unreachable(target));
            }
            self.sent.lock().unwrap().push((target, frame.to_vec()));
            Ok(())
        }

        fn neighbors(&self) -> Vec<PeerId> {
            self.neighbors.clone()
        }

        fn local_id(&self) -> PeerId {
            self.local
        }

        async fn shutdown(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct Harness {
        engine: PeerEngine<TokioContext, RecordingTransport>,
        network: Arc<RecordingTransport>,
        queue: Arc<InboundQueue>,
        sink: MemorySink,
    }

    fn harness(weights: ActionWeights, transport: RecordingTransport) -> Harness {
        let context = Arc::new(TokioContext::seeded(42));
        let network = Arc::new(transport);
        let queue = Arc::new(InboundQueue::new());
        let sink = MemorySink::new();
        let log = Arc::new(EventLog::new(network.local_id()).with_sink(Arc::new(sink.clone())));
        let actions = ActionTable::new(weights, &network.neighbors()).unwrap();
        let engine =
            PeerEngine::new(context, Arc::clone(&network), Arc::clone(&queue), log, actions, 100.0)
                .unwrap();
        Harness {
            engine,
            network,
            queue,
            sink,
        }
    }

    fn incoming(sender: u32, clock: u64) -> Message {
        Message::new(PeerId::new(sender), clock, Utc::now())
    }

    fn acted(outcome: TickOutcome) -> EventRecord {
        match outcome {
            TickOutcome::Acted(record) => record,
            TickOutcome::Terminated => panic!("engine unexpectedly terminated"),
        }
    }

    #[tokio::test]
    async fn test_empty_queue_still_acts() {
        let mut h = harness(ActionWeights::silent(), RecordingTransport::new(0, &[1, 2]));

        let record = acted(h.engine.step().await);
        assert_eq!(record.kind, EventKind::Internal);
        assert_eq!(record.logical_clock, 1);
        assert_eq!(record.queue_len, 0);
        assert_eq!(h.engine.state(), PeerState::Idle);
        assert!(h.network.sent().is_empty());
    }

    #[tokio::test]
    async fn test_receive_jumps_past_sender_clock() {
        let mut h = harness(ActionWeights::silent(), RecordingTransport::new(0, &[1, 2]));
        acted(h.engine.step().await);

        h.queue.push(incoming(1, 10));
        h.queue.push(incoming(2, 3));

        let first = acted(h.engine.step().await);
        assert_eq!(first.kind, EventKind::Receive);
        assert_eq!(first.sender, Some(PeerId::new(1)));
        assert_eq!(first.queue_len, 2);
        assert_eq!(first.logical_clock, 11);

        let second = acted(h.engine.step().await);
        assert_eq!(second.sender, Some(PeerId::new(2)));
        assert_eq!(second.queue_len, 1);
        assert_eq!(second.logical_clock, 12);
    }

    #[tokio::test]
    async fn test_one_receive_record_per_message() {
        let mut h = harness(ActionWeights::silent(), RecordingTransport::new(0, &[1]));
        for clock in 1..=5 {
            h.queue.push(incoming(1, clock * 3));
        }

        for _ in 0..8 {
            h.engine.step().await;
        }

        let receives = h
            .sink
            .records()
            .iter()
            .filter(|r| r.kind == EventKind::Receive)
            .count();
        assert_eq!(receives, 5);
        assert!(h.queue.is_empty());
        assert_eq!(h.engine.counts().receive, 5);
        assert_eq!(h.engine.counts().internal, 3);
    }

    #[tokio::test]
    async fn test_send_carries_post_increment_clock() {
        let mut h = harness(ActionWeights::send_only(), RecordingTransport::new(0, &[1, 2]));

        let record = acted(h.engine.step().await);
        assert_eq!(record.kind, EventKind::Send);
        assert_eq!(record.targets.len(), 1);

        let sent = h.network.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, record.targets[0]);

        let message = decode(&sent[0].1).unwrap();
        assert_eq!(message.sender_id, PeerId::new(0));
        assert_eq!(message.logical_clock, record.logical_clock);
        assert_eq!(message.logical_clock, 1);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_neighbor() {
        let mut h = harness(ActionWeights::new(0, 0, 1), RecordingTransport::new(0, &[1, 2]));

        let record = acted(h.engine.step().await);
        assert_eq!(record.kind, EventKind::Send);
        assert_eq!(record.targets, vec![PeerId::new(1), PeerId::new(2)]);

        let sent = h.network.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1, sent[1].1);
    }

    #[tokio::test]
    async fn test_send_failure_is_contained() {
        let transport = RecordingTransport::new(0, &[1, 2]).failing(2);
        let mut h = harness(ActionWeights::new(0, 0, 1), transport);

        let record = acted(h.engine.step().await);
        assert_eq!(record.kind, EventKind::Send);
        assert_eq!(record.targets, vec![PeerId::new(1)]);

        let diags = h.sink.diagnostics();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].kind, ErrorKind::Connection);
        assert_eq!(diags[0].neighbor, Some(PeerId::new(2)));

        // The peer keeps ticking
        assert!(matches!(h.engine.step().await, TickOutcome::Acted(_)));
        assert_eq!(h.engine.report().send_failures, 2);
    }

    #[tokio::test]
    async fn test_clock_strictly_increases_across_records() {
        let mut h = harness(ActionWeights::chatty(), RecordingTransport::new(0, &[1, 2]));
        for i in 0..200u64 {
            if i % 3 == 0 {
                h.queue.push(incoming(1 + (i % 2) as u32, i * 2));
            }
            h.engine.step().await;
        }

        let records = h.sink.records();
        assert_eq!(records.len(), 200);
        for pair in records.windows(2) {
            assert!(pair[1].logical_clock > pair[0].logical_clock);
            assert_eq!(pair[1].tick, pair[0].tick + 1);
        }
    }

    #[tokio::test]
    async fn test_run_stops_after_duration() {
        let h = harness(ActionWeights::standard(), RecordingTransport::new(0, &[1, 2]));
        let network = Arc::clone(&h.network);
        let engine = h.engine.with_run_duration(Some(Duration::from_millis(200)));

        let report = engine.run(CancellationToken::new()).await;

        // 100 ticks/s for 200ms
        assert!(report.ticks >= 10 && report.ticks <= 25, "ticks = {}", report.ticks);
        assert_eq!(report.counts.total(), report.ticks);
        assert!(network.closed.load(Ordering::SeqCst));
        assert_eq!(h.sink.records().len() as u64, report.ticks);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = harness(ActionWeights::standard(), RecordingTransport::new(0, &[1]));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(h.engine.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        let report = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("engine did not stop promptly")
            .unwrap();
        assert!(report.ticks >= 1);
    }

    #[tokio::test]
    async fn test_overrunning_ticks_are_skipped_not_replayed() {
        // 10ms period, every tick spends 35ms in send
        let transport = RecordingTransport::new(0, &[1]).slow(Duration::from_millis(35));
        let h = harness(ActionWeights::send_only(), transport);
        let period = h.engine.period();
        let engine = h.engine.with_run_duration(Some(Duration::from_millis(300)));

        let started = std::time::Instant::now();
        let report = engine.run(CancellationToken::new()).await;
        let elapsed = started.elapsed();

        assert!(report.skipped_ticks > 0, "report = {:?}", report);
        assert!(report.ticks <= 10, "ticks = {}", report.ticks);
        assert!(report.ticks as u128 <= elapsed.as_nanos() / period.as_nanos() + 1);
        assert_eq!(h.sink.records().len() as u64, report.ticks);

        // Ticks never overlap: each record's send finished before the next began
        let records = h.sink.records();
        for pair in records.windows(2) {
            let gap = pair[1].timestamp - pair[0].timestamp;
            assert!(gap >= chrono::Duration::milliseconds(30), "gap = {}", gap);
        }
    }

    #[tokio::test]
    async fn test_unusable_rate_is_rejected() {
        let network = Arc::new(RecordingTransport::new(0, &[1]));
        let actions = ActionTable::new(ActionWeights::standard(), &network.neighbors()).unwrap();
        let result = PeerEngine::new(
            Arc::new(TokioContext::new()),
            network,
            Arc::new(InboundQueue::new()),
            Arc::new(EventLog::new(PeerId::new(0))),
            actions,
            1e12,
        );
        assert!(matches!(result, Err(ConfigError::InvalidSpeed(_))));
    }

    #[tokio::test]
    async fn test_terminated_engine_ignores_ticks() {
        let mut h = harness(ActionWeights::silent(), RecordingTransport::new(0, &[1]));
        h.engine.step().await;

        let report = h.engine.terminate().await;
        assert_eq!(report.final_clock, 1);
        assert_eq!(h.engine.state(), PeerState::Terminated);
        assert_eq!(h.engine.step().await, TickOutcome::Terminated);
        assert_eq!(h.engine.clock(), 1);
    }
}
