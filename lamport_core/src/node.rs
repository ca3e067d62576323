//! Peer startup and control.
//!
//! [`PeerNode::start`] wires a validated [`PeerConfig`] into a running peer:
//! event log, inbound queue, TCP link and engine. The returned
//! [`PeerHandle`] is the only control surface.

use crate::config::PeerConfig;
use crate::error::{LinkError, PeerError};
use crate::link::TcpLink;
use crate::log::{EventLog, EventSink};
use crate::peer::{PeerEngine, PeerReport};
use crate::queue::InboundQueue;

use chrono::{DateTime, Utc};
use lamport_env::{PeerContext, PeerId, TokioContext};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, Instrument};

/// RNG stream reserved for the startup speed draw.
const SPEED_STREAM: u64 = u64::MAX;

/// Starts peers.
pub struct PeerNode;

impl PeerNode {
    /// Validates `config`, binds its listen address and starts ticking.
    ///
    /// Neighbors are dialed in the background; the engine does not wait
    /// for them.
    pub async fn start(
        config: PeerConfig,
        sinks: Vec<Arc<dyn EventSink>>,
    ) -> Result<PeerHandle, PeerError> {
        config.validate()?;
        let addr = config.listen_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| LinkError::Bind { addr, source })?;
        Self::start_with_listener(config, listener, sinks)
    }

    /// Like [`PeerNode::start`], on a listener the caller already bound.
    pub fn start_with_listener(
        config: PeerConfig,
        listener: TcpListener,
        sinks: Vec<Arc<dyn EventSink>>,
    ) -> Result<PeerHandle, PeerError> {
        let actions = config.validate()?;

        let context = Arc::new(match config.seed {
            Some(seed) => TokioContext::seeded(seed),
            None => TokioContext::new(),
        });
        let ticks_per_sec = config.speed.draw(&mut context.rng(SPEED_STREAM));

        let run_duration = config.run_duration()?;

        let queue = Arc::new(InboundQueue::new());
        let clock = Arc::clone(&context);
        let log = Arc::new(
            EventLog::new(config.id)
                .with_sinks(sinks)
                .with_clock(move || DateTime::<Utc>::from(clock.system_time())),
        );
        let link = TcpLink::from_listener(
            config.id,
            listener,
            config.topology.clone(),
            config.link,
            Arc::clone(&queue),
            Arc::clone(&log),
        )?;
        let local_addr = link.local_addr();

        info!(
            peer = %config.id,
            addr = %local_addr,
            ticks_per_sec,
            seed = context.seed(),
            neighbors = config.neighbors().len(),
            "Starting peer"
        );

        let connector = Arc::clone(&link);
        context.spawn(
            "connect",
            async move {
                let unreachable = connector.connect_all().await;
                if !unreachable.is_empty() {
                    info!(unreachable = ?unreachable, "Continuing without some neighbors");
                }
            }
            .instrument(tracing::info_span!("connect", peer = %config.id)),
        );

        let engine = PeerEngine::new(
            Arc::clone(&context),
            Arc::clone(&link),
            Arc::clone(&queue),
            log,
            actions,
            ticks_per_sec,
        )?
        .with_run_duration(run_duration);

        let shutdown = CancellationToken::new();
        let task = context.spawn("engine", engine.run(shutdown.clone()));

        Ok(PeerHandle {
            id: config.id,
            local_addr,
            ticks_per_sec,
            queue,
            shutdown,
            task,
        })
    }
}

/// A running peer.
pub struct PeerHandle {
    id: PeerId,
    local_addr: SocketAddr,
    ticks_per_sec: f64,
    queue: Arc<InboundQueue>,
    shutdown: CancellationToken,
    task: JoinHandle<PeerReport>,
}

impl PeerHandle {
    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Rate drawn at startup.
    pub fn ticks_per_sec(&self) -> f64 {
        self.ticks_per_sec
    }

    /// The peer's inbound queue, for observation.
    pub fn queue(&self) -> &Arc<InboundQueue> {
        &self.queue
    }

    /// Asks the engine to stop after its current tick.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Token that stops this peer when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the engine to finish and returns its report.
    pub async fn join(self) -> Result<PeerReport, PeerError> {
        self.task.await.map_err(|e| PeerError::Task(e.to_string()))
    }
}
