//! TCP peer links.
//!
//! Every peer listens on its topology address and dials each neighbor
//! once. A connection carries traffic in one direction only: the dialer
//! writes, the acceptor reads. The listener accepts every inbound
//! connection for the life of the peer, and each accepted connection gets
//! its own reader task feeding the shared [`InboundQueue`].
//!
//! Nothing here is fatal after bind. Malformed frames, resets and dial
//! failures are recorded as diagnostics and the link keeps going.

use crate::codec::{decode, DELIMITER};
use crate::config::{LinkConfig, Topology};
use crate::error::{ConfigError, ErrorKind, LinkError, PeerError};
use crate::log::EventLog;
use crate::queue::InboundQueue;

use async_trait::async_trait;
use lamport_env::{EnvError, NetworkTransport, PeerId};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What one inbound connection delivered before it closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadSummary {
    /// Frames decoded and queued
    pub delivered: u64,

    /// Frames discarded as framing or schema errors
    pub rejected: u64,

    /// Sender named by the first good frame, or the caller's hint
    pub neighbor: Option<PeerId>,

    /// The stream ended cleanly rather than by error or shutdown
    pub eof: bool,
}

/// Outbound writer for one neighbor. `None` until connected.
type WriterSlot = Mutex<Option<TcpStream>>;

/// A peer's TCP endpoint: one listener plus one writer per neighbor.
pub struct TcpLink {
    local: PeerId,
    local_addr: SocketAddr,
    topology: Topology,
    config: LinkConfig,
    log: Arc<EventLog>,
    writers: HashMap<PeerId, WriterSlot>,
    unreachable: std::sync::Mutex<BTreeSet<PeerId>>,
    accepted: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl TcpLink {
    /// Binds the local topology address and starts accepting.
    pub async fn bind(
        local: PeerId,
        topology: Topology,
        config: LinkConfig,
        queue: Arc<InboundQueue>,
        log: Arc<EventLog>,
    ) -> Result<Arc<Self>, PeerError> {
        let addr = topology
            .address(local)
            .ok_or(ConfigError::UnknownPeer(local))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| LinkError::Bind { addr, source })?;
        Ok(Self::from_listener(local, listener, topology, config, queue, log)?)
    }

    /// Wraps an already bound listener and starts accepting.
    pub fn from_listener(
        local: PeerId,
        listener: TcpListener,
        topology: Topology,
        config: LinkConfig,
        queue: Arc<InboundQueue>,
        log: Arc<EventLog>,
    ) -> Result<Arc<Self>, LinkError> {
        let local_addr = listener.local_addr()?;
        let writers = topology
            .neighbors_of(local)
            .into_iter()
            .map(|peer| (peer, Mutex::new(None)))
            .collect();

        let link = Arc::new(Self {
            local,
            local_addr,
            topology,
            config,
            log,
            writers,
            unreachable: std::sync::Mutex::new(BTreeSet::new()),
            accepted: Arc::new(AtomicU64::new(0)),
            shutdown: CancellationToken::new(),
        });

        info!(peer = %local, addr = %local_addr, "Listening for neighbors");
        tokio::spawn(accept_loop(
            listener,
            queue,
            Arc::clone(&link.log),
            config.max_frame_bytes,
            Arc::clone(&link.accepted),
            link.shutdown.clone(),
        ));

        Ok(link)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Inbound connections accepted so far.
    pub fn accepted_connections(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// True when an outbound connection to `peer` is open.
    pub async fn is_connected(&self, peer: PeerId) -> bool {
        match self.writers.get(&peer) {
            Some(slot) => slot.lock().await.is_some(),
            None => false,
        }
    }

    /// Dials every neighbor concurrently with bounded retries.
    ///
    /// Returns the neighbors given up on; they are also recorded as
    /// connection diagnostics and reported by [`NetworkTransport::unreachable`].
    pub async fn connect_all(self: &Arc<Self>) -> Vec<PeerId> {
        let mut dials = JoinSet::new();
        for peer in self.writers.keys().copied() {
            let link = Arc::clone(self);
            dials.spawn(async move { (peer, link.connect(peer).await) });
        }

        let mut given_up = Vec::new();
        while let Some(joined) = dials.join_next().await {
            if let Ok((peer, Err(LinkError::RetriesExhausted { .. }))) = joined {
                given_up.push(peer);
            }
        }
        given_up.sort();
        given_up
    }

    /// Dials `peer` with the configured attempt budget.
    pub async fn connect(&self, peer: PeerId) -> Result<(), LinkError> {
        let slot = self.writers.get(&peer).ok_or(LinkError::RetriesExhausted {
            peer,
            attempts: 0,
        })?;

        match self.dial(peer, self.config.connect_attempts).await {
            Ok(stream) => {
                let mut writer = slot.lock().await;
                if writer.is_none() {
                    *writer = Some(stream);
                }
                self.mark_reachable(peer);
                info!(peer = %self.local, neighbor = %peer, "Connected to neighbor");
                Ok(())
            }
            Err(e @ LinkError::RetriesExhausted { .. }) => {
                self.mark_unreachable(peer);
                self.log.report(ErrorKind::Connection, Some(peer), e.to_string());
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn dial(&self, peer: PeerId, attempts: u32) -> Result<TcpStream, LinkError> {
        let addr = self
            .topology
            .address(peer)
            .ok_or(LinkError::RetriesExhausted { peer, attempts: 0 })?;

        for attempt in 1..=attempts {
            if self.shutdown.is_cancelled() {
                return Err(LinkError::Cancelled);
            }

            match timeout(self.config.connect_timeout(), TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    debug!(peer = %self.local, neighbor = %peer, attempt, error = %e, "Dial failed");
                }
                Err(_) => {
                    debug!(peer = %self.local, neighbor = %peer, attempt, "Dial timed out");
                }
            }

            if attempt < attempts {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Err(LinkError::Cancelled),
                    _ = sleep(self.config.backoff(attempt)) => {}
                }
            }
        }

        Err(LinkError::RetriesExhausted { peer, attempts })
    }

    fn mark_reachable(&self, peer: PeerId) {
        self.unreachable
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&peer);
    }

    fn mark_unreachable(&self, peer: PeerId) {
        self.unreachable
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(peer);
    }

    /// Writes one frame, bounded by the write timeout.
    async fn write_frame(&self, stream: &mut TcpStream, frame: &[u8]) -> Result<(), LinkError> {
        match timeout(self.config.write_timeout(), stream.write_all(frame)).await {
            Ok(written) => Ok(written?),
            Err(_) => Err(LinkError::Timeout(self.config.write_timeout_ms)),
        }
    }
}

#[async_trait]
impl NetworkTransport for TcpLink {
    /// Writes `frame` to `target`, reconnecting once if the first write
    /// fails or no connection is open.
    async fn send(&self, target: PeerId, frame: &[u8]) -> Result<(), EnvError> {
        let slot = self
            .writers
            .get(&target)
            .ok_or_else(|| EnvError::UnknownPeer(target.to_string()))?;
        if self.shutdown.is_cancelled() {
            return Err(EnvError::Closed);
        }

        let mut writer = slot.lock().await;
        let mut last_error = LinkError::Cancelled;
        for _ in 0..2 {
            if writer.is_none() {
                match self.dial(target, 1).await {
                    Ok(stream) => {
                        self.mark_reachable(target);
                        *writer = Some(stream);
                    }
                    Err(LinkError::Cancelled) => return Err(EnvError::Closed),
                    Err(_) => return Err(EnvError::unreachable(target)),
                }
            }

            if let Some(stream) = writer.as_mut() {
                match self.write_frame(stream, frame).await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        self.log
                            .report(ErrorKind::Connection, Some(target), format!("write failed: {}", e));
                        last_error = e;
                    }
                }
            }
            // A partial write leaves the stream unframed; start over
            *writer = None;
        }

        Err(last_error.into())
    }

    fn neighbors(&self) -> Vec<PeerId> {
        self.topology.neighbors_of(self.local)
    }

    fn local_id(&self) -> PeerId {
        self.local
    }

    fn unreachable(&self) -> Vec<PeerId> {
        self.unreachable
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .copied()
            .collect()
    }

    async fn shutdown(&self) {
        self.shutdown.cancel();
        for slot in self.writers.values() {
            if let Some(mut stream) = slot.lock().await.take() {
                let _ = stream.shutdown().await;
            }
        }
        debug!(peer = %self.local, "Link shut down");
    }
}

async fn accept_loop(
    listener: TcpListener,
    queue: Arc<InboundQueue>,
    log: Arc<EventLog>,
    max_frame_bytes: usize,
    accepted: Arc<AtomicU64>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = listener.accept() => match result {
                Ok((stream, remote)) => {
                    accepted.fetch_add(1, Ordering::Relaxed);
                    debug!(peer = %log.peer(), remote = %remote, "Accepted connection");

                    let queue = Arc::clone(&queue);
                    let log = Arc::clone(&log);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        let summary =
                            read_frames(stream, &queue, &log, None, max_frame_bytes, &shutdown).await;
                        if summary.eof {
                            log.report(ErrorKind::Connection, summary.neighbor, "connection closed by remote");
                        }
                        debug!(
                            peer = %log.peer(),
                            remote = %remote,
                            delivered = summary.delivered,
                            rejected = summary.rejected,
                            "Connection reader finished"
                        );
                    });
                }
                Err(e) => {
                    log.report(ErrorKind::Connection, None, format!("accept failed: {}", e));
                    sleep(std::time::Duration::from_millis(10)).await;
                }
            }
        }
    }
}

/// Reads newline-delimited frames from `reader` into `queue` until EOF,
/// an I/O error, or `shutdown`.
///
/// `sender` names the neighbor in diagnostics until a good frame
/// identifies it. Blank lines are skipped. A trailing fragment without a
/// newline is a truncated frame. Frames longer than `max_frame_bytes` are
/// discarded through their terminating newline. Each rejected frame is
/// logged as a framing or schema diagnostic and never reaches the queue.
pub async fn read_frames<R>(
    reader: R,
    queue: &InboundQueue,
    log: &EventLog,
    sender: Option<PeerId>,
    max_frame_bytes: usize,
    shutdown: &CancellationToken,
) -> ReadSummary
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut summary = ReadSummary::default();
    let mut frame = Vec::new();
    let mut neighbor = sender;
    let mut discarding = false;
    let limit = max_frame_bytes as u64 + 1;

    loop {
        frame.clear();
        let mut bounded = (&mut reader).take(limit);
        let read = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = bounded.read_until(DELIMITER, &mut frame) => read,
        };

        match read {
            Ok(0) => {
                summary.eof = true;
                break;
            }
            Ok(_) => {
                let terminated = frame.last() == Some(&DELIMITER);

                if discarding {
                    discarding = !terminated;
                    continue;
                }
                if !terminated && frame.len() > max_frame_bytes {
                    summary.rejected += 1;
                    discarding = true;
                    log.report(
                        ErrorKind::Framing,
                        neighbor,
                        format!("frame exceeds {} bytes; discarded", max_frame_bytes),
                    );
                    continue;
                }
                if !terminated {
                    summary.rejected += 1;
                    log.report(
                        ErrorKind::Framing,
                        neighbor,
                        format!("truncated frame of {} bytes at end of stream", frame.len()),
                    );
                    continue;
                }
                if frame.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }

                match decode(&frame) {
                    Ok(message) => {
                        neighbor.get_or_insert(message.sender_id);
                        queue.push(message);
                        summary.delivered += 1;
                    }
                    Err(e) => {
                        summary.rejected += 1;
                        log.report(
                            e.kind(),
                            neighbor,
                            format!("{}; discarded {} bytes", e, frame.len()),
                        );
                    }
                }
            }
            Err(e) => {
                warn!(peer = %log.peer(), neighbor = ?neighbor, error = %e, "Connection read failed");
                log.report(ErrorKind::Connection, neighbor, format!("read failed: {}", e));
                break;
            }
        }
    }

    summary.neighbor = neighbor;
    summary
}
