//! Simulated network transport with fault injection.
//!
//! Every [`SimNetwork`] hands its frames to a shared [`SimRouter`], which
//! runs them through the same [`read_frames`] path a TCP connection uses
//! and pushes decoded messages straight into the receiver's queue.
//! Delivery is instantaneous and per-link FIFO.

use async_trait::async_trait;
use lamport_core::{read_frames, EventLog, InboundQueue, LinkConfig};
use lamport_env::{EnvError, NetworkTransport, PeerId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Traffic counters for one directed link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStats {
    /// Frames written by the sender
    pub sent: u64,

    /// Messages pushed into the receiver's queue
    pub delivered: u64,

    /// Frames written but never read (deaf link)
    pub undelivered: u64,

    /// Frames refused because of a partition
    pub dropped: u64,

    /// Frames the receiver discarded as malformed
    pub rejected: u64,
}

/// Network controller for fault injection.
#[derive(Default)]
pub struct SimNetworkController {
    /// Active partitions (peers that cannot communicate)
    partitions: Mutex<Vec<(Vec<PeerId>, Vec<PeerId>)>>,

    /// `(receiver, sender)` pairs the receiver never reads from
    deaf: Mutex<HashSet<(PeerId, PeerId)>>,
}

impl SimNetworkController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a network partition between two groups.
    pub fn partition(&self, group_a: Vec<PeerId>, group_b: Vec<PeerId>) {
        lock(&self.partitions).push((group_a, group_b));
    }

    /// Stops `receiver` from reading anything `sender` writes.
    ///
    /// The sender's writes still succeed; the bytes pile up unread.
    pub fn deafen(&self, receiver: PeerId, sender: PeerId) {
        lock(&self.deaf).insert((receiver, sender));
    }

    /// Heals all partitions and deaf links.
    pub fn heal_all(&self) {
        lock(&self.partitions).clear();
        lock(&self.deaf).clear();
    }

    /// Checks if two peers can communicate (not partitioned).
    pub fn can_communicate(&self, from: PeerId, to: PeerId) -> bool {
        let partitions = lock(&self.partitions);

        for (group_a, group_b) in partitions.iter() {
            let from_in_a = group_a.contains(&from);
            let from_in_b = group_b.contains(&from);
            let to_in_a = group_a.contains(&to);
            let to_in_b = group_b.contains(&to);

            if (from_in_a && to_in_b) || (from_in_b && to_in_a) {
                return false;
            }
        }

        true
    }

    pub fn is_listening(&self, receiver: PeerId, sender: PeerId) -> bool {
        !lock(&self.deaf).contains(&(receiver, sender))
    }
}

/// Receiving side of one simulated peer.
struct Endpoint {
    queue: Arc<InboundQueue>,
    log: Arc<EventLog>,
}

/// Central switch shared by every simulated peer.
pub struct SimRouter {
    endpoints: HashMap<PeerId, Endpoint>,
    controller: Arc<SimNetworkController>,
    stats: Mutex<BTreeMap<(PeerId, PeerId), LinkStats>>,
    max_frame_bytes: usize,
    closed: CancellationToken,
}

impl SimRouter {
    pub fn new(controller: Arc<SimNetworkController>) -> Self {
        Self {
            endpoints: HashMap::new(),
            controller,
            stats: Mutex::new(BTreeMap::new()),
            max_frame_bytes: LinkConfig::default().max_frame_bytes,
            closed: CancellationToken::new(),
        }
    }

    /// Frame size cap applied on every receiver, as on a TCP link.
    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    /// Registers a receiving peer.
    pub fn attach(&mut self, peer: PeerId, queue: Arc<InboundQueue>, log: Arc<EventLog>) {
        self.endpoints.insert(peer, Endpoint { queue, log });
    }

    pub fn controller(&self) -> &Arc<SimNetworkController> {
        &self.controller
    }

    /// Routes one write from `from` to `to`.
    pub async fn deliver(&self, from: PeerId, to: PeerId, frame: &[u8]) -> Result<(), EnvError> {
        let endpoint = self
            .endpoints
            .get(&to)
            .ok_or_else(|| EnvError::UnknownPeer(to.to_string()))?;

        if !self.controller.can_communicate(from, to) {
            self.with_stats(from, to, |s| s.dropped += 1);
            return Err(EnvError::unreachable(to));
        }

        self.with_stats(from, to, |s| s.sent += 1);
        if !self.controller.is_listening(to, from) {
            self.with_stats(from, to, |s| s.undelivered += 1);
            return Ok(());
        }

        let (delivered, rejected) = self.ingest(endpoint, Some(from), frame).await;
        self.with_stats(from, to, |s| {
            s.delivered += delivered;
            s.rejected += rejected;
        });
        Ok(())
    }

    /// Feeds arbitrary bytes through `to`'s framing path, as if they had
    /// arrived on an anonymous connection. Returns `(delivered, rejected)`.
    pub async fn inject_raw(&self, to: PeerId, bytes: &[u8]) -> Result<(u64, u64), EnvError> {
        let endpoint = self
            .endpoints
            .get(&to)
            .ok_or_else(|| EnvError::UnknownPeer(to.to_string()))?;
        Ok(self.ingest(endpoint, None, bytes).await)
    }

    /// Reads `bytes` as one complete inbound stream.
    async fn ingest(&self, endpoint: &Endpoint, from: Option<PeerId>, bytes: &[u8]) -> (u64, u64) {
        let summary = read_frames(
            bytes,
            &endpoint.queue,
            &endpoint.log,
            from,
            self.max_frame_bytes,
            &self.closed,
        )
        .await;
        (summary.delivered, summary.rejected)
    }

    pub fn link_stats(&self, from: PeerId, to: PeerId) -> LinkStats {
        lock(&self.stats).get(&(from, to)).copied().unwrap_or_default()
    }

    /// Every link that carried traffic.
    pub fn all_stats(&self) -> BTreeMap<(PeerId, PeerId), LinkStats> {
        lock(&self.stats).clone()
    }

    /// Sum over every link.
    pub fn totals(&self) -> LinkStats {
        lock(&self.stats)
            .values()
            .fold(LinkStats::default(), |mut acc, s| {
                acc.sent += s.sent;
                acc.delivered += s.delivered;
                acc.undelivered += s.undelivered;
                acc.dropped += s.dropped;
                acc.rejected += s.rejected;
                acc
            })
    }

    fn with_stats(&self, from: PeerId, to: PeerId, update: impl FnOnce(&mut LinkStats)) {
        update(lock(&self.stats).entry((from, to)).or_default());
    }
}

/// Simulated network interface for one peer.
pub struct SimNetwork {
    local_id: PeerId,
    neighbors: Vec<PeerId>,
    router: Arc<SimRouter>,
}

impl SimNetwork {
    pub fn new(local_id: PeerId, neighbors: Vec<PeerId>, router: Arc<SimRouter>) -> Self {
        Self {
            local_id,
            neighbors,
            router,
        }
    }
}

#[async_trait]
impl NetworkTransport for SimNetwork {
    async fn send(&self, target: PeerId, frame: &[u8]) -> Result<(), EnvError> {
        if !self.neighbors.contains(&target) {
            return Err(EnvError::UnknownPeer(target.to_string()));
        }
        self.router.deliver(self.local_id, target, frame).await
    }

    fn neighbors(&self) -> Vec<PeerId> {
        self.neighbors.clone()
    }

    fn local_id(&self) -> PeerId {
        self.local_id
    }

    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lamport_core::{encode, ErrorKind, MemorySink, Message};

    fn peer(n: u32) -> PeerId {
        PeerId::new(n)
    }

    fn frame(sender: u32, clock: u64) -> Vec<u8> {
        encode(&Message::new(peer(sender), clock, Utc::now()))
    }

    struct Net {
        router: Arc<SimRouter>,
        queues: Vec<Arc<InboundQueue>>,
        sinks: Vec<MemorySink>,
    }

    fn net(count: u32) -> Net {
        let controller = Arc::new(SimNetworkController::new());
        let mut router = SimRouter::new(controller);
        let mut queues = Vec::new();
        let mut sinks = Vec::new();
        for n in 0..count {
            let queue = Arc::new(InboundQueue::new());
            let sink = MemorySink::new();
            let log = Arc::new(EventLog::new(peer(n)).with_sink(Arc::new(sink.clone())));
            router.attach(peer(n), Arc::clone(&queue), log);
            queues.push(queue);
            sinks.push(sink);
        }
        Net {
            router: Arc::new(router),
            queues,
            sinks,
        }
    }

    #[test]
    fn test_network_controller_partition() {
        let controller = SimNetworkController::new();
        let (a, b, c) = (peer(1), peer(2), peer(3));

        assert!(controller.can_communicate(a, b));
        controller.partition(vec![a], vec![b, c]);
        assert!(!controller.can_communicate(a, b));
        assert!(!controller.can_communicate(c, a));
        assert!(controller.can_communicate(b, c));

        controller.heal_all();
        assert!(controller.can_communicate(a, b));
    }

    #[test]
    fn test_deaf_link_is_one_directional() {
        let controller = SimNetworkController::new();
        controller.deafen(peer(2), peer(0));
        assert!(!controller.is_listening(peer(2), peer(0)));
        assert!(controller.is_listening(peer(0), peer(2)));
        assert!(controller.is_listening(peer(2), peer(1)));
    }

    #[tokio::test]
    async fn test_deliver_decodes_into_queue() {
        let net = net(2);
        net.router.deliver(peer(0), peer(1), &frame(0, 5)).await.unwrap();

        let message = net.queues[1].try_pop_front().unwrap();
        assert_eq!(message.sender_id, peer(0));
        assert_eq!(message.logical_clock, 5);
        assert_eq!(net.router.link_stats(peer(0), peer(1)).delivered, 1);
    }

    #[tokio::test]
    async fn test_deaf_link_accumulates_undelivered() {
        let net = net(2);
        net.router.controller().deafen(peer(1), peer(0));

        for clock in 1..=4 {
            net.router.deliver(peer(0), peer(1), &frame(0, clock)).await.unwrap();
        }
        assert!(net.queues[1].is_empty());
        let stats = net.router.link_stats(peer(0), peer(1));
        assert_eq!(stats.sent, 4);
        assert_eq!(stats.undelivered, 4);
    }

    #[tokio::test]
    async fn test_partition_refuses_writes() {
        let net = net(2);
        net.router.controller().partition(vec![peer(0)], vec![peer(1)]);
        let result = net.router.deliver(peer(0), peer(1), &frame(0, 1)).await;
        assert!(matches!(result, Err(EnvError::NodeUnreachable(_))));
        assert_eq!(net.router.link_stats(peer(0), peer(1)).dropped, 1);
    }

    #[tokio::test]
    async fn test_inject_raw_reports_and_keeps_queue() {
        let net = net(2);
        let (delivered, rejected) = net
            .router
            .inject_raw(peer(1), b"\xff\xfe\n{\"sender_id\":\"x\"}\n")
            .await
            .unwrap();
        assert_eq!((delivered, rejected), (0, 2));
        assert!(net.queues[1].is_empty());

        let kinds: Vec<_> = net.sinks[1].diagnostics().iter().map(|d| d.kind).collect();
        assert_eq!(kinds, vec![ErrorKind::Framing, ErrorKind::Schema]);
    }

    #[tokio::test]
    async fn test_inject_raw_shares_tcp_framing_rules() {
        let controller = Arc::new(SimNetworkController::new());
        let mut router = SimRouter::new(controller).with_max_frame_bytes(256);
        let queue = Arc::new(InboundQueue::new());
        let sink = MemorySink::new();
        let log = Arc::new(EventLog::new(peer(1)).with_sink(Arc::new(sink.clone())));
        router.attach(peer(1), Arc::clone(&queue), log);

        let mut bytes = vec![b'x'; 1000];
        bytes.push(b'\n');
        bytes.extend(frame(0, 3));
        bytes.extend(b"{\"sender_id\":0");
        let result = router.inject_raw(peer(1), &bytes).await.unwrap();

        // Oversized line and unterminated tail are both rejected
        assert_eq!(result, (1, 2));
        assert_eq!(queue.len(), 1);
        let details: Vec<_> = sink.diagnostics().into_iter().map(|d| d.detail).collect();
        assert!(details[0].contains("exceeds 256 bytes"));
        assert!(details[1].contains("truncated frame"));
        assert!(sink.diagnostics().iter().all(|d| d.kind == ErrorKind::Framing));
    }
}
