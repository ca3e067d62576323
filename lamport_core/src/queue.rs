//! Inbound message queue.
//!
//! Multi-producer (one reader per neighbor connection), single-consumer
//! (the owning peer's engine). Lock-free, unbounded, FIFO by arrival.

use crate::codec::Message;
use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicU64, Ordering};

/// Received-but-unprocessed messages for one peer.
#[derive(Debug, Default)]
pub struct InboundQueue {
    messages: SegQueue<Message>,
    pushed: AtomicU64,
}

impl InboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends to the tail. Safe to call from any reader task.
    pub fn push(&self, message: Message) {
        self.messages.push(message);
        self.pushed.fetch_add(1, Ordering::Relaxed);
    }

    /// Removes and returns the oldest message, never blocking.
    pub fn try_pop_front(&self) -> Option<Message> {
        self.messages.pop()
    }

    /// Backlog snapshot.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Messages ever delivered into this queue.
    pub fn total_pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lamport_env::PeerId;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn msg(sender: u32, clock: u64) -> Message {
        Message::new(PeerId::new(sender), clock, Utc::now())
    }

    #[test]
    fn test_fifo_order() {
        let queue = InboundQueue::new();
        assert!(queue.try_pop_front().is_none());

        queue.push(msg(1, 5));
        queue.push(msg(2, 3));
        queue.push(msg(1, 6));
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.try_pop_front().unwrap().logical_clock, 5);
        assert_eq!(queue.try_pop_front().unwrap().logical_clock, 3);
        assert_eq!(queue.try_pop_front().unwrap().logical_clock, 6);
        assert!(queue.is_empty());
        assert_eq!(queue.total_pushed(), 3);
    }

    #[test]
    fn test_concurrent_producers_lose_nothing() {
        let queue = Arc::new(InboundQueue::new());
        let producers: Vec<_> = (0..4u32)
            .map(|sender| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for clock in 0..1_000u64 {
                        queue.push(msg(sender, clock));
                    }
                })
            })
            .collect();
        for handle in producers {
            handle.join().unwrap();
        }

        assert_eq!(queue.len(), 4_000);

        // Per-sender order is preserved and nothing is duplicated
        let mut last = [None::<u64>; 4];
        let mut seen = HashSet::new();
        while let Some(m) = queue.try_pop_front() {
            let slot = &mut last[m.sender_id.as_u32() as usize];
            if let Some(prev) = *slot {
                assert!(m.logical_clock > prev);
            }
            *slot = Some(m.logical_clock);
            assert!(seen.insert((m.sender_id, m.logical_clock)));
        }
        assert_eq!(seen.len(), 4_000);
    }
}
