//! Peer Summary Metrics
//! ====================
//!
//! Read-only analysis over a peer's event records:
//! - **Event mix**: how often each action kind occurred
//! - **Drift**: how far the logical clock ran ahead of real time
//! - **Backlog**: how the inbound queue evolved over the run
//! - **Receive jump**: the largest clock advance caused by one message
//!
//! Records are expected in log order for a single peer.

use crate::log::{EventKind, EventRecord};
use crate::peer::EventCounts;
use lamport_env::PeerId;
use serde::{Deserialize, Serialize};

/// Aggregate view of one peer's run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub peer: Option<PeerId>,

    pub counts: EventCounts,

    /// Clock value of the last record
    pub final_clock: u64,

    /// Largest backlog seen by any tick
    pub max_queue_len: usize,

    /// Backlog of the first record
    pub first_queue_len: usize,

    /// Backlog of the last record
    pub final_queue_len: usize,

    pub max_drift: f64,
    pub final_drift: f64,

    /// Largest clock advance on a single receive
    pub largest_receive_jump: u64,

    /// Real seconds covered by the records
    pub elapsed_secs: f64,

    /// Queue length of every record, in order
    #[serde(skip)]
    queue_series: Vec<usize>,
}

impl PeerSummary {
    pub fn from_records(records: &[EventRecord]) -> Self {
        let mut summary = Self::default();
        let mut previous_clock = 0u64;

        for record in records {
            summary.peer.get_or_insert(record.peer);
            match record.kind {
                EventKind::Internal => summary.counts.internal += 1,
                EventKind::Send => summary.counts.send += 1,
                EventKind::Receive => {
                    summary.counts.receive += 1;
                    let jump = record.logical_clock.saturating_sub(previous_clock);
                    summary.largest_receive_jump = summary.largest_receive_jump.max(jump);
                }
            }
            previous_clock = record.logical_clock;

            summary.max_queue_len = summary.max_queue_len.max(record.queue_len);
            summary.max_drift = if summary.queue_series.is_empty() {
                record.drift
            } else {
                summary.max_drift.max(record.drift)
            };
            summary.queue_series.push(record.queue_len);
        }

        if let (Some(first), Some(last)) = (records.first(), records.last()) {
            summary.first_queue_len = first.queue_len;
            summary.final_queue_len = last.queue_len;
            summary.final_clock = last.logical_clock;
            summary.final_drift = last.drift;
            summary.elapsed_secs = last.elapsed_secs;
        }
        summary
    }

    /// Final minus first observed backlog.
    pub fn queue_growth(&self) -> i64 {
        self.final_queue_len as i64 - self.first_queue_len as i64
    }

    /// True when the backlog never shrank by more than `tolerance` below
    /// its running maximum.
    ///
    /// A steadily overloaded receiver still drains one message per tick,
    /// so its backlog wobbles; `tolerance` absorbs that wobble.
    pub fn queue_trend_non_decreasing(&self, tolerance: usize) -> bool {
        let mut high_water = 0usize;
        for len in &self.queue_series {
            if len + tolerance < high_water {
                return false;
            }
            high_water = high_water.max(*len);
        }
        true
    }

    /// Fraction of records of `kind`.
    pub fn share(&self, kind: EventKind) -> f64 {
        let total = self.counts.total();
        if total == 0 {
            return 0.0;
        }
        let hits = match kind {
            EventKind::Internal => self.counts.internal,
            EventKind::Send => self.counts.send,
            EventKind::Receive => self.counts.receive,
        };
        hits as f64 / total as f64
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::Utc;

    fn rec(kind: EventKind, clock: u64, queue_len: usize, elapsed: f64) -> EventRecord {
        EventRecord {
            timestamp: Utc::now(),
            peer: PeerId::new(1),
            kind,
            logical_clock: clock,
            queue_len,
            elapsed_secs: elapsed,
            drift: clock as f64 - elapsed,
            tick: clock,
            targets: Vec::new(),
            sender: None,
        }
    }

    #[test]
    fn test_empty_records() {
        let summary = PeerSummary::from_records(&[]);
        assert_eq!(summary.peer, None);
        assert_eq!(summary.counts.total(), 0);
        assert_eq!(summary.queue_growth(), 0);
        assert!(summary.queue_trend_non_decreasing(0));
        assert_eq!(summary.share(EventKind::Send), 0.0);
    }

    #[test]
    fn test_counts_and_jumps() {
        let records = vec![
            rec(EventKind::Internal, 1, 0, 0.5),
            rec(EventKind::Receive, 9, 1, 1.0),
            rec(EventKind::Send, 10, 0, 1.5),
            rec(EventKind::Receive, 12, 0, 2.0),
        ];
        let summary = PeerSummary::from_records(&records);

        assert_eq!(summary.peer, Some(PeerId::new(1)));
        assert_eq!(summary.counts, EventCounts { internal: 1, send: 1, receive: 2 });
        assert_eq!(summary.final_clock, 12);
        assert_eq!(summary.largest_receive_jump, 8);
        assert_eq!(summary.max_queue_len, 1);
        assert_relative_eq!(summary.max_drift, 10.0);
        assert_relative_eq!(summary.final_drift, 10.0);
        assert_relative_eq!(summary.share(EventKind::Receive), 0.5);
    }

    #[test]
    fn test_negative_drift_is_kept() {
        let records = vec![rec(EventKind::Internal, 1, 0, 3.0), rec(EventKind::Internal, 2, 0, 5.0)];
        let summary = PeerSummary::from_records(&records);
        assert_relative_eq!(summary.max_drift, -2.0);
        assert_relative_eq!(summary.final_drift, -3.0);
    }

    #[test]
    fn test_queue_trend() {
        let growing: Vec<_> = [0, 1, 2, 1, 3, 4, 3, 5]
            .iter()
            .enumerate()
            .map(|(i, len)| rec(EventKind::Receive, i as u64 + 1, *len, i as f64))
            .collect();
        let summary = PeerSummary::from_records(&growing);
        assert_eq!(summary.queue_growth(), 5);
        assert!(summary.queue_trend_non_decreasing(1));
        assert!(!summary.queue_trend_non_decreasing(0));

        let drained: Vec<_> = [4, 3, 2, 1, 0]
            .iter()
            .enumerate()
            .map(|(i, len)| rec(EventKind::Receive, i as u64 + 1, *len, i as f64))
            .collect();
        let summary = PeerSummary::from_records(&drained);
        assert_eq!(summary.queue_growth(), -4);
        assert!(!summary.queue_trend_non_decreasing(1));
    }
}
