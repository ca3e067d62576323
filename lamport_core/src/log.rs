//! Append-only event log.
//!
//! Every peer action produces one [`EventRecord`]; every contained error
//! produces one [`Diagnostic`]. Both are traced and fanned out to the
//! configured [`EventSink`]s. Sinks are the only persistence surface: the
//! analysis side reads them as the source of truth for drift, backlog and
//! event-mix studies.

use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use lamport_env::PeerId;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, warn};

/// Kind of action a peer took on a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Internal,
    Send,
    Receive,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Internal => "internal",
            EventKind::Send => "send",
            EventKind::Receive => "receive",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One peer action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Wall-clock time of the action (UTC)
    pub timestamp: DateTime<Utc>,

    pub peer: PeerId,

    pub kind: EventKind,

    /// Clock value after the action
    pub logical_clock: u64,

    /// Inbound backlog when the tick made its decision
    pub queue_len: usize,

    /// Real seconds since the peer started
    pub elapsed_secs: f64,

    /// `logical_clock - elapsed_secs`
    pub drift: f64,

    /// Tick number that produced this record
    pub tick: u64,

    /// Neighbors a send was written to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<PeerId>,

    /// Origin of a received message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<PeerId>,
}

impl std::fmt::Display for EventRecord {
    /// `[send]: 12:00:01.250 7 peer-1,peer-2`
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}]: {} {}",
            self.kind,
            self.timestamp.format("%H:%M:%S%.3f"),
            self.logical_clock
        )?;
        match self.kind {
            EventKind::Send => {
                let targets: Vec<String> = self.targets.iter().map(|t| t.to_string()).collect();
                write!(f, " {}", targets.join(","))
            }
            EventKind::Receive => {
                if let Some(sender) = self.sender {
                    write!(f, " from {}", sender)?;
                }
                write!(f, " queued {}", self.queue_len)
            }
            EventKind::Internal => Ok(()),
        }
    }
}

/// A contained error with enough context for post-run analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub timestamp: DateTime<Utc>,
    pub peer: PeerId,
    pub kind: ErrorKind,

    /// Neighbor the error relates to, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neighbor: Option<PeerId>,

    pub detail: String,
}

/// What a sink stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEntry {
    Event(EventRecord),
    Diagnostic(Diagnostic),
}

/// Destination for log entries.
pub trait EventSink: Send + Sync {
    fn append(&self, entry: &LogEntry);

    fn flush(&self) {}
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory sink. Clones share the same history.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        lock(&self.entries).clone()
    }

    /// Action records in append order.
    pub fn records(&self) -> Vec<EventRecord> {
        lock(&self.entries)
            .iter()
            .filter_map(|e| match e {
                LogEntry::Event(r) => Some(r.clone()),
                LogEntry::Diagnostic(_) => None,
            })
            .collect()
    }

    /// Diagnostics in append order.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        lock(&self.entries)
            .iter()
            .filter_map(|e| match e {
                LogEntry::Diagnostic(d) => Some(d.clone()),
                LogEntry::Event(_) => None,
            })
            .collect()
    }
}

impl EventSink for MemorySink {
    fn append(&self, entry: &LogEntry) {
        lock(&self.entries).push(entry.clone());
    }
}

/// One JSON object per line, tagged with `"type"`.
pub struct JsonLinesSink {
    writer: Mutex<BufWriter<Box<dyn Write + Send>>>,
}

impl JsonLinesSink {
    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Mutex::new(BufWriter::new(Box::new(writer))),
        }
    }

    /// Creates (truncating) a file at `path`.
    pub fn create(path: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self::new(File::create(path)?))
    }
}

impl EventSink for JsonLinesSink {
    fn append(&self, entry: &LogEntry) {
        let mut writer = lock(&self.writer);
        let written = serde_json::to_writer(&mut *writer, entry)
            .map_err(std::io::Error::from)
            .and_then(|_| writer.write_all(b"\n"));
        if let Err(e) = written {
            error!(error = %e, "Failed to append log entry");
        }
    }

    fn flush(&self) {
        if let Err(e) = lock(&self.writer).flush() {
            error!(error = %e, "Failed to flush event log");
        }
    }
}

/// Wall-clock source for diagnostics raised outside the engine.
type TimeSource = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// The log handle shared by a peer's engine and its link readers.
pub struct EventLog {
    peer: PeerId,
    sinks: Vec<Arc<dyn EventSink>>,
    clock: TimeSource,
}

impl EventLog {
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            sinks: Vec::new(),
            clock: Arc::new(Utc::now),
        }
    }

    /// Stamps [`EventLog::report`] diagnostics from `clock` instead of the
    /// system clock. Peers pass their context's `system_time` here so
    /// diagnostics and records share one timeline.
    pub fn with_clock(
        mut self,
        clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static,
    ) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_sinks(mut self, sinks: impl IntoIterator<Item = Arc<dyn EventSink>>) -> Self {
        self.sinks.extend(sinks);
        self
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn record(&self, record: EventRecord) {
        debug!(
            peer = %record.peer,
            kind = %record.kind,
            clock = record.logical_clock,
            queue_len = record.queue_len,
            drift = record.drift,
            "{}",
            record
        );
        self.append(LogEntry::Event(record));
    }

    pub fn diagnostic(&self, diagnostic: Diagnostic) {
        warn!(
            peer = %diagnostic.peer,
            kind = %diagnostic.kind,
            neighbor = ?diagnostic.neighbor,
            "{}",
            diagnostic.detail
        );
        self.append(LogEntry::Diagnostic(diagnostic));
    }

    /// Records a diagnostic stamped with the log's clock.
    pub fn report(&self, kind: ErrorKind, neighbor: Option<PeerId>, detail: impl Into<String>) {
        self.diagnostic(Diagnostic {
            timestamp: self.now(),
            peer: self.peer,
            kind,
            neighbor,
            detail: detail.into(),
        });
    }

    pub fn flush(&self) {
        for sink in &self.sinks {
            sink.flush();
        }
    }

    fn append(&self, entry: LogEntry) {
        for sink in &self.sinks {
            sink.append(&entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: EventKind, clock: u64) -> EventRecord {
        EventRecord {
            timestamp: DateTime::from_timestamp(1_704_067_201, 250_000_000).unwrap(),
            peer: PeerId::new(0),
            kind,
            logical_clock: clock,
            queue_len: 2,
            elapsed_secs: 1.0,
            drift: clock as f64 - 1.0,
            tick: clock,
            targets: Vec::new(),
            sender: None,
        }
    }

    #[test]
    fn test_display_matches_text_log_format() {
        let mut send = record(EventKind::Send, 7);
        send.targets = vec![PeerId::new(1), PeerId::new(2)];
        assert_eq!(send.to_string(), "[send]: 00:00:01.250 7 peer-1,peer-2");

        let mut recv = record(EventKind::Receive, 9);
        recv.sender = Some(PeerId::new(2));
        assert_eq!(recv.to_string(), "[receive]: 00:00:01.250 9 from peer-2 queued 2");

        assert_eq!(record(EventKind::Internal, 3).to_string(), "[internal]: 00:00:01.250 3");
    }

    #[test]
    fn test_memory_sink_separates_streams() {
        let sink = MemorySink::new();
        let log = EventLog::new(PeerId::new(0)).with_sink(Arc::new(sink.clone()));

        log.record(record(EventKind::Internal, 1));
        log.report(ErrorKind::Framing, Some(PeerId::new(1)), "garbage");
        log.record(record(EventKind::Internal, 2));

        assert_eq!(sink.entries().len(), 3);
        assert_eq!(sink.records().iter().map(|r| r.logical_clock).collect::<Vec<_>>(), vec![1, 2]);
        let diags = sink.diagnostics();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].kind, ErrorKind::Framing);
        assert_eq!(diags[0].neighbor, Some(PeerId::new(1)));
    }

    #[test]
    fn test_report_uses_injected_clock() {
        let fixed = DateTime::from_timestamp(1_704_067_230, 0).unwrap();
        let sink = MemorySink::new();
        let log = EventLog::new(PeerId::new(3))
            .with_sink(Arc::new(sink.clone()))
            .with_clock(move || fixed);

        log.report(ErrorKind::Schema, None, "bad field");
        let diags = sink.diagnostics();
        assert_eq!(diags[0].timestamp, fixed);
        assert_eq!(diags[0].peer, PeerId::new(3));
    }

    #[test]
    fn test_json_lines_sink_writes_tagged_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer-0.jsonl");
        let sink = Arc::new(JsonLinesSink::create(&path).unwrap());
        let log = EventLog::new(PeerId::new(0)).with_sink(sink);

        log.record(record(EventKind::Send, 4));
        log.report(ErrorKind::Connection, None, "reset");
        log.flush();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: LogEntry = serde_json::from_str(lines[0]).unwrap();
        assert!(matches!(first, LogEntry::Event(ref r) if r.logical_clock == 4));
        assert!(lines[0].contains("\"type\":\"event\""));
        assert!(lines[1].contains("\"type\":\"diagnostic\""));
        assert!(lines[1].contains("\"kind\":\"connection\""));
    }
}
