//! JSON exporter for offline analysis.
//!
//! Writes one scenario run as a single JSON document: the verdict, every
//! peer's summary, and the full record and diagnostic streams.

use crate::network::LinkStats;
use crate::runner::{ScenarioMetrics, ScenarioResult};
use crate::world::SimWorld;

use lamport_core::{Diagnostic, EventRecord, PeerSummary};
use lamport_env::PeerId;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// One peer's slice of the export.
#[derive(Debug, Clone, Serialize)]
pub struct PeerExport {
    pub peer: PeerId,
    pub ticks_per_sec: f64,
    pub summary: PeerSummary,
    pub records: Vec<EventRecord>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
}

/// Traffic on one directed link.
#[derive(Debug, Clone, Serialize)]
pub struct LinkExport {
    pub from: PeerId,
    pub to: PeerId,

    #[serde(flatten)]
    pub stats: LinkStats,
}

/// Complete simulation export.
#[derive(Debug, Clone, Serialize)]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Virtual duration in seconds
    pub duration_sec: f64,

    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    pub metrics: ScenarioMetrics,

    pub peers: Vec<PeerExport>,

    pub links: Vec<LinkExport>,
}

impl SimExport {
    /// Collects everything `world` recorded during `result`'s run.
    pub fn from_world(world: &SimWorld, result: &ScenarioResult) -> Self {
        let peers = world
            .peer_ids()
            .into_iter()
            .zip(&world.config().peers)
            .map(|(peer, spec)| PeerExport {
                peer,
                ticks_per_sec: spec.ticks_per_sec,
                summary: world.summary(peer),
                records: world.records(peer),
                diagnostics: world.diagnostics(peer),
            })
            .collect();

        let links = world
            .router()
            .all_stats()
            .into_iter()
            .map(|((from, to), stats)| LinkExport { from, to, stats })
            .collect();

        Self {
            scenario: result.scenario.name().to_string(),
            seed: result.seed,
            duration_sec: result.final_time_secs,
            passed: result.passed,
            failure_reason: result.failure_reason.clone(),
            metrics: result.metrics.clone(),
            peers,
            links,
        }
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }
}
