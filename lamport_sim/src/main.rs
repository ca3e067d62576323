//! Lamport Simulator CLI
//!
//! Runs deterministic scenarios in virtual time, a single TCP peer from a
//! config file, or a whole localhost mesh in one process.

use clap::{Parser, Subcommand};
use lamport_core::{
    ActionWeights, EventSink, JsonLinesSink, MemorySink, PeerConfig, PeerHandle, PeerNode,
    PeerReport, PeerSummary, Speed, Topology,
};
use lamport_env::PeerId;
use lamport_sim::scenarios::ScenarioId;
use lamport_sim::{ScenarioResult, ScenarioRunner, SimExport};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Lamport clock peers and deterministic scenarios
#[derive(Parser, Debug)]
#[command(name = "lamport-sim")]
#[command(about = "Run Lamport clock peers and deterministic scenarios", long_about = None)]
struct Args {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON output for scripting
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run scenarios in virtual time
    Scenario {
        /// Scenario to run (simplex, slow_receiver, deaf_neighbor, malformed_frame, full_mesh, all)
        #[arg(default_value = "all")]
        name: String,

        /// Master seed for determinism (0 = random from time)
        #[arg(short, long, default_value = "42")]
        seed: u64,

        /// Number of consecutive seeds to run
        #[arg(long, default_value = "1")]
        seeds: usize,

        /// Virtual duration per scenario in seconds
        #[arg(short, long, default_value = "30")]
        duration: f64,

        /// Write the full run to a JSON file (single scenario and seed only)
        #[arg(long)]
        export: Option<PathBuf>,
    },

    /// Run one TCP peer from a JSON config file
    Peer {
        /// Peer config file
        #[arg(short, long)]
        config: PathBuf,

        /// Append the event log to this JSON lines file
        #[arg(long)]
        log: Option<PathBuf>,

        /// Override the configured run duration, in seconds
        #[arg(short, long)]
        duration: Option<f64>,
    },

    /// Run a localhost mesh of TCP peers in this process
    Mesh {
        /// Number of peers
        #[arg(short, long, default_value = "3")]
        peers: u32,

        /// Port of peer 0; peer n listens on base_port + n
        #[arg(long, default_value = "7000")]
        base_port: u16,

        /// Run duration in seconds
        #[arg(short, long, default_value = "10")]
        duration: f64,

        /// Action weight preset (standard, chatty, broadcast_heavy, send_only, silent)
        #[arg(short, long, default_value = "standard")]
        weights: String,

        /// Slowest tick rate a peer may draw
        #[arg(long, default_value = "1")]
        speed_min: u32,

        /// Fastest tick rate a peer may draw
        #[arg(long, default_value = "6")]
        speed_max: u32,

        /// Seed for speed and action draws (peer n uses seed + n)
        #[arg(short, long)]
        seed: Option<u64>,

        /// Write peer-<n>.jsonl event logs into this directory
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging; RUST_LOG overrides the flag
    let level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return ExitCode::FAILURE;
    }

    match args.command {
        Command::Scenario {
            name,
            seed,
            seeds,
            duration,
            export,
        } => run_scenarios(&name, seed, seeds, duration, export.as_deref(), args.json).await,
        Command::Peer {
            config,
            log,
            duration,
        } => run_peer(&config, log.as_deref(), duration, args.json).await,
        Command::Mesh {
            peers,
            base_port,
            duration,
            weights,
            speed_min,
            speed_max,
            seed,
            log_dir,
        } => {
            let Some(weights) = ActionWeights::preset(&weights) else {
                error!("Unknown weight preset: {}", weights);
                return ExitCode::from(2);
            };
            let mesh = MeshArgs {
                peers,
                base_port,
                duration,
                weights,
                speed: Speed::Range {
                    min: speed_min,
                    max: speed_max,
                },
                seed,
                log_dir,
            };
            run_mesh(mesh, args.json).await
        }
    }
}

async fn run_scenarios(
    name: &str,
    seed: u64,
    seeds: usize,
    duration: f64,
    export: Option<&Path>,
    json: bool,
) -> ExitCode {
    let scenarios: Vec<ScenarioId> = if name == "all" {
        ScenarioId::all()
    } else {
        match name.parse() {
            Ok(scenario) => vec![scenario],
            Err(e) => {
                error!("{}", e);
                let names: Vec<_> = ScenarioId::all().iter().map(|s| s.name()).collect();
                error!("Available scenarios: {}, all", names.join(", "));
                return ExitCode::from(2);
            }
        }
    };

    if export.is_some() && (scenarios.len() > 1 || seeds > 1) {
        error!("--export only supports a single scenario and seed");
        return ExitCode::from(2);
    }

    // Determine base seed
    let base_seed = if seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(42)
    } else {
        seed
    };

    if !json {
        info!("Lamport Simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    let mut all_results: Vec<ScenarioResult> = Vec::new();
    for seed_offset in 0..seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);
        let runner = ScenarioRunner::new(seed).with_duration(duration);

        for scenario in &scenarios {
            let (result, world) = runner.run_detailed(*scenario).await;

            if let (Some(path), Some(world)) = (export, world.as_ref()) {
                match SimExport::from_world(world, &result).write_to_file(path) {
                    Ok(()) => info!("Exported {} to {}", scenario.name(), path.display()),
                    Err(e) => error!("Failed to write export: {}", e),
                }
            }

            if !json {
                if result.passed {
                    info!("✓ {} (seed={}) PASSED", scenario.name(), seed);
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario.name(),
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }
            all_results.push(result);
        }
    }

    let total = all_results.len();
    let failed = all_results.iter().filter(|r| !r.passed).count();

    if json {
        let summary = serde_json::json!({
            "total": total,
            "passed": total - failed,
            "failed": failed,
            "results": all_results,
        });
        print_json(&summary);
    } else {
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        if failed == 0 {
            info!("All {} scenario runs passed", total);
        } else {
            error!("{}/{} scenario runs failed", failed, total);
            for result in all_results.iter().filter(|r| !r.passed) {
                error!(
                    "  - {} seed={}: {}",
                    result.scenario.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    if failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

async fn run_peer(config_path: &Path, log: Option<&Path>, duration: Option<f64>, json: bool) -> ExitCode {
    let mut config = match PeerConfig::from_json_file(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(2);
        }
    };
    if let Some(secs) = duration {
        config.run_duration_secs = Some(secs);
    }

    let mut sinks: Vec<Arc<dyn EventSink>> = Vec::new();
    if let Some(path) = log {
        match JsonLinesSink::create(path) {
            Ok(sink) => sinks.push(Arc::new(sink)),
            Err(e) => {
                error!("Cannot open event log {}: {}", path.display(), e);
                return ExitCode::from(2);
            }
        }
    }
    let memory = MemorySink::new();
    sinks.push(Arc::new(memory.clone()));

    let handle = match PeerNode::start(config, sinks).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Peer refused to start: {}", e);
            return ExitCode::from(2);
        }
    };
    cancel_on_ctrl_c(vec![handle.shutdown_token()]);

    match handle.join().await {
        Ok(report) => {
            print_reports(&[(report, PeerSummary::from_records(&memory.records()))], json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

struct MeshArgs {
    peers: u32,
    base_port: u16,
    duration: f64,
    weights: ActionWeights,
    speed: Speed,
    seed: Option<u64>,
    log_dir: Option<PathBuf>,
}

async fn run_mesh(args: MeshArgs, json: bool) -> ExitCode {
    let topology = match Topology::localhost(args.peers, args.base_port) {
        Ok(topology) => topology,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(2);
        }
    };

    let mut handles: Vec<(PeerHandle, MemorySink)> = Vec::new();
    for id in topology.ids() {
        let mut config = PeerConfig::new(id, topology.clone())
            .with_speed(args.speed)
            .with_weights(args.weights);
        config.run_duration_secs = Some(args.duration);
        if let Some(seed) = args.seed {
            config = config.with_seed(seed.wrapping_add(id.as_u32() as u64));
        }

        let memory = MemorySink::new();
        let mut sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(memory.clone())];
        if let Some(dir) = &args.log_dir {
            match open_peer_log(dir, id) {
                Ok(sink) => sinks.push(sink),
                Err(e) => {
                    error!("Cannot open event log for {}: {}", id, e);
                    stop_all(handles).await;
                    return ExitCode::from(2);
                }
            }
        }

        match PeerNode::start(config, sinks).await {
            Ok(handle) => handles.push((handle, memory)),
            Err(e) => {
                error!("{} refused to start: {}", id, e);
                stop_all(handles).await;
                return ExitCode::from(2);
            }
        }
    }

    cancel_on_ctrl_c(handles.iter().map(|(h, _)| h.shutdown_token()).collect());

    let mut reports = Vec::new();
    let mut failed = false;
    for (handle, memory) in handles {
        match handle.join().await {
            Ok(report) => reports.push((report, PeerSummary::from_records(&memory.records()))),
            Err(e) => {
                error!("{}", e);
                failed = true;
            }
        }
    }

    print_reports(&reports, json);
    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// Cancels every token on the first Ctrl-C.
fn cancel_on_ctrl_c(tokens: Vec<CancellationToken>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping peers");
            for token in tokens {
                token.cancel();
            }
        }
    });
}

fn open_peer_log(dir: &Path, id: PeerId) -> std::io::Result<Arc<dyn EventSink>> {
    std::fs::create_dir_all(dir)?;
    let sink = JsonLinesSink::create(dir.join(format!("{}.jsonl", id)))?;
    Ok(Arc::new(sink))
}

async fn stop_all(handles: Vec<(PeerHandle, MemorySink)>) {
    for (handle, _) in handles {
        handle.stop();
        if let Err(e) = handle.join().await {
            warn!("{}", e);
        }
    }
}

fn print_reports(reports: &[(PeerReport, PeerSummary)], json: bool) {
    if json {
        let peers: Vec<_> = reports
            .iter()
            .map(|(report, summary)| serde_json::json!({ "report": report, "summary": summary }))
            .collect();
        print_json(&serde_json::json!({ "peers": peers }));
        return;
    }

    for (report, summary) in reports {
        info!(
            "{} @ {} ticks/s: clock={} ticks={} (internal={} send={} receive={}) backlog={} max_drift={:.2} final_drift={:.2}",
            report.id,
            report.ticks_per_sec,
            report.final_clock,
            report.ticks,
            report.counts.internal,
            report.counts.send,
            report.counts.receive,
            report.queue_len_at_exit,
            summary.max_drift,
            summary.final_drift,
        );
        if !report.unreachable_neighbors.is_empty() {
            warn!("{} never reached {:?}", report.id, report.unreachable_neighbors);
        }
    }
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => error!("Failed to render JSON: {}", e),
    }
}
