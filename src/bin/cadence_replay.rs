use cadence_core::simulation::{SCENARIOS, SimulationEngine, scenarios};
use cadence_core::{CadenceEngine, EngineConfig, Observation, Snapshot};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cadence-replay", about = "Drive the cadence engine offline")]
struct Cli {
    /// JSON engine configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run synthetic scenarios and print one snapshot per tick as JSON lines
    Simulate {
        /// Scenario names; see `list`
        #[arg(required = true)]
        scenarios: Vec<String>,

        #[arg(long, default_value_t = 300)]
        ticks: u64,

        #[arg(long, default_value_t = 42)]
        seed: u64,

        #[arg(long, default_value_t = 1000)]
        start: i64,

        /// Print only snapshots that differ from the previous one
        #[arg(long)]
        changes_only: bool,
    },
    /// Feed a JSON-lines observation trace through the engine
    Replay {
        trace: PathBuf,

        #[arg(long)]
        changes_only: bool,
    },
    /// List available scenarios
    List,
}

/// Writes snapshots as JSON lines, optionally skipping repeats.
struct SnapshotSink<W: Write> {
    out: W,
    changes_only: bool,
    last: Option<Snapshot>,
    written: u64,
}

impl<W: Write> SnapshotSink<W> {
    fn new(out: W, changes_only: bool) -> Self {
        Self {
            out,
            changes_only,
            last: None,
            written: 0,
        }
    }

    fn emit(&mut self, snap: &Snapshot) -> std::io::Result<()> {
        if self.changes_only
            && self
                .last
                .as_ref()
                .is_some_and(|prev| prev.views == snap.views)
        {
            return Ok(());
        }
        serde_json::to_writer(&mut self.out, snap)?;
        self.out.write_all(b"\n")?;
        self.written += 1;
        if self.changes_only {
            self.last = Some(snap.clone());
        }
        Ok(())
    }

    fn finish(mut self) -> std::io::Result<u64> {
        self.out.flush()?;
        Ok(self.written)
    }
}

fn simulate(
    config: EngineConfig,
    names: &[String],
    ticks: u64,
    seed: u64,
    start: i64,
    changes_only: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut sim = SimulationEngine::new(start);
    for (i, name) in names.iter().enumerate() {
        let scenario = scenarios::build(name, seed.wrapping_add(i as u64))
            .ok_or_else(|| format!("unknown scenario: {}", name))?;
        sim.add_scenario(scenario);
    }

    let mut engine = CadenceEngine::new(config);
    sim.prepare(engine.store_mut());
    info!(scenarios = ?sim.scenario_names(), ticks, seed, "Simulating");

    let stdout = std::io::stdout();
    let mut sink = SnapshotSink::new(BufWriter::new(stdout.lock()), changes_only);
    let mut failed = None;
    sim.drive(&mut engine, ticks, |snap| {
        if failed.is_none() {
            failed = sink.emit(snap).err();
        }
    });
    if let Some(e) = failed {
        return Err(e.into());
    }
    let written = sink.finish()?;

    let counters = engine.counters();
    info!(
        snapshots = written,
        signals = counters.signals,
        confirmations = counters.confirmations,
        phase_changes = counters.phase_changes,
        profiles = engine.store().profiles().len(),
        "Simulation finished"
    );
    Ok(())
}

fn replay(
    config: EngineConfig,
    trace: &Path,
    changes_only: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let reader = BufReader::new(File::open(trace)?);
    let mut engine = CadenceEngine::open(config)?;

    let stdout = std::io::stdout();
    let mut sink = SnapshotSink::new(BufWriter::new(stdout.lock()), changes_only);
    let mut skipped = 0u64;

    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let obs: Observation = match serde_json::from_str(line) {
            Ok(obs) => obs,
            Err(e) => {
                warn!(line = n + 1, error = %e, "Skipping malformed observation");
                skipped += 1;
                continue;
            }
        };
        let is_tick = matches!(obs, Observation::SchedulingTick { .. });
        engine.apply(obs);
        if is_tick {
            sink.emit(&engine.snapshot())?;
        }
    }

    let written = sink.finish()?;
    info!(snapshots = written, skipped, "Replay finished");
    engine.shutdown();
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Command::Simulate {
            scenarios,
            ticks,
            seed,
            start,
            changes_only,
        } => simulate(config, &scenarios, ticks, seed, start, changes_only),
        Command::Replay {
            trace,
            changes_only,
        } => replay(config, &trace, changes_only),
        Command::List => {
            for info in SCENARIOS {
                println!("{:<12} {}", info.name, info.description);
            }
            Ok(())
        }
    }
}
