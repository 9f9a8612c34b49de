use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use catengine::calibration::ItemCalibration;
use catengine::config::CatConfig;
use catengine::drift::DriftMonitor;
use catengine::exposure::ExposureTableHandle;
use catengine::repository::{CalibrationRepository, InMemoryCalibrationRepository};
use catengine::simulation::simulate_conditional;
use catengine::window::{JsonResponseFile, Window};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};

#[derive(Parser)]
#[command(name = "catctl", about = "Operate the adaptive testing engine")]
#[command(version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file
    #[arg(short, long, global = true, default_value = "cat.toml")]
    config: PathBuf,

    /// Ignore CAT_* environment overrides
    #[arg(long, global = true)]
    no_env: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Recalibrate items over the recent window and publish exposure weights
    Drift(DriftArgs),
    /// Simulate sessions at fixed abilities and report recovery
    Simulate(SimulateArgs),
}

#[derive(Args)]
struct DriftArgs {
    /// JSON array of response records
    #[arg(long)]
    responses: PathBuf,

    /// JSON baseline: a window and its item calibrations
    #[arg(long)]
    baseline: Option<PathBuf>,

    /// End of the recent window (RFC 3339), defaults to now
    #[arg(long)]
    now: Option<DateTime<Utc>>,

    /// Write the report here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct SimulateArgs {
    /// True abilities to simulate at
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true, default_value = "-2,-1,0,1,2")]
    thetas: Vec<f64>,

    #[arg(long, default_value_t = 100)]
    replications: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,
}

#[derive(Serialize, Deserialize)]
struct BaselineFile {
    window: Window,
    calibrations: Vec<ItemCalibration>,
}

fn load_config(cli: &Cli) -> Result<CatConfig> {
    let mut config = if cli.config.exists() {
        CatConfig::load(&cli.config)
            .with_context(|| format!("loading {}", cli.config.display()))?
    } else {
        tracing::warn!(path = %cli.config.display(), "config file not found, using defaults");
        CatConfig::default()
    };
    if !cli.no_env {
        config
            .apply_env_overrides(std::env::vars())
            .context("applying environment overrides")?;
    }
    Ok(config)
}

fn write_json<T: Serialize>(value: &T, output: Option<&PathBuf>) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => std::fs::write(path, json).with_context(|| format!("writing {}", path.display())),
        None => {
            println!("{json}");
            Ok(())
        }
    }
}

fn run_drift(mut config: CatConfig, args: DriftArgs) -> Result<()> {
    let repository = Arc::new(InMemoryCalibrationRepository::new());
    if let Some(path) = &args.baseline {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let baseline: BaselineFile = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;
        config
            .drift
            .baseline_window_id
            .get_or_insert_with(|| baseline.window.id.clone());
        repository.save_window(baseline.window)?;
        repository.save_calibrations(&baseline.calibrations)?;
    }

    let monitor = DriftMonitor::new(
        config.model(),
        config.item_source()?,
        Arc::new(JsonResponseFile::new(args.responses)),
        repository,
        Arc::new(ExposureTableHandle::new()),
    );
    let report = monitor
        .run(&config.drift, args.now.unwrap_or_else(Utc::now))
        .context("drift run failed")?;
    write_json(&report, args.output.as_ref())
}

fn run_simulate(config: CatConfig, args: SimulateArgs) -> Result<()> {
    let results = simulate_conditional(
        &config,
        config.item_source()?,
        &args.thetas,
        args.replications,
        args.seed,
    )?;
    write_json(&results, None)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli)?;
    match cli.command {
        Commands::Drift(args) => run_drift(config, args),
        Commands::Simulate(args) => run_simulate(config, args),
    }
}
