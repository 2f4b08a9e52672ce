//! SLAM3D SIM: replay recorded odometry and UWB range logs through the particle filter.
//!
//! The input is an event log CSV (`time,kind,x,y,z,dist,beacon,range,std_range`). The
//! tool writes one tag estimate per range event and, optionally, the estimate of every
//! tracked beacon at that time.

mod common;

use anyhow::Context;
use clap::Parser;
use common::{ensure_parent_dir, init_logger};
use log::{error, info};
use std::path::PathBuf;

use slam3d::filter::{Filter, FilterConfig};
use slam3d::sim::{BeaconRecord, EstimateRecord, EventRecord, replay};

/// Command line arguments
#[derive(Parser)]
#[command(
    author,
    version,
    about = "Replay odometry and UWB range logs through the tag/beacon particle filter."
)]
struct Cli {
    /// Event log CSV to replay
    #[arg(short, long)]
    input: PathBuf,

    /// Output CSV for tag estimates
    #[arg(short, long)]
    output: PathBuf,

    /// Optional output CSV for beacon estimates
    #[arg(short, long)]
    beacons: Option<PathBuf>,

    /// Filter configuration file (TOML/JSON/YAML); defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Random seed, overriding the one in the configuration file
    #[arg(long)]
    seed: Option<u64>,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => FilterConfig::from_file(path)
            .with_context(|| format!("loading filter config {}", path.display()))?,
        None => FilterConfig::default(),
    };
    if cli.seed.is_some() {
        config.seed = cli.seed;
    }
    info!(
        "Filter: {} tag particles, {} beacon particles per row, {:?} resampling",
        config.num_tag_particles, config.num_beacon_particles, config.resampling_strategy
    );
    let mut filter = Filter::new(config)?;

    let events = EventRecord::from_csv(&cli.input)?;
    info!("Read {} events from {}", events.len(), cli.input.display());
    let output = replay(&mut filter, &events)?;

    ensure_parent_dir(&cli.output)?;
    EstimateRecord::to_csv(&output.estimates, &cli.output)
        .with_context(|| format!("writing {}", cli.output.display()))?;
    info!(
        "Wrote {} tag estimates to {}",
        output.estimates.len(),
        cli.output.display()
    );

    if let Some(path) = &cli.beacons {
        ensure_parent_dir(path)?;
        BeaconRecord::to_csv(&output.beacons, path)
            .with_context(|| format!("writing {}", path.display()))?;
        info!("Wrote {} beacon estimates to {}", output.beacons.len(), path.display());
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if let Err(e) = init_logger(&cli.log_level, cli.log_file.as_ref()) {
        eprintln!("Failed to initialize logger: {}", e);
    }
    if let Err(e) = run(&cli) {
        error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}
