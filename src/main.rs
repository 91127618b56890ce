//! CLI entry point for mca-daq
//!
//! Provides a command-line interface for:
//! - Running a timed MCA acquisition from a configuration file
//! - Printing the merged settings tree of the configured devices
//!
//! # Usage
//!
//! ```bash
//! mca-daq run --config config/default.toml --seconds 10
//! mca-daq settings --config config/default.toml
//! ```

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use mca_daq::config::{EngineConfig, DEFAULT_CONFIG_PATH};
use mca_daq::engine::Engine;
use mca_daq::hardware::SourceRegistry;
use mca_daq::histogram::{Histogram, HistogramSink};
use mca_daq::logging;

#[derive(Parser)]
#[command(name = "mca-daq")]
#[command(about = "Multi-channel analyzer acquisition engine", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot the configured devices and acquire a histogram
    Run {
        /// Acquisition time
        #[arg(long, default_value_t = 5)]
        seconds: u64,

        /// Histogram resolution in bits
        #[arg(long, default_value_t = 12)]
        bits: u32,
    },

    /// Print the merged settings tree as JSON
    Settings {
        /// Boot devices first so booted-only values are filled in
        #[arg(long)]
        boot: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = EngineConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    logging::init_from_config(&config)?;

    let engine = Engine::from_config(&config, &SourceRegistry::with_builtins())?;

    match cli.command {
        Commands::Run { seconds, bits } => run(&engine, seconds, bits),
        Commands::Settings { boot } => print_settings(&engine, boot),
    }
}

fn run(engine: &Engine, seconds: u64, bits: u32) -> Result<()> {
    if !engine.boot() {
        bail!("not every device booted (status: {})", engine.status());
    }

    let histogram = Histogram::shared(bits);
    let cancel = AtomicBool::new(false);
    info!(seconds, "Acquiring");
    if !engine.run_mca(Duration::from_secs(seconds), histogram.clone(), &cancel) {
        bail!("acquisition could not be started");
    }

    let snapshot = histogram.snapshot();
    println!("spills:     {}", snapshot.spills);
    println!("hits:       {}", snapshot.total_hits);
    println!("dropped:    {}", snapshot.dropped);
    println!("live time:  {:.3} s", snapshot.live_time.as_secs_f64());
    println!("real time:  {:.3} s", snapshot.real_time.as_secs_f64());
    for (channel, counts) in snapshot.counts.iter().enumerate() {
        let total: u64 = counts.iter().sum();
        let peak = counts
            .iter()
            .enumerate()
            .max_by_key(|(_, count)| **count)
            .map(|(bin, _)| bin)
            .unwrap_or_default();
        println!("channel {channel}: {total} counts, peak at bin {peak}");
    }

    engine.die();
    Ok(())
}

fn print_settings(engine: &Engine, boot: bool) -> Result<()> {
    if boot && !engine.boot() {
        bail!("not every device booted (status: {})", engine.status());
    }
    let tree = engine.pull_settings();
    println!("{}", serde_json::to_string_pretty(&tree)?);
    Ok(())
}
