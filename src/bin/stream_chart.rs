use anyhow::{Context, Result};
use clap::Parser;
use ev_vision::{logging, stream_chart, Config};
use std::path::PathBuf;
use tracing::info;

/// Real-time line chart over a simulated sensor stream.
#[derive(Parser)]
struct Args {
    /// YAML configuration file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config).context("Failed to load configuration")?;
    logging::init(&config.logging);
    if !args.config.exists() {
        info!("{} not found, using defaults", args.config.display());
    }

    stream_chart::run(&config.chart)?;
    Ok(())
}
