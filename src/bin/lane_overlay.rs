use anyhow::{Context, Result};
use clap::Parser;
use ev_vision::lane_detection::Pipeline;
use ev_vision::{logging, Config};
use std::path::PathBuf;
use tracing::info;

/// Lane segmentation overlay on a live camera feed.
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

    let mut drive = Pipeline::new(&config).context("Failed to load lane model")?;
    drive.start_detection(config.lane.device_index, &config)?;

    Ok(())
}
