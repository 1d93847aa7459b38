use anyhow::{Context, Result};
use clap::Parser;
use ev_vision::steering::SteeringPredictor;
use ev_vision::{logging, Config};
use std::path::PathBuf;
use tracing::info;

/// Prints a predicted steering angle for every camera frame.
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

    let model_path = config.resolve(&config.steering.model_path);
    let mut predictor = SteeringPredictor::new(&model_path, &config.steering, &config.inference)
        .context("Failed to load steering model")?;
    predictor.start_prediction(config.steering.device_index, &config.camera)?;

    Ok(())
}
