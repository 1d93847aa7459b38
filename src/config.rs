use crate::error::VisionResult;
use crate::lane_mask::MIN_CONFIDENCE;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Top-level configuration shared by all three demo binaries.
///
/// Every section falls back to its `Default` when missing from the YAML file,
/// so a config only needs to list the values it overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub camera: CameraConfig,
    pub inference: InferenceConfig,
    pub steering: SteeringConfig,
    pub lane: LaneConfig,
    pub chart: ChartConfig,

    /// Directory relative model paths are resolved against
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "ev_vision=info,ort=warn".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub width: i32,
    pub height: i32,
    /// Consecutive failed reads tolerated before the stream counts as ended
    pub max_read_failures: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            max_read_failures: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub use_gpu: bool,
    pub intra_threads: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            use_gpu: true,
            intra_threads: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SteeringConfig {
    pub model_path: String,
    pub device_index: i32,
    pub input_width: i32,
    pub input_height: i32,
}

impl Default for SteeringConfig {
    fn default() -> Self {
        Self {
            model_path: "model_final.onnx".to_string(),
            device_index: 0,
            input_width: 200,
            input_height: 66,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaneConfig {
    pub model_path: String,
    pub device_index: i32,
    /// Square input edge of the segmentation network
    pub input_size: usize,
    /// Confidence floor for boxes used as lane evidence and for labels
    pub min_confidence: f32,
    /// Score an anchor needs to survive decoding at all
    pub detector_confidence: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
    pub overlay_alpha: f64,
    /// Used when the model carries no `names` metadata
    pub class_names: Vec<String>,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            model_path: "lane_seg.onnx".to_string(),
            device_index: 1,
            input_size: 640,
            min_confidence: MIN_CONFIDENCE,
            detector_confidence: 0.25,
            iou_threshold: 0.7,
            max_detections: 300,
            overlay_alpha: 0.4,
            class_names: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChartConfig {
    pub capacity: usize,
    pub iterations: usize,
    pub interval_ms: u64,
    pub frequency: f64,
    pub noise_std: f64,
    pub show_window: bool,
    pub snapshot_path: Option<String>,
    pub width: i32,
    pub height: i32,
}

impl Default for ChartConfig {
    fn default() -> Self {
        Self {
            capacity: 50,
            iterations: 100,
            interval_ms: 100,
            frequency: 0.1,
            noise_std: 0.1,
            show_window: true,
            snapshot_path: None,
            width: 640,
            height: 360,
        }
    }
}

impl Config {
    /// Loads the YAML file at `path`, or the defaults when it does not exist.
    ///
    /// Logging is not up yet when this runs, so callers report the fallback.
    pub fn load(path: impl AsRef<Path>) -> VisionResult<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents = fs::read_to_string(path)?;
            serde_yaml::from_str::<Config>(&contents)?
        } else {
            Config::default()
        };

        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(config)
    }

    /// Resolves a model path from the config against the config's directory.
    pub fn resolve(&self, model_path: &str) -> PathBuf {
        let candidate = Path::new(model_path);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.base_dir.join(candidate)
        }
    }
}
