//! Camera demos for the autonomous EV prototype: steering regression, lane
//! segmentation overlay and a streaming chart.

pub mod capture;
pub mod config;
pub mod error;
pub mod inference;
pub mod lane_detection;
pub mod lane_mask;
pub mod logging;
pub mod segmentation;
pub mod steering;
pub mod stream_chart;

pub use config::Config;
pub use error::{VisionError, VisionResult};
