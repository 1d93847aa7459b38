//! Steering angle regression on a live camera feed.
//!
//! The network is the NVIDIA end-to-end model: a `66 x 200` RGB input scaled
//! to `[-0.5, 0.5]`, one scalar out.

use crate::capture::{show_and_poll, FrameSource};
use crate::config::{CameraConfig, InferenceConfig, SteeringConfig};
use crate::error::{VisionError, VisionResult};
use crate::inference::{build_session, extract_output};
use ndarray::{Array4, ArrayView4};
use opencv::core::AlgorithmHint::ALGO_HINT_DEFAULT;
use opencv::{
    core::{Mat, Size},
    highgui, imgproc,
    prelude::*,
};
use ort::session::Session;
use ort::value::Tensor;
use std::path::Path;
use tracing::{debug, info};

const WINDOW_NAME: &str = "Webcam Feed";

/// Scales packed RGB bytes to the `[1, height, width, 3]` tensor the model was
/// trained on (`p / 255 - 0.5`).
pub fn normalize_pixels(bytes: &[u8], width: usize, height: usize) -> VisionResult<Array4<f32>> {
    let nhwc = ArrayView4::from_shape((1, height, width, 3), bytes)?;
    Ok(nhwc.mapv(|p| p as f32 / 255.0 - 0.5))
}

/// BGR frame to model input: colour conversion, resize, normalisation.
pub fn preprocess_frame(frame: &Mat, width: i32, height: i32) -> VisionResult<Array4<f32>> {
    let mut rgb = Mat::default();
    imgproc::cvt_color(frame, &mut rgb, imgproc::COLOR_BGR2RGB, 0, ALGO_HINT_DEFAULT)?;

    let mut resized = Mat::default();
    imgproc::resize(
        &rgb,
        &mut resized,
        Size::new(width, height),
        0.0,
        0.0,
        imgproc::INTER_LINEAR,
    )?;

    normalize_pixels(resized.data_bytes()?, width as usize, height as usize)
}

/// Loaded steering model.
pub struct SteeringPredictor {
    session: Session,
    input_name: String,
    input_width: i32,
    input_height: i32,
}

impl SteeringPredictor {
    pub fn new(model_path: &Path, steering: &SteeringConfig, inference: &InferenceConfig) -> VisionResult<Self> {
        let session = build_session(model_path, inference)?;
        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| VisionError::MalformedOutput("model declares no inputs".to_string()))?;

        info!("Loaded model from: {}", model_path.display());

        Ok(Self {
            session,
            input_name,
            input_width: steering.input_width,
            input_height: steering.input_height,
        })
    }

    /// Predicted steering angle for one BGR frame.
    pub fn predict(&mut self, frame: &Mat) -> VisionResult<f32> {
        let input = preprocess_frame(frame, self.input_width, self.input_height)?;
        let input = Tensor::from_array(input)?;

        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input])?;
        let output = extract_output(&outputs[0])?;

        output
            .iter()
            .next()
            .copied()
            .ok_or_else(|| VisionError::MalformedOutput("empty steering output".to_string()))
    }

    /// Reads frames from camera `device_index` until `q` is pressed or the
    /// stream ends, printing one prediction per frame.
    pub fn start_prediction(&mut self, device_index: i32, camera: &CameraConfig) -> VisionResult<()> {
        let mut source = FrameSource::open(device_index, camera)?;
        highgui::named_window(WINDOW_NAME, highgui::WINDOW_AUTOSIZE)?;

        info!("Starting webcam feed. Press 'q' to quit.");
        while let Some(frame) = source.next_frame() {
            let steering_angle = self.predict(&frame)?;
            println!("Predicted Steering: {}", steering_angle);

            if show_and_poll(WINDOW_NAME, &frame, b'q')? {
                debug!("quit key pressed");
                break;
            }
        }

        source.release()?;
        highgui::destroy_all_windows()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Scalar, CV_8UC3};

    #[test]
    fn pixels_map_to_centered_range() {
        let bytes = [0u8, 255, 51, 0, 0, 0];
        let tensor = normalize_pixels(&bytes, 2, 1).unwrap();

        assert_eq!(tensor.dim(), (1, 1, 2, 3));
        assert_eq!(tensor[[0, 0, 0, 0]], -0.5);
        assert_eq!(tensor[[0, 0, 0, 1]], 0.5);
        assert!((tensor[[0, 0, 0, 2]] + 0.3).abs() < 1e-6);
    }

    #[test]
    fn wrong_buffer_size_is_rejected() {
        assert!(normalize_pixels(&[0u8; 5], 2, 1).is_err());
    }

    #[test]
    fn frame_is_converted_to_rgb_and_resized() {
        // solid red in BGR order
        let frame = Mat::new_rows_cols_with_default(
            120,
            320,
            CV_8UC3,
            Scalar::new(0.0, 0.0, 255.0, 0.0),
        )
        .unwrap();

        let tensor = preprocess_frame(&frame, 200, 66).unwrap();
        assert_eq!(tensor.dim(), (1, 66, 200, 3));
        assert_eq!(tensor[[0, 10, 10, 0]], 0.5);
        assert_eq!(tensor[[0, 10, 10, 2]], -0.5);
    }
}
