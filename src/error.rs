//! Error type shared by the three vision demos.

use thiserror::Error;

/// Errors raised while loading models, talking to the camera or decoding
/// network output.
#[derive(Error, Debug)]
pub enum VisionError {
    /// Any failure reported by the OpenCV bindings
    #[error("OpenCV error: {0}")]
    OpenCv(#[from] opencv::Error),

    /// Any failure reported by ONNX Runtime
    #[error("ONNX Runtime error: {0}")]
    Ort(#[from] ort::Error),

    /// Tensor reshaping failed
    #[error("Tensor shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] serde_yaml::Error),

    /// The capture device could not be opened
    #[error("Could not open camera at index {0}")]
    CameraUnavailable(i32),

    /// Network output did not have the layout the decoder expects
    #[error("Malformed detector output: {0}")]
    MalformedOutput(String),
}

pub type VisionResult<T> = Result<T, VisionError>;
