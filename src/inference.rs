use crate::config::InferenceConfig;
use crate::error::VisionResult;
use ndarray::{ArrayD, ArrayViewD, IxDyn};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::DynValue;
use std::path::Path;
use tracing::info;

#[cfg(feature = "cuda")]
use ort::execution_providers::CUDAExecutionProvider;

/// Builds an ONNX Runtime session for `model_path`.
///
/// The CUDA provider is only registered when the crate is built with the
/// `cuda` feature and `use_gpu` is set. ONNX Runtime falls back to the CPU
/// provider on its own if CUDA cannot be initialised.
pub fn build_session(model_path: &Path, config: &InferenceConfig) -> VisionResult<Session> {
    info!("[model] loading: {}", model_path.display());

    #[allow(unused_mut)]
    let mut builder = Session::builder()?;

    #[cfg(feature = "cuda")]
    {
        if config.use_gpu {
            builder = builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])?;
            info!("[model] using GPU");
        } else {
            info!("[model] using CPU");
        }
    }
    #[cfg(not(feature = "cuda"))]
    {
        if config.use_gpu {
            info!("[model] built without CUDA support, using CPU");
        } else {
            info!("[model] using CPU");
        }
    }

    let session = builder
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(config.intra_threads)?
        .commit_from_file(model_path)?;

    info!("[model] loaded");
    Ok(session)
}

/// Copies an `f32` output tensor into an owned array.
pub fn extract_output(value: &DynValue) -> VisionResult<ArrayD<f32>> {
    let (shape, data) = value.try_extract_tensor::<f32>()?;
    let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
    let view = ArrayViewD::from_shape(IxDyn(&dims), data)?;
    Ok(view.to_owned())
}
