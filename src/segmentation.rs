//! YOLO segmentation network run through ONNX Runtime.
//!
//! Expects an Ultralytics export: `output0` is `[1, 4 + nc + nm, anchors]` and,
//! for segmentation models, `output1` holds `nm` mask prototypes. Detection-only
//! exports have a single output and produce boxes without masks.

use crate::config::{InferenceConfig, LaneConfig};
use crate::error::{VisionError, VisionResult};
use crate::inference::{build_session, extract_output};
use crate::lane_mask::{parse_mask_stack, ScoredBox};
use ndarray::{s, Array2, Array4, ArrayD, ArrayView2, ArrayView3, Axis, Ix2};
use opencv::core::AlgorithmHint::ALGO_HINT_DEFAULT;
use opencv::{
    core::{self, Mat, Scalar, Size},
    imgproc,
    prelude::*,
};
use ort::session::Session;
use ort::value::Tensor;
use std::cmp::Ordering;
use std::path::Path;
use tracing::{debug, info, warn};

/// Mask coefficients per anchor in YOLOv8/YOLO11 segmentation heads.
const MASK_COEFFICIENTS: usize = 32;

/// Metadata indices at or above this are treated as corrupt.
const MAX_CLASS_NAMES: usize = 4096;

/// Grey used for letterbox padding, as in Ultralytics training.
const PAD_VALUE: f64 = 114.0;

/// One decoded detection.
#[derive(Debug, Clone)]
pub struct Detection {
    /// Box in frame pixels
    pub bbox: ScoredBox,
    pub class_id: usize,
    /// Probability mask over the frame area at network input scale, padding
    /// already cropped away
    pub mask: Option<Array2<f32>>,
}

/// Placement of a frame inside the square network input.
///
/// The frame is scaled by `scale` to `width x height`, keeping its aspect
/// ratio, and centred with `left` columns and `top` rows of padding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub input_size: usize,
    pub frame_width: usize,
    pub frame_height: usize,
    pub scale: f32,
    pub width: usize,
    pub height: usize,
    pub left: usize,
    pub top: usize,
}

impl Letterbox {
    pub fn fit(frame_width: usize, frame_height: usize, input_size: usize) -> Self {
        let (fw, fh) = (frame_width.max(1) as f32, frame_height.max(1) as f32);
        let target = input_size as f32;
        let scale = (target / fw).min(target / fh);

        let width = ((fw * scale).round() as usize).min(input_size).max(1);
        let height = ((fh * scale).round() as usize).min(input_size).max(1);
        let left = (input_size.saturating_sub(width) as f32 / 2.0 - 0.1).round().max(0.0) as usize;
        let top = (input_size.saturating_sub(height) as f32 / 2.0 - 0.1).round().max(0.0) as usize;

        Self {
            input_size,
            frame_width,
            frame_height,
            scale,
            width,
            height,
            left,
            top,
        }
    }

    /// Maps a box from network input pixels to frame pixels, clipped to the
    /// frame.
    pub fn to_frame(&self, bbox: &ScoredBox) -> ScoredBox {
        let fx = |x: f32| ((x - self.left as f32) / self.scale).clamp(0.0, self.frame_width as f32);
        let fy = |y: f32| ((y - self.top as f32) / self.scale).clamp(0.0, self.frame_height as f32);
        ScoredBox::new(fx(bbox.x1), fy(bbox.y1), fx(bbox.x2), fy(bbox.y2), bbox.confidence)
    }
}

/// Geometry and thresholds needed to turn raw predictions into detections.
#[derive(Debug, Clone, Copy)]
pub struct DecodeParams {
    pub letterbox: Letterbox,
    pub confidence: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
}

struct Candidate {
    /// Box in model input pixels
    bbox: ScoredBox,
    class_id: usize,
    anchor: usize,
}

/// ONNX lane segmentation model plus the settings needed to decode it.
pub struct LaneSegmenter {
    session: Session,
    input_name: String,
    output_count: usize,
    class_names: Vec<String>,
    input_size: usize,
    confidence: f32,
    iou_threshold: f32,
    max_detections: usize,
}

impl LaneSegmenter {
    /// Loads the model and reads its class names.
    ///
    /// Names come from the `names` metadata Ultralytics writes into its
    /// exports; `lane.class_names` is used when the model has none.
    pub fn new(model_path: &Path, lane: &LaneConfig, inference: &InferenceConfig) -> VisionResult<Self> {
        let session = build_session(model_path, inference)?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .unwrap_or_else(|| "images".to_string());
        let output_count = session.outputs.len();

        let mut class_names = session
            .metadata()
            .ok()
            .and_then(|meta| meta.custom("names").ok().flatten())
            .map(|names| parse_class_names(&names))
            .unwrap_or_default();
        if class_names.is_empty() {
            class_names = lane.class_names.clone();
        }

        info!(
            "[model] input '{}', {} output(s), classes: {:?}",
            input_name, output_count, class_names
        );

        Ok(Self {
            session,
            input_name,
            output_count,
            class_names,
            input_size: lane.input_size,
            confidence: lane.detector_confidence,
            iou_threshold: lane.iou_threshold,
            max_detections: lane.max_detections,
        })
    }

    pub fn class_name(&self, class_id: usize) -> String {
        self.class_names
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| class_id.to_string())
    }

    /// Letterboxes the BGR frame into the square model input and builds the
    /// `[1, 3, S, S]` RGB tensor scaled to `[0, 1]`.
    pub fn preprocess(&self, frame: &Mat) -> VisionResult<(Array4<f32>, Letterbox)> {
        let lb = Letterbox::fit(frame.cols() as usize, frame.rows() as usize, self.input_size);

        let mut resized = Mat::default();
        imgproc::resize(
            frame,
            &mut resized,
            Size::new(lb.width as i32, lb.height as i32),
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )?;

        let bottom = self.input_size.saturating_sub(lb.height + lb.top);
        let right = self.input_size.saturating_sub(lb.width + lb.left);
        let mut padded = Mat::default();
        core::copy_make_border(
            &resized,
            &mut padded,
            lb.top as i32,
            bottom as i32,
            lb.left as i32,
            right as i32,
            core::BORDER_CONSTANT,
            Scalar::all(PAD_VALUE),
        )?;

        let mut rgb = Mat::default();
        imgproc::cvt_color(&padded, &mut rgb, imgproc::COLOR_BGR2RGB, 0, ALGO_HINT_DEFAULT)?;

        Ok((hwc_to_nchw(rgb.data_bytes()?, self.input_size)?, lb))
    }

    /// Runs the network on one frame.
    ///
    /// Outputs that cannot be read as `f32` tensors are reported as
    /// [`VisionError::MalformedOutput`] for predictions, and logged and
    /// ignored for prototypes.
    pub fn detect(&mut self, frame: &Mat) -> VisionResult<Vec<Detection>> {
        let (tensor, letterbox) = self.preprocess(frame)?;
        let input = Tensor::from_array(tensor)?;
        let params = DecodeParams {
            letterbox,
            confidence: self.confidence,
            iou_threshold: self.iou_threshold,
            max_detections: self.max_detections,
        };

        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input])?;

        let preds = extract_output(&outputs[0])
            .map_err(|e| VisionError::MalformedOutput(format!("prediction output: {}", e)))?;
        let (protos, nm) = read_prototypes((self.output_count > 1).then(|| extract_output(&outputs[1])));
        drop(outputs);

        let preds = squeeze_batch(preds)?;
        decode_predictions(preds.view(), nm, protos.as_deref(), &params)
    }
}

/// Validates the optional prototype output.
///
/// Returns the prototype planes, or `None` when the model has none or they
/// cannot be used, together with the number of mask coefficient rows the
/// prediction matrix carries. Any failure reading the prototypes is logged and
/// the frame decodes to boxes only.
pub fn read_prototypes(raw: Option<VisionResult<ArrayD<f32>>>) -> (Option<Vec<Array2<f32>>>, usize) {
    let Some(raw) = raw else {
        return (None, 0);
    };

    match raw.and_then(|protos| parse_mask_stack(protos.view())) {
        Ok(planes) => {
            let nm = planes.len();
            (Some(planes), nm)
        }
        Err(e) => {
            warn!("ignoring mask prototypes: {}", e);
            (None, MASK_COEFFICIENTS)
        }
    }
}

fn squeeze_batch(preds: ArrayD<f32>) -> VisionResult<Array2<f32>> {
    let preds = if preds.ndim() == 3 && preds.shape()[0] == 1 {
        preds.index_axis_move(Axis(0), 0)
    } else {
        preds
    };
    let shape = preds.shape().to_vec();
    preds.into_dimensionality::<Ix2>().map_err(|_| {
        VisionError::MalformedOutput(format!("prediction output has shape {:?}", shape))
    })
}

/// Converts packed RGB bytes (`size x size x 3`) to a normalised NCHW tensor.
pub fn hwc_to_nchw(bytes: &[u8], size: usize) -> VisionResult<Array4<f32>> {
    let hwc = ArrayView3::from_shape((size, size, 3), bytes)?;
    Ok(Array4::from_shape_fn((1, 3, size, size), |(_, c, y, x)| {
        hwc[[y, x, c]] as f32 / 255.0
    }))
}

/// Parses the `names` metadata string, e.g. `{0: 'lane', 1: 'road edge'}`.
///
/// Quoted names may contain commas. Indices missing from the map are filled
/// with their number. An index of [`MAX_CLASS_NAMES`] or more yields an empty
/// list so the caller falls back to configured names.
pub fn parse_class_names(raw: &str) -> Vec<String> {
    let body = raw.trim().trim_start_matches('{').trim_end_matches('}');
    let mut chars = body.chars().peekable();
    let mut entries: Vec<(usize, String)> = Vec::new();

    loop {
        while chars.next_if(|c| c.is_whitespace() || *c == ',').is_some() {}

        let mut digits = String::new();
        while let Some(d) = chars.next_if(|c| c.is_ascii_digit()) {
            digits.push(d);
        }
        if digits.is_empty() {
            break;
        }

        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.next() != Some(':') {
            break;
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let name: String = match chars.next_if(|c| *c == '\'' || *c == '"') {
            Some(quote) => chars.by_ref().take_while(|&c| c != quote).collect(),
            None => {
                let mut bare = String::new();
                while let Some(c) = chars.next_if(|c| *c != ',') {
                    bare.push(c);
                }
                bare.trim().to_string()
            }
        };

        match digits.parse::<usize>() {
            Ok(index) if index < MAX_CLASS_NAMES => entries.push((index, name)),
            _ => return Vec::new(),
        }
    }
    entries.sort_by_key(|(index, _)| *index);

    let len = entries.last().map(|(index, _)| index + 1).unwrap_or(0);
    let mut names: Vec<String> = (0..len).map(|i| i.to_string()).collect();
    for (index, name) in entries {
        names[index] = name;
    }
    names
}

/// Decodes a `(4 + nc + nm, anchors)` prediction matrix.
///
/// # Arguments
/// * `preds` - predictions with the batch axis already removed
/// * `nm` - number of mask coefficient rows at the bottom of `preds`
/// * `protos` - mask prototypes, `None` when absent or unusable
/// * `params` - input geometry and thresholds
///
/// # Returns
/// Detections after class-agnostic NMS, highest confidence first. Masks are
/// only attached when `protos` holds exactly `nm` planes.
pub fn decode_predictions(
    preds: ArrayView2<'_, f32>,
    nm: usize,
    protos: Option<&[Array2<f32>]>,
    params: &DecodeParams,
) -> VisionResult<Vec<Detection>> {
    let (rows, anchors) = preds.dim();
    if rows <= 4 + nm {
        return Err(VisionError::MalformedOutput(format!(
            "prediction matrix has {} rows, need more than {}",
            rows,
            4 + nm
        )));
    }
    let nc = rows - 4 - nm;

    // (1) score filter
    let mut candidates = Vec::new();
    for anchor in 0..anchors {
        let column = preds.column(anchor);
        let (class_id, score) = column
            .slice(s![4..4 + nc])
            .iter()
            .copied()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(Ordering::Equal))
            .unwrap_or((0, 0.0));

        // NaN scores fail this too
        if !(score >= params.confidence) {
            continue;
        }

        let (cx, cy, w, h) = (column[0], column[1], column[2], column[3]);
        candidates.push(Candidate {
            bbox: ScoredBox::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0, score),
            class_id,
            anchor,
        });
    }

    // (2) class-agnostic NMS
    let kept = nms(candidates, params.iou_threshold, params.max_detections);

    // (3) masks, then undo the letterbox on the boxes
    let protos = protos.filter(|planes| nm > 0 && planes.len() == nm);
    let detections: Vec<Detection> = kept
        .into_iter()
        .map(|c| {
            let mask = protos.map(|planes| {
                let coeffs = preds.slice(s![4 + nc.., c.anchor]).to_vec();
                assemble_mask(planes, &coeffs, &c.bbox, &params.letterbox)
            });
            Detection {
                bbox: params.letterbox.to_frame(&c.bbox),
                class_id: c.class_id,
                mask,
            }
        })
        .collect();

    debug!("decoded {} detections from {} anchors", detections.len(), anchors);
    Ok(detections)
}

fn nms(mut candidates: Vec<Candidate>, iou_threshold: f32, max_detections: usize) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.bbox
            .confidence
            .partial_cmp(&a.bbox.confidence)
            .unwrap_or(Ordering::Equal)
    });

    let mut keep: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        if keep.len() >= max_detections {
            break;
        }
        if keep
            .iter()
            .all(|k| k.bbox.iou(&candidate.bbox) <= iou_threshold)
        {
            keep.push(candidate);
        }
    }
    keep
}

/// Linear combination of the prototypes, upsampled bilinearly to input
/// resolution over the unpadded frame area, zeroed outside the detection box
/// and squashed with a sigmoid.
///
/// `bbox` is in network input pixels. The result is `letterbox.height x
/// letterbox.width`.
fn assemble_mask(
    planes: &[Array2<f32>],
    coeffs: &[f32],
    bbox: &ScoredBox,
    letterbox: &Letterbox,
) -> Array2<f32> {
    let (mh, mw) = planes[0].dim();
    let mut logits = Array2::<f32>::zeros((mh, mw));
    for (plane, &k) in planes.iter().zip(coeffs) {
        logits.scaled_add(k, plane);
    }

    let kx = mw as f32 / letterbox.input_size as f32;
    let ky = mh as f32 / letterbox.input_size as f32;

    Array2::from_shape_fn((letterbox.height, letterbox.width), |(y, x)| {
        let ix = (x + letterbox.left) as f32;
        let iy = (y + letterbox.top) as f32;
        if !(ix >= bbox.x1 && ix < bbox.x2 && iy >= bbox.y1 && iy < bbox.y2) {
            return 0.0;
        }
        sigmoid(sample_bilinear(
            logits.view(),
            (iy + 0.5) * ky - 0.5,
            (ix + 0.5) * kx - 0.5,
        ))
    })
}

/// Bilinear sample at fractional `(y, x)`, clamped to the grid edge.
fn sample_bilinear(grid: ArrayView2<'_, f32>, y: f32, x: f32) -> f32 {
    let (h, w) = grid.dim();
    let y = y.clamp(0.0, (h - 1) as f32);
    let x = x.clamp(0.0, (w - 1) as f32);

    let (y0, x0) = (y.floor() as usize, x.floor() as usize);
    let (y1, x1) = ((y0 + 1).min(h - 1), (x0 + 1).min(w - 1));
    let (dy, dx) = (y - y0 as f32, x - x0 as f32);

    grid[[y0, x0]] * (1.0 - dx) * (1.0 - dy)
        + grid[[y0, x1]] * dx * (1.0 - dy)
        + grid[[y1, x0]] * (1.0 - dx) * dy
        + grid[[y1, x1]] * dx * dy
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
