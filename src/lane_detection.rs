use crate::capture::{show_and_poll, FrameSource, KEY_ESC};
use crate::config::Config;
use crate::error::{VisionError, VisionResult};
use crate::lane_mask::{compose_lane_mask, mask_pixels, DetectorOutput, ScoredBox};
use crate::segmentation::{Detection, LaneSegmenter};
use ndarray::Array2;
use opencv::{
    core::{self, Mat, Point, Rect, Scalar, Vector, CV_8UC3},
    highgui, imgproc,
    prelude::*,
};
use std::time::Instant;
use tracing::{debug, info, warn};

const WINDOW_NAME: &str = "Lane Detection - ESC to quit";

/// Width of the status panel appended to the right of the frame.
const PANEL_WIDTH: i32 = 300;

fn lane_color() -> Scalar {
    Scalar::new(0.0, 255.0, 0.0, 0.0)
}

fn label_color() -> Scalar {
    Scalar::new(0.0, 200.0, 255.0, 0.0)
}

/// Lane segmentation overlay: model, thresholds and loop state.
///
/// # Fields
///
/// - `segmenter`: the ONNX segmentation model
/// - `model_name`: file name shown in the status panel
/// - `min_confidence`: floor for box evidence and labels
/// - `overlay_alpha`: weight of the lane colour when blending
/// - `exit_flag`: set once ESC is seen
pub struct Pipeline {
    segmenter: LaneSegmenter,
    model_name: String,
    min_confidence: f32,
    overlay_alpha: f64,

    /// Set when the main loop should stop
    pub(crate) exit_flag: bool,
}

impl Pipeline {
    /// Loads the segmentation model named in `config.lane`.
    ///
    /// # Errors
    /// - The model file is missing or ONNX Runtime rejects it.
    pub fn new(config: &Config) -> VisionResult<Self> {
        let model_path = config.resolve(&config.lane.model_path);
        let segmenter = LaneSegmenter::new(&model_path, &config.lane, &config.inference)?;

        let model_name = model_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| config.lane.model_path.clone());

        Ok(Self {
            segmenter,
            model_name,
            min_confidence: config.lane.min_confidence,
            overlay_alpha: config.lane.overlay_alpha,
            exit_flag: false,
        })
    }

    /// Runs the model on one frame and returns the composite to display.
    ///
    /// # Steps
    /// 1. Inference. Output the decoder cannot read is logged and the frame
    ///    is treated as having no detections.
    /// 2. Combined lane mask from masks, or from boxes when masks are empty.
    /// 3. Mask blended over the frame.
    /// 4. Boxes and labels for detections above the confidence floor.
    /// 5. Status panel appended on the right.
    pub fn processing(&mut self, frame: &Mat) -> VisionResult<Mat> {
        let (h, w) = (frame.rows(), frame.cols());

        // (1) inference
        let detections = match self.segmenter.detect(frame) {
            Ok(detections) => detections,
            Err(VisionError::MalformedOutput(reason)) => {
                warn!("unreadable detector output: {}", reason);
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        // (2) combined lane mask
        let output = detector_output(&detections);
        let combined = compose_lane_mask(&output, h as usize, w as usize, self.min_confidence);
        let lane_pixels = mask_pixels(&combined);
        debug!("{} detections, {} lane pixels", detections.len(), lane_pixels);

        // (3) overlay
        let mut frame_out = if lane_pixels > 0 {
            let mask = mask_to_mat(&combined)?;
            overlay_mask(frame, &mask, lane_color(), self.overlay_alpha)?
        } else {
            frame.try_clone()?
        };

        // (4) labels
        let segmenter = &self.segmenter;
        let labels = format_labels(&detections, self.min_confidence, |id| segmenter.class_name(id));
        if !labels.is_empty() {
            draw_detections(&mut frame_out, &detections, &labels.join(" | "))?;
        }

        // (5) status panel
        let panel = status_panel(h, lane_pixels, &self.model_name)?;
        let mut merged = Mat::default();
        hconcat_2(&frame_out, &panel, &mut merged)?;
        Ok(merged)
    }

    /// Opens camera `device_index` and runs the overlay until ESC is pressed
    /// or the camera stops delivering frames.
    pub fn start_detection(&mut self, device_index: i32, config: &Config) -> VisionResult<()> {
        let mut source = FrameSource::open(device_index, &config.camera)?;
        highgui::named_window(WINDOW_NAME, highgui::WINDOW_AUTOSIZE)?;

        info!("Press ESC to quit.");
        while let Some(frame) = source.next_frame() {
            let start_time = Instant::now();
            let merged = self.processing(&frame)?;

            if show_and_poll(WINDOW_NAME, &merged, KEY_ESC)? {
                self.exit_flag = true;
            }

            debug!("frame time {:.1} ms", start_time.elapsed().as_secs_f32() * 1000.0);

            if self.exit_flag {
                break;
            }
        }

        source.release()?;
        highgui::destroy_all_windows()?;
        Ok(())
    }
}

/// Splits decoded detections into the mask/box evidence used for compositing.
pub fn detector_output(detections: &[Detection]) -> DetectorOutput {
    let masks = detections
        .iter()
        .filter_map(|d| d.mask.clone())
        .collect::<Vec<_>>();
    let boxes = detections.iter().map(|d| d.bbox).collect::<Vec<_>>();
    DetectorOutput::from_parts(masks, boxes)
}

/// `"<name> <conf>"` for every detection at or above `min_confidence`.
pub fn format_labels(
    detections: &[Detection],
    min_confidence: f32,
    class_name: impl Fn(usize) -> String,
) -> Vec<String> {
    detections
        .iter()
        .filter(|d| d.bbox.confidence >= min_confidence)
        .map(|d| format!("{} {:.2}", class_name(d.class_id), d.bbox.confidence))
        .collect()
}

/// Single-channel `CV_8U` copy of a `{0, 1}` mask.
pub fn mask_to_mat(mask: &Array2<u8>) -> VisionResult<Mat> {
    let (h, w) = mask.dim();
    let data = mask.as_standard_layout();
    let slice = data
        .as_slice()
        .ok_or_else(|| VisionError::MalformedOutput("mask is not contiguous".to_string()))?;
    let mat = Mat::new_rows_cols_with_data(h as i32, w as i32, slice)?;
    Ok(mat.try_clone()?)
}

/// Blends `color` into `frame` with weight `alpha` wherever `mask` is non-zero.
/// Pixels outside the mask are copied unchanged.
pub fn overlay_mask(frame: &Mat, mask: &Mat, color: Scalar, alpha: f64) -> VisionResult<Mat> {
    let color_layer = Mat::new_size_with_default(frame.size()?, frame.typ(), color)?;

    let mut blended = Mat::default();
    core::add_weighted(frame, 1.0 - alpha, &color_layer, alpha, 0.0, &mut blended, -1)?;

    let mut out = frame.try_clone()?;
    blended.copy_to_masked(&mut out, mask)?;
    Ok(out)
}

/// Outline rectangle for a box, corners put in order and truncated toward zero.
fn detection_rect(bbox: &ScoredBox) -> Rect {
    let (x1, x2) = (bbox.x1.min(bbox.x2) as i32, bbox.x1.max(bbox.x2) as i32);
    let (y1, y2) = (bbox.y1.min(bbox.y2) as i32, bbox.y1.max(bbox.y2) as i32);
    Rect::new(x1, y1, (x2 - x1).max(1), (y2 - y1).max(1))
}

/// Outlines every detection and writes the joined label line at the top left.
fn draw_detections(img: &mut Mat, detections: &[Detection], text: &str) -> VisionResult<()> {
    for d in detections {
        imgproc::rectangle(img, detection_rect(&d.bbox), label_color(), 2, imgproc::LINE_8, 0)?;
    }

    imgproc::put_text(
        img,
        text,
        Point::new(10, 30),
        imgproc::FONT_HERSHEY_SIMPLEX,
        0.6,
        label_color(),
        2,
        imgproc::LINE_8,
        false,
    )?;
    Ok(())
}

/// Light grey side panel with the lane pixel count and the model file name.
pub fn status_panel(height: i32, lane_pixels: usize, model_name: &str) -> VisionResult<Mat> {
    let mut panel = Mat::new_rows_cols_with_default(
        height,
        PANEL_WIDTH,
        CV_8UC3,
        Scalar::new(240.0, 240.0, 240.0, 0.0),
    )?;

    imgproc::put_text(
        &mut panel,
        &format!("Mask pixels: {}", lane_pixels),
        Point::new(10, 40),
        imgproc::FONT_HERSHEY_SIMPLEX,
        0.7,
        Scalar::new(30.0, 30.0, 30.0, 0.0),
        2,
        imgproc::LINE_8,
        false,
    )?;
    imgproc::put_text(
        &mut panel,
        &format!("Model: {}", model_name),
        Point::new(10, 80),
        imgproc::FONT_HERSHEY_SIMPLEX,
        0.5,
        Scalar::new(50.0, 50.0, 50.0, 0.0),
        1,
        imgproc::LINE_8,
        false,
    )?;
    Ok(panel)
}

/// Concatenates two images side by side into `dst`.
fn hconcat_2(img1: &Mat, img2: &Mat, dst: &mut Mat) -> VisionResult<()> {
    let mut srcs: Vector<Mat> = Vector::new();
    srcs.push(img1.clone());
    srcs.push(img2.clone());
    core::hconcat(&srcs, dst)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::Vec3b;

    fn detection(confidence: f32, class_id: usize, mask: Option<Array2<f32>>) -> Detection {
        Detection {
            bbox: ScoredBox::new(1.0, 1.0, 3.0, 3.0, confidence),
            class_id,
            mask,
        }
    }

    fn grey_frame(rows: i32, cols: i32) -> Mat {
        Mat::new_rows_cols_with_default(rows, cols, CV_8UC3, Scalar::new(100.0, 100.0, 100.0, 0.0))
            .unwrap()
    }

    #[test]
    fn labels_skip_detections_below_floor() {
        let detections = vec![detection(0.87, 0, None), detection(0.1, 1, None), detection(0.2, 1, None)];
        let names = ["lane", "edge"];

        let labels = format_labels(&detections, 0.2, |id| names[id].to_string());
        assert_eq!(labels, vec!["lane 0.87".to_string(), "edge 0.20".to_string()]);
    }

    #[test]
    fn detector_output_keeps_boxes_alongside_masks() {
        let detections = vec![
            detection(0.9, 0, Some(Array2::zeros((2, 2)))),
            detection(0.5, 0, None),
        ];
        match detector_output(&detections) {
            DetectorOutput::Masks { masks, boxes } => {
                assert_eq!(masks.len(), 1);
                assert_eq!(boxes.len(), 2);
            }
            other => panic!("expected masks, got {:?}", other),
        }

        assert!(matches!(
            detector_output(&[detection(0.9, 0, None)]),
            DetectorOutput::Boxes(_)
        ));
        assert!(matches!(detector_output(&[]), DetectorOutput::Empty));
    }

    #[test]
    fn overlay_only_touches_masked_pixels() {
        let frame = grey_frame(4, 4);
        let mut mask = Array2::<u8>::zeros((4, 4));
        mask[[1, 2]] = 1;

        let out = overlay_mask(&frame, &mask_to_mat(&mask).unwrap(), lane_color(), 0.4).unwrap();

        let blended = *out.at_2d::<Vec3b>(1, 2).unwrap();
        assert_eq!(blended.0, [60, 162, 60]);
        let untouched = *out.at_2d::<Vec3b>(2, 1).unwrap();
        assert_eq!(untouched.0, [100, 100, 100]);
    }

    #[test]
    fn outline_normalises_inverted_corners() {
        let forward = detection_rect(&ScoredBox::new(10.7, 20.2, 50.9, 40.0, 0.9));
        let inverted = detection_rect(&ScoredBox::new(50.9, 40.0, 10.7, 20.2, 0.9));
        assert_eq!(forward, Rect::new(10, 20, 40, 20));
        assert_eq!(inverted, forward);

        let flat = detection_rect(&ScoredBox::new(5.0, 5.0, 5.0, 5.0, 0.9));
        assert_eq!((flat.width, flat.height), (1, 1));
    }

    #[test]
    fn mask_mat_matches_array() {
        let mut mask = Array2::<u8>::zeros((3, 5));
        mask[[2, 4]] = 1;
        let mat = mask_to_mat(&mask).unwrap();

        assert_eq!((mat.rows(), mat.cols()), (3, 5));
        assert_eq!(*mat.at_2d::<u8>(2, 4).unwrap(), 1);
        assert_eq!(*mat.at_2d::<u8>(0, 0).unwrap(), 0);
    }

    #[test]
    fn panel_is_appended_on_the_right() {
        let frame = grey_frame(48, 64);
        let panel = status_panel(48, 12, "lane_seg.onnx").unwrap();
        let mut merged = Mat::default();
        hconcat_2(&frame, &panel, &mut merged).unwrap();

        assert_eq!(merged.rows(), 48);
        assert_eq!(merged.cols(), 64 + PANEL_WIDTH);
        let corner = *merged.at_2d::<Vec3b>(47, 64 + PANEL_WIDTH - 1).unwrap();
        assert_eq!(corner.0, [240, 240, 240]);
    }
}
