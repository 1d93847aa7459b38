//! Builds the per-frame lane mask from detector output.
//!
//! Segmentation masks are the preferred evidence. Boxes are only painted when
//! every mask came out empty, and then only those at or above the confidence
//! floor. The two sources are never blended.

use crate::error::{VisionError, VisionResult};
use ndarray::{Array2, ArrayView2, ArrayViewD, Axis, Ix3};

/// Probability above which a mask pixel counts as lane. The value itself is
/// background.
pub const MASK_THRESHOLD: f32 = 0.5;

/// Default confidence floor for box evidence.
pub const MIN_CONFIDENCE: f32 = 0.2;

/// Axis-aligned box in frame pixels with the detector's confidence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

impl ScoredBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            confidence,
        }
    }

    pub fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    pub fn iou(&self, other: &ScoredBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);

        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// Lane evidence for one frame, already validated.
#[derive(Debug, Clone)]
pub enum DetectorOutput {
    /// Per-detection probability masks. Boxes ride along for the fallback.
    Masks {
        masks: Vec<Array2<f32>>,
        boxes: Vec<ScoredBox>,
    },
    Boxes(Vec<ScoredBox>),
    Empty,
}

impl DetectorOutput {
    pub fn from_parts(masks: Vec<Array2<f32>>, boxes: Vec<ScoredBox>) -> Self {
        if !masks.is_empty() {
            DetectorOutput::Masks { masks, boxes }
        } else if !boxes.is_empty() {
            DetectorOutput::Boxes(boxes)
        } else {
            DetectorOutput::Empty
        }
    }

    pub fn boxes(&self) -> &[ScoredBox] {
        match self {
            DetectorOutput::Masks { boxes, .. } | DetectorOutput::Boxes(boxes) => boxes.as_slice(),
            DetectorOutput::Empty => &[],
        }
    }
}

/// Validates a raw mask stack and splits it into one grid per detection.
///
/// Accepts `(N, H, W)` or `(1, N, H, W)`. Anything else is reported as
/// [`VisionError::MalformedOutput`] so the caller can log it and fall back to
/// boxes.
pub fn parse_mask_stack(raw: ArrayViewD<'_, f32>) -> VisionResult<Vec<Array2<f32>>> {
    let raw = match raw.ndim() {
        3 => raw,
        4 if raw.shape()[0] == 1 => raw.index_axis_move(Axis(0), 0),
        n => {
            return Err(VisionError::MalformedOutput(format!(
                "mask stack has rank {} with shape {:?}, expected (N, H, W)",
                n,
                raw.shape()
            )))
        }
    };

    let stack = raw
        .into_dimensionality::<Ix3>()
        .map_err(|e| VisionError::MalformedOutput(e.to_string()))?;

    let (_, h, w) = stack.dim();
    if h == 0 || w == 0 {
        return Err(VisionError::MalformedOutput(format!(
            "mask stack has empty spatial size {}x{}",
            w, h
        )));
    }

    Ok(stack
        .axis_iter(Axis(0))
        .map(|mask| mask.to_owned())
        .collect())
}

/// Thresholds a probability grid into `{0, 1}` with a strict `>` comparison.
pub fn binarize(mask: ArrayView2<'_, f32>, threshold: f32) -> Array2<u8> {
    mask.mapv(|p| u8::from(p > threshold))
}

/// Nearest-neighbour resize using the same index rule as OpenCV's
/// `INTER_NEAREST`: `src = floor(dst * src_len / dst_len)`.
pub fn resize_nearest(mask: ArrayView2<'_, u8>, height: usize, width: usize) -> Array2<u8> {
    let (src_h, src_w) = mask.dim();
    if src_h == 0 || src_w == 0 {
        return Array2::zeros((height, width));
    }

    Array2::from_shape_fn((height, width), |(y, x)| {
        let sy = (y * src_h / height).min(src_h - 1);
        let sx = (x * src_w / width).min(src_w - 1);
        mask[[sy, sx]]
    })
}

/// Paints `bbox` into `mask` as a filled rectangle.
///
/// Corners are inclusive and truncated toward zero. The rectangle is clipped
/// to the grid; a box entirely outside leaves the mask untouched.
pub fn fill_box(mask: &mut Array2<u8>, bbox: &ScoredBox) {
    let (h, w) = mask.dim();
    if h == 0 || w == 0 {
        return;
    }

    let (mut x1, mut x2) = (bbox.x1 as i64, bbox.x2 as i64);
    let (mut y1, mut y2) = (bbox.y1 as i64, bbox.y2 as i64);
    if x1 > x2 {
        std::mem::swap(&mut x1, &mut x2);
    }
    if y1 > y2 {
        std::mem::swap(&mut y1, &mut y2);
    }

    let (max_x, max_y) = (w as i64 - 1, h as i64 - 1);
    if x2 < 0 || y2 < 0 || x1 > max_x || y1 > max_y {
        return;
    }

    let (x1, x2) = (x1.max(0) as usize, x2.min(max_x) as usize);
    let (y1, y2) = (y1.max(0) as usize, y2.min(max_y) as usize);
    mask.slice_mut(ndarray::s![y1..=y2, x1..=x2]).fill(1);
}

/// Combines the frame's detector output into one binary mask of
/// `height x width`.
///
/// # Arguments
/// * `output` - validated detector output for the frame
/// * `min_confidence` - boxes below this score are dropped entirely
///
/// # Returns
/// A `{0, 1}` grid. It is all zero only when no mask had a positive pixel and
/// no box reached `min_confidence`.
pub fn compose_lane_mask(
    output: &DetectorOutput,
    height: usize,
    width: usize,
    min_confidence: f32,
) -> Array2<u8> {
    let mut combined = Array2::<u8>::zeros((height, width));

    // (1) masks first
    if let DetectorOutput::Masks { masks, .. } = output {
        for mask in masks {
            let mut bin = binarize(mask.view(), MASK_THRESHOLD);
            if bin.dim() != (height, width) {
                bin = resize_nearest(bin.view(), height, width);
            }
            combined.zip_mut_with(&bin, |c, &b| *c |= b);
        }
    }

    // (2) boxes only if the masks gave nothing
    if combined.iter().all(|&v| v == 0) {
        for bbox in output.boxes() {
            if bbox.confidence < min_confidence {
                continue;
            }
            fill_box(&mut combined, bbox);
        }
    }

    combined
}

/// Number of lane pixels in a combined mask.
pub fn mask_pixels(mask: &Array2<u8>) -> usize {
    mask.iter().filter(|&&v| v != 0).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array3, ArrayD, IxDyn};

    fn single_pixel_mask(h: usize, w: usize, y: usize, x: usize) -> Array2<f32> {
        let mut m = Array2::zeros((h, w));
        m[[y, x]] = 0.9;
        m
    }

    #[test]
    fn union_of_masks_is_pixelwise_or() {
        let a = array![[0.9f32, 0.0, 0.0], [0.0, 0.0, 0.7]];
        let b = array![[0.0f32, 0.8, 0.0], [0.0, 0.0, 0.6]];
        let output = DetectorOutput::from_parts(vec![a.clone(), b.clone()], vec![]);

        let combined = compose_lane_mask(&output, 2, 3, MIN_CONFIDENCE);
        for ((y, x), &v) in combined.indexed_iter() {
            let expected = a[[y, x]] > 0.5 || b[[y, x]] > 0.5;
            assert_eq!(v == 1, expected, "pixel ({}, {})", x, y);
        }
    }

    #[test]
    fn exactly_half_is_background() {
        let mask = array![[0.5f32, 0.5000001], [0.49, 1.0]];
        let bin = binarize(mask.view(), MASK_THRESHOLD);
        assert_eq!(bin, array![[0u8, 1], [0, 1]]);
    }

    #[test]
    fn any_positive_mask_pixel_preempts_boxes() {
        let mask = single_pixel_mask(20, 20, 3, 4);
        let boxes = vec![
            ScoredBox::new(0.0, 0.0, 19.0, 9.0, 0.95),
            ScoredBox::new(0.0, 10.0, 19.0, 19.0, 0.9),
        ];
        let output = DetectorOutput::from_parts(vec![mask], boxes);

        let combined = compose_lane_mask(&output, 20, 20, MIN_CONFIDENCE);
        assert_eq!(mask_pixels(&combined), 1);
        assert_eq!(combined[[3, 4]], 1);
    }

    #[test]
    fn empty_masks_fall_back_to_boxes() {
        let mask = Array2::from_elem((10, 10), 0.1f32);
        let boxes = vec![ScoredBox::new(2.0, 3.0, 4.0, 5.0, 0.5)];
        let output = DetectorOutput::from_parts(vec![mask], boxes);

        let combined = compose_lane_mask(&output, 10, 10, MIN_CONFIDENCE);
        assert_eq!(mask_pixels(&combined), 9);
        assert_eq!(combined[[3, 2]], 1);
        assert_eq!(combined[[5, 4]], 1);
        assert_eq!(combined[[6, 4]], 0);
    }

    #[test]
    fn confidence_floor_is_inclusive() {
        let at_floor = DetectorOutput::Boxes(vec![ScoredBox::new(0.0, 0.0, 1.0, 1.0, 0.2)]);
        let below = DetectorOutput::Boxes(vec![ScoredBox::new(0.0, 0.0, 1.0, 1.0, 0.199999)]);

        assert_eq!(mask_pixels(&compose_lane_mask(&at_floor, 4, 4, 0.2)), 4);
        assert_eq!(mask_pixels(&compose_lane_mask(&below, 4, 4, 0.2)), 0);
    }

    #[test]
    fn empty_output_gives_zero_mask() {
        let combined = compose_lane_mask(&DetectorOutput::Empty, 5, 7, MIN_CONFIDENCE);
        assert_eq!(combined.dim(), (5, 7));
        assert_eq!(mask_pixels(&combined), 0);
    }

    #[test]
    fn half_resolution_mask_resizes_without_fractional_values() {
        let mut half = Array2::<f32>::zeros((4, 6));
        half[[1, 2]] = 0.8;
        half[[3, 5]] = 0.6;
        let output = DetectorOutput::from_parts(vec![half], vec![]);

        let combined = compose_lane_mask(&output, 8, 12, MIN_CONFIDENCE);
        assert_eq!(combined.dim(), (8, 12));
        assert!(combined.iter().all(|&v| v == 0 || v == 1));
        // each source pixel becomes a 2x2 block
        assert_eq!(mask_pixels(&combined), 8);
        assert_eq!(combined[[2, 4]], 1);
        assert_eq!(combined[[3, 5]], 1);
        assert_eq!(combined[[7, 11]], 1);
    }

    #[test]
    fn resize_nearest_follows_floor_rule() {
        let src = array![[1u8, 0, 1]];
        let out = resize_nearest(src.view(), 1, 5);
        // floor(x * 3 / 5) = 0, 0, 1, 1, 2
        assert_eq!(out, array![[1u8, 1, 0, 0, 1]]);
    }

    #[test]
    fn boxes_are_clipped_and_normalized() {
        let mut mask = Array2::<u8>::zeros((4, 4));
        fill_box(&mut mask, &ScoredBox::new(10.0, 2.0, -5.0, 1.0, 1.0));
        assert_eq!(mask_pixels(&mask), 8);
        assert_eq!(mask[[1, 0]], 1);
        assert_eq!(mask[[2, 3]], 1);

        let mut untouched = Array2::<u8>::zeros((4, 4));
        fill_box(&mut untouched, &ScoredBox::new(5.0, 5.0, 9.0, 9.0, 1.0));
        assert_eq!(mask_pixels(&untouched), 0);
    }

    #[test]
    fn variant_follows_available_evidence() {
        let b = ScoredBox::new(0.0, 0.0, 1.0, 1.0, 0.5);
        assert!(matches!(
            DetectorOutput::from_parts(vec![Array2::zeros((2, 2))], vec![b]),
            DetectorOutput::Masks { .. }
        ));
        assert!(matches!(
            DetectorOutput::from_parts(vec![], vec![b]),
            DetectorOutput::Boxes(_)
        ));
        assert!(matches!(
            DetectorOutput::from_parts(vec![], vec![]),
            DetectorOutput::Empty
        ));
    }

    #[test]
    fn mask_stack_accepts_batched_and_unbatched() {
        let unbatched = Array3::<f32>::zeros((2, 4, 5)).into_dyn();
        assert_eq!(parse_mask_stack(unbatched.view()).unwrap().len(), 2);

        let batched = ArrayD::<f32>::zeros(IxDyn(&[1, 3, 4, 5]));
        let masks = parse_mask_stack(batched.view()).unwrap();
        assert_eq!(masks.len(), 3);
        assert_eq!(masks[0].dim(), (4, 5));
    }

    #[test]
    fn malformed_mask_stack_is_reported() {
        let flat = ArrayD::<f32>::zeros(IxDyn(&[16]));
        assert!(matches!(
            parse_mask_stack(flat.view()),
            Err(VisionError::MalformedOutput(_))
        ));

        let degenerate = ArrayD::<f32>::zeros(IxDyn(&[2, 0, 5]));
        assert!(matches!(
            parse_mask_stack(degenerate.view()),
            Err(VisionError::MalformedOutput(_))
        ));

        let wide_batch = ArrayD::<f32>::zeros(IxDyn(&[2, 1, 4, 4]));
        assert!(parse_mask_stack(wide_batch.view()).is_err());
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = ScoredBox::new(0.0, 0.0, 10.0, 10.0, 0.9);
        let b = ScoredBox::new(20.0, 20.0, 30.0, 30.0, 0.9);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&b), 0.0);
    }
}
