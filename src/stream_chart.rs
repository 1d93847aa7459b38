//! Rolling line chart fed by a synthetic noisy sine wave.

use crate::config::ChartConfig;
use crate::error::VisionResult;
use opencv::{
    core::{Mat, Point, Scalar, Vector, CV_8UC3},
    highgui, imgcodecs, imgproc,
    prelude::*,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::f64::consts::PI;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

const WINDOW_NAME: &str = "Real-Time Graph Streaming";

/// Plot area inset from the canvas edges, in pixels.
const MARGIN: i32 = 40;

/// Fixed-capacity buffer that drops its oldest sample once full.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    pub fn push(&mut self, sample: f64) {
        self.samples.push_back(sample);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples oldest first.
    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().copied()
    }

    /// `(min, max)` of the retained samples.
    pub fn range(&self) -> Option<(f64, f64)> {
        self.iter().fold(None, |acc, v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
    }
}

/// Endless `sin(i * frequency) + N(0, noise_std)` sequence.
pub struct SineStream<R: Rng> {
    step: u64,
    frequency: f64,
    noise_std: f64,
    rng: R,
}

impl SineStream<StdRng> {
    pub fn new(frequency: f64, noise_std: f64) -> Self {
        Self::with_rng(frequency, noise_std, StdRng::from_entropy())
    }

    pub fn seeded(frequency: f64, noise_std: f64, seed: u64) -> Self {
        Self::with_rng(frequency, noise_std, StdRng::seed_from_u64(seed))
    }
}

impl<R: Rng> SineStream<R> {
    pub fn with_rng(frequency: f64, noise_std: f64, rng: R) -> Self {
        Self {
            step: 0,
            frequency,
            noise_std,
            rng,
        }
    }

    /// Standard normal draw (Box-Muller).
    fn gaussian(&mut self) -> f64 {
        let u1: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = self.rng.gen();
        (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
    }
}

impl<R: Rng> Iterator for SineStream<R> {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        let clean = (self.step as f64 * self.frequency).sin();
        let noise = if self.noise_std > 0.0 {
            self.gaussian() * self.noise_std
        } else {
            0.0
        };
        self.step += 1;
        Some(clean + noise)
    }
}

/// Maps the window's samples to pixel positions inside the plot area.
///
/// Sample `i` sits at `i / (capacity - 1)` of the plot width so the line grows
/// from the left until the window is full. The y axis spans `range`, padded
/// by 10% so the line never touches the border.
pub fn chart_points(window: &RollingWindow, width: i32, height: i32) -> Vec<Point> {
    let Some((lo, hi)) = window.range() else {
        return Vec::new();
    };
    let pad = ((hi - lo) * 0.1).max(1e-6);
    let (lo, hi) = (lo - pad, hi + pad);

    let plot_w = (width - 2 * MARGIN).max(1) as f64;
    let plot_h = (height - 2 * MARGIN).max(1) as f64;
    let slots = window.capacity().saturating_sub(1).max(1) as f64;

    window
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let x = MARGIN as f64 + plot_w * i as f64 / slots;
            let y = MARGIN as f64 + plot_h * (hi - v) / (hi - lo);
            Point::new(x.round() as i32, y.round() as i32)
        })
        .collect()
}

/// Draws the window as a line chart on a white canvas.
pub fn render_chart(window: &RollingWindow, width: i32, height: i32) -> VisionResult<Mat> {
    let mut canvas = Mat::new_rows_cols_with_default(
        height,
        width,
        CV_8UC3,
        Scalar::new(255.0, 255.0, 255.0, 0.0),
    )?;
    let axis = Scalar::new(160.0, 160.0, 160.0, 0.0);

    // axes
    imgproc::line(
        &mut canvas,
        Point::new(MARGIN, height - MARGIN),
        Point::new(width - MARGIN, height - MARGIN),
        axis,
        1,
        imgproc::LINE_8,
        0,
    )?;
    imgproc::line(
        &mut canvas,
        Point::new(MARGIN, MARGIN),
        Point::new(MARGIN, height - MARGIN),
        axis,
        1,
        imgproc::LINE_8,
        0,
    )?;

    let points = chart_points(window, width, height);
    if points.len() > 1 {
        let mut polyline: Vector<Vector<Point>> = Vector::new();
        polyline.push(Vector::from_iter(points));
        imgproc::polylines(
            &mut canvas,
            &polyline,
            false,
            Scalar::new(180.0, 119.0, 31.0, 0.0),
            2,
            imgproc::LINE_AA,
            0,
        )?;
    }

    if let Some((lo, hi)) = window.range() {
        let caption = format!("n={}  min={:.2}  max={:.2}", window.len(), lo, hi);
        imgproc::put_text(
            &mut canvas,
            &caption,
            Point::new(MARGIN, MARGIN - 12),
            imgproc::FONT_HERSHEY_SIMPLEX,
            0.5,
            Scalar::new(50.0, 50.0, 50.0, 0.0),
            1,
            imgproc::LINE_AA,
            false,
        )?;
    }

    Ok(canvas)
}

/// Streams `config.iterations` samples into the chart, one every
/// `config.interval_ms`. Key presses are ignored; the run always completes.
pub fn run(config: &ChartConfig) -> VisionResult<()> {
    let mut window = RollingWindow::new(config.capacity);
    let stream = SineStream::new(config.frequency, config.noise_std);
    let interval = Duration::from_millis(config.interval_ms);

    if config.show_window {
        highgui::named_window(WINDOW_NAME, highgui::WINDOW_AUTOSIZE)?;
    }
    info!(
        "streaming {} samples, keeping the last {}",
        config.iterations, config.capacity
    );

    let mut chart = Mat::default();
    for (i, sample) in stream.take(config.iterations).enumerate() {
        window.push(sample);
        debug!("sample {}: {:.4}", i, sample);

        chart = render_chart(&window, config.width, config.height)?;
        if config.show_window {
            highgui::imshow(WINDOW_NAME, &chart)?;
            let _ = highgui::poll_key()?;
        }

        thread::sleep(interval);
    }

    if let Some(path) = &config.snapshot_path {
        imgcodecs::imwrite(path, &chart, &Vector::new())?;
        info!("chart written to {}", path);
    }

    if config.show_window {
        highgui::destroy_all_windows()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_keeps_the_most_recent_samples() {
        let mut window = RollingWindow::new(50);
        for i in 1..=75 {
            window.push(i as f64);
        }

        assert_eq!(window.len(), 50);
        let kept: Vec<f64> = window.iter().collect();
        let expected: Vec<f64> = (26..=75).map(|i| i as f64).collect();
        assert_eq!(kept, expected);
    }

    #[test]
    fn window_never_exceeds_capacity() {
        let mut window = RollingWindow::new(3);
        for i in 0..10 {
            window.push(i as f64);
            assert!(window.len() <= 3);
        }
        assert_eq!(window.range(), Some((7.0, 9.0)));
    }

    #[test]
    fn noiseless_stream_is_a_sine() {
        let samples: Vec<f64> = SineStream::seeded(0.1, 0.0, 7).take(20).collect();
        for (i, v) in samples.iter().enumerate() {
            assert!((v - (i as f64 * 0.1).sin()).abs() < 1e-12);
        }
    }

    #[test]
    fn noise_stays_near_the_curve() {
        let samples: Vec<f64> = SineStream::seeded(0.1, 0.1, 42).take(500).collect();
        let residuals: Vec<f64> = samples
            .iter()
            .enumerate()
            .map(|(i, v)| v - (i as f64 * 0.1).sin())
            .collect();

        let mean = residuals.iter().sum::<f64>() / residuals.len() as f64;
        let var = residuals.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / residuals.len() as f64;
        assert!(mean.abs() < 0.03, "mean {}", mean);
        assert!((var.sqrt() - 0.1).abs() < 0.03, "std {}", var.sqrt());
    }

    #[test]
    fn same_seed_same_stream() {
        let a: Vec<f64> = SineStream::seeded(0.1, 0.1, 3).take(10).collect();
        let b: Vec<f64> = SineStream::seeded(0.1, 0.1, 3).take(10).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn points_span_plot_area() {
        let mut window = RollingWindow::new(3);
        window.push(0.0);
        window.push(1.0);
        window.push(0.5);

        let points = chart_points(&window, 200, 100);
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].x, MARGIN);
        assert_eq!(points[2].x, 200 - MARGIN);
        // larger values are drawn higher up
        assert!(points[1].y < points[2].y);
        assert!(points[2].y < points[0].y);
        assert!(points.iter().all(|p| p.y >= MARGIN && p.y <= 100 - MARGIN));
    }

    #[test]
    fn empty_window_draws_no_line() {
        let window = RollingWindow::new(50);
        assert!(chart_points(&window, 640, 360).is_empty());

        let canvas = render_chart(&window, 640, 360).unwrap();
        assert_eq!((canvas.rows(), canvas.cols()), (360, 640));
    }
}
