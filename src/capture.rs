use crate::config::CameraConfig;
use crate::error::{VisionError, VisionResult};
use opencv::{core::Mat, highgui, prelude::*, videoio};
use tracing::{info, warn};

/// ASCII code of the escape key as reported by `highgui::wait_key`.
pub const KEY_ESC: u8 = 27;

/// Counts consecutive failed reads from a capture device.
///
/// A read that fails is retried until `max` failures happen in a row; at that
/// point the stream is considered finished. Any successful read resets the
/// count.
#[derive(Debug, Clone)]
pub struct ReadFailureBudget {
    max: u32,
    consecutive: u32,
}

impl ReadFailureBudget {
    pub fn new(max: u32) -> Self {
        Self {
            max: max.max(1),
            consecutive: 0,
        }
    }

    /// Records one failure. Returns `true` once the budget is used up.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive >= self.max
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

/// Live camera wrapped with the shared read-failure policy.
pub struct FrameSource {
    cap: videoio::VideoCapture,
    budget: ReadFailureBudget,
    device_index: i32,
}

impl FrameSource {
    /// Opens camera `device_index` and asks for the configured resolution.
    ///
    /// The device may grant a different size; the one actually in effect is
    /// logged.
    pub fn open(device_index: i32, config: &CameraConfig) -> VisionResult<Self> {
        let mut cap = videoio::VideoCapture::new(device_index, videoio::CAP_ANY)?;
        if !cap.is_opened()? {
            return Err(VisionError::CameraUnavailable(device_index));
        }

        cap.set(videoio::CAP_PROP_FRAME_WIDTH, config.width as f64)?;
        cap.set(videoio::CAP_PROP_FRAME_HEIGHT, config.height as f64)?;

        let width = cap.get(videoio::CAP_PROP_FRAME_WIDTH)? as i32;
        let height = cap.get(videoio::CAP_PROP_FRAME_HEIGHT)? as i32;
        info!("[camera {}] resolution: {}x{}", device_index, width, height);

        Ok(Self {
            cap,
            budget: ReadFailureBudget::new(config.max_read_failures),
            device_index,
        })
    }

    /// Blocks until the next frame arrives.
    ///
    /// Returns `None` when the failure budget runs out, which callers treat as
    /// end of stream.
    pub fn next_frame(&mut self) -> Option<Mat> {
        loop {
            let mut frame = Mat::default();
            match self.cap.read(&mut frame) {
                Ok(true) if !frame.empty() => {
                    self.budget.record_success();
                    return Some(frame);
                }
                Ok(_) => warn!("frame read failed, retrying..."),
                Err(e) => warn!("frame read failed ({}), retrying...", e),
            }

            if self.budget.record_failure() {
                warn!(
                    "camera {} gave {} failed reads in a row, stopping",
                    self.device_index,
                    self.budget.consecutive()
                );
                return None;
            }
        }
    }

    pub fn release(mut self) -> VisionResult<()> {
        self.cap.release()?;
        Ok(())
    }
}

/// True when the raw `wait_key` result is the given ASCII key.
///
/// `wait_key` returns -1 when nothing was pressed and may carry modifier bits
/// above the low byte.
pub fn is_key(raw: i32, key: u8) -> bool {
    raw >= 0 && (raw & 0xFF) as u8 == key
}

/// Shows `img` in `window` and polls the keyboard for one millisecond.
///
/// Returns `true` if `exit_key` was pressed.
pub fn show_and_poll(window: &str, img: &Mat, exit_key: u8) -> VisionResult<bool> {
    highgui::imshow(window, img)?;
    let key = highgui::wait_key(1)?;
    Ok(is_key(key, exit_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_exhausts_after_max_consecutive_failures() {
        let mut budget = ReadFailureBudget::new(3);
        assert!(!budget.record_failure());
        assert!(!budget.record_failure());
        assert!(budget.record_failure());
    }

    #[test]
    fn success_resets_budget() {
        let mut budget = ReadFailureBudget::new(2);
        assert!(!budget.record_failure());
        budget.record_success();
        assert_eq!(budget.consecutive(), 0);
        assert!(!budget.record_failure());
        assert!(budget.record_failure());
    }

    #[test]
    fn zero_budget_still_allows_one_attempt() {
        let mut budget = ReadFailureBudget::new(0);
        assert!(budget.record_failure());
    }

    #[test]
    fn key_matching_masks_high_bits() {
        assert!(is_key(113, b'q'));
        assert!(is_key(0x100000 | 113, b'q'));
        assert!(is_key(27, KEY_ESC));
        assert!(!is_key(-1, b'q'));
        assert!(!is_key(27, b'q'));
    }
}
