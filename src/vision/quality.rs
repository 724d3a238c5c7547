//! Frame quality heuristics.
//!
//! Cheap luma statistics decide whether a frame is worth submitting to
//! the OCR engine: a blurry or badly exposed photo of a worksheet
//! wastes the capture budget on an engine call that cannot succeed.

use crate::bridge::Frame;

/// Thresholds for accepting a frame
#[derive(Debug, Clone, Copy)]
pub struct QualityGate {
    /// Minimum normalized sharpness (mean absolute horizontal gradient)
    pub min_sharpness: f32,

    /// Minimum normalized mean luma
    pub min_brightness: f32,

    /// Maximum normalized mean luma
    pub max_brightness: f32,
}

impl Default for QualityGate {
    fn default() -> Self {
        Self {
            min_sharpness: 0.05,
            min_brightness: 0.15,
            max_brightness: 0.95,
        }
    }
}

/// Why the gate rejected a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRejection {
    TooBlurry,
    TooDark,
    TooBright,
}

impl QualityGate {
    /// Check a frame against the gate
    pub fn check(&self, frame: &Frame) -> Result<(), FrameRejection> {
        let brightness = brightness(frame);
        if brightness < self.min_brightness {
            return Err(FrameRejection::TooDark);
        }
        if brightness > self.max_brightness {
            return Err(FrameRejection::TooBright);
        }
        if sharpness(frame) < self.min_sharpness {
            return Err(FrameRejection::TooBlurry);
        }
        Ok(())
    }
}

/// Mean luma normalized to [0, 1]
pub fn brightness(frame: &Frame) -> f32 {
    if frame.luma.is_empty() {
        return 0.0;
    }

    let sum: u64 = frame.luma.iter().map(|&l| l as u64).sum();
    (sum as f64 / frame.luma.len() as f64 / 255.0) as f32
}

/// Mean absolute horizontal luma gradient normalized to [0, 1].
///
/// Sharp text edges produce large neighbor differences; defocus blur
/// smears them toward zero.
pub fn sharpness(frame: &Frame) -> f32 {
    let width = frame.width as usize;
    if width < 2 || frame.luma.is_empty() {
        return 0.0;
    }

    let mut sum: u64 = 0;
    let mut count: u64 = 0;

    for row in frame.luma.chunks_exact(width) {
        for pair in row.windows(2) {
            sum += pair[0].abs_diff(pair[1]) as u64;
            count += 1;
        }
    }

    if count == 0 {
        return 0.0;
    }

    (sum as f64 / count as f64 / 255.0) as f32
}
