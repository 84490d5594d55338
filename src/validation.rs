//! Frame validation utilities for test pattern verification.
//!
//! Checks that captured frames contain the expected test patterns and arrive
//! in order. Used by the mock-device unit tests and by integration tests
//! against virtual cameras.

use thiserror::Error;

use crate::traits::Frame;

/// Expected RGB values for SMPTE color bars (8 bars).
///
/// These are the RGB values resulting from converting the YUV values
/// used by the mock device's color bar pattern.
///
/// Colors in order: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
const SMPTE_COLOR_BARS: [(u8, u8, u8); 8] = [
    (235, 235, 235), // White
    (235, 235, 11),  // Yellow
    (12, 236, 237),  // Cyan
    (13, 237, 13),   // Green
    (237, 13, 237),  // Magenta
    (238, 14, 13),   // Red
    (15, 15, 239),   // Blue
    (16, 16, 16),    // Black
];

/// Tolerance for RGB color matching (accounts for YUV->RGB conversion errors).
const COLOR_TOLERANCE: u32 = 15;

/// Minimum left-to-right luminance rise for a gradient.
const MIN_GRADIENT_RISE: f32 = 50.0;

/// Why a frame or frame sequence failed validation.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    /// A sample point fell outside the image.
    #[error("pixel ({x}, {y}) is outside the frame")]
    OutOfBounds {
        /// Column.
        x: u32,
        /// Row.
        y: u32,
    },
    /// A color bar did not have the expected color.
    #[error("color bar {bar} mismatch at ({x}, {y}): expected RGB{expected:?}, got RGB{actual:?}")]
    ColorMismatch {
        /// Bar index, left to right.
        bar: usize,
        /// Sampled column.
        x: u32,
        /// Sampled row.
        y: u32,
        /// Expected color.
        expected: (u8, u8, u8),
        /// Captured color.
        actual: (u8, u8, u8),
    },
    /// Luminance dropped while scanning left to right.
    #[error("gradient not monotonically increasing at x={x}: luminance {luminance} < previous {previous}")]
    NotMonotonic {
        /// Column where the drop was seen.
        x: u32,
        /// Luminance at `x`.
        luminance: f32,
        /// Luminance at the previous sample.
        previous: f32,
    },
    /// The frame is too flat to be a gradient.
    #[error("insufficient luminance change for gradient: {change} (expected at least 50)")]
    FlatGradient {
        /// Rise from the first to the last sample.
        change: f32,
    },
    /// No frames to validate.
    #[error("cannot validate an empty frame sequence")]
    Empty,
    /// Sequence numbers skipped or repeated.
    #[error("frame sequence gap at index {index}: expected {expected}, got {actual}")]
    SequenceGap {
        /// Index into the slice.
        index: usize,
        /// Expected sequence number.
        expected: u32,
        /// Captured sequence number.
        actual: u32,
    },
    /// Epoch timestamps went backwards.
    #[error("timestamp at index {index} went backwards: {current} < {previous}")]
    TimestampRegression {
        /// Index into the slice.
        index: usize,
        /// Previous frame's timestamp in nanoseconds.
        previous: i64,
        /// This frame's timestamp in nanoseconds.
        current: i64,
    },
}

fn pixel(frame: &Frame, x: u32, y: u32) -> Result<(u8, u8, u8), ValidationError> {
    frame
        .image
        .pixel_rgb(x, y)
        .ok_or(ValidationError::OutOfBounds { x, y })
}

/// Validates that a frame contains the SMPTE color bar pattern.
///
/// Samples the center of each of the 8 vertical stripes on the middle row
/// and compares it to the expected color within a tolerance for YUV-to-RGB
/// conversion inaccuracies.
pub fn validate_color_bars(frame: &Frame) -> Result<(), ValidationError> {
    let bar_width = frame.image.width() / 8;
    let center_y = frame.image.height() / 2;

    for (bar, &expected) in SMPTE_COLOR_BARS.iter().enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        let sample_x = (bar as u32 * bar_width) + (bar_width / 2);

        let actual = pixel(frame, sample_x, center_y)?;
        if !colors_match(actual, expected, COLOR_TOLERANCE) {
            return Err(ValidationError::ColorMismatch {
                bar,
                x: sample_x,
                y: center_y,
                expected,
                actual,
            });
        }
    }

    Ok(())
}

/// Validates that a frame contains a horizontal dark-to-light gradient.
///
/// Samples every 10th pixel of the middle row. Luminance may dip by at most
/// one level between samples (rounding) and must rise by at least 50 overall.
pub fn validate_gradient(frame: &Frame) -> Result<(), ValidationError> {
    let center_y = frame.image.height() / 2;

    let mut first: Option<f32> = None;
    let mut previous: Option<f32> = None;

    for x in (0..frame.image.width()).step_by(10) {
        let (r, g, b) = pixel(frame, x, center_y)?;
        // Y' in Rec. 601
        let luminance = 0.114f32.mul_add(
            f32::from(b),
            0.587f32.mul_add(f32::from(g), 0.299 * f32::from(r)),
        );

        if let Some(prev) = previous {
            if luminance < prev - 1.0 {
                return Err(ValidationError::NotMonotonic {
                    x,
                    luminance,
                    previous: prev,
                });
            }
        }
        first.get_or_insert(luminance);
        previous = Some(luminance);
    }

    if let (Some(first), Some(last)) = (first, previous) {
        let change = last - first;
        if change < MIN_GRADIENT_RISE {
            return Err(ValidationError::FlatGradient { change });
        }
    }

    Ok(())
}

/// Validates that frame sequence numbers increment by exactly 1.
pub fn validate_frame_sequence(frames: &[Frame]) -> Result<(), ValidationError> {
    if frames.is_empty() {
        return Err(ValidationError::Empty);
    }

    for (index, pair) in frames.windows(2).enumerate() {
        if let [prev, curr] = pair {
            let expected = prev.metadata.sequence.wrapping_add(1);
            if curr.metadata.sequence != expected {
                return Err(ValidationError::SequenceGap {
                    index: index + 1,
                    expected,
                    actual: curr.metadata.sequence,
                });
            }
        }
    }

    Ok(())
}

/// Validates that epoch timestamps never decrease.
pub fn validate_timestamps(frames: &[Frame]) -> Result<(), ValidationError> {
    if frames.is_empty() {
        return Err(ValidationError::Empty);
    }

    for (index, pair) in frames.windows(2).enumerate() {
        if let [prev, curr] = pair {
            if curr.timestamp_ns < prev.timestamp_ns {
                return Err(ValidationError::TimestampRegression {
                    index: index + 1,
                    previous: prev.timestamp_ns,
                    current: curr.timestamp_ns,
                });
            }
        }
    }

    Ok(())
}

/// Whether all three channels are within `tolerance` of each other.
fn colors_match(actual: (u8, u8, u8), expected: (u8, u8, u8), tolerance: u32) -> bool {
    let (ar, ag, ab) = actual;
    let (er, eg, eb) = expected;

    u32::from(ar.abs_diff(er)) <= tolerance
        && u32::from(ag.abs_diff(eg)) <= tolerance
        && u32::from(ab.abs_diff(eb)) <= tolerance
}
