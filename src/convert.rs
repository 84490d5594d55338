//! Reinterpretation of raw capture bytes as pixel matrices.
//!
//! Every decoder copies out of the input slice; the result never borrows the
//! shared capture buffer.

use image::{GrayImage, ImageBuffer, RgbImage};
use thiserror::Error;

use crate::traits::{FrameImage, FrameLayout, Gray16Image, PixelFormat};

/// Why a raw buffer could not be decoded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer bytes than the negotiated layout requires.
    #[error("raw buffer holds {available} bytes, layout needs {needed}")]
    Truncated {
        /// Bytes required by the layout.
        needed: usize,
        /// Bytes supplied.
        available: usize,
    },
    /// The layout has a zero dimension.
    #[error("layout {width}x{height} is empty")]
    EmptyLayout {
        /// Width in pixels.
        width: u32,
        /// Height in pixels.
        height: u32,
    },
}

/// Decode one raw frame according to `layout`.
///
/// * planar YUV420: the luma plane as 8-bit grayscale
/// * Y16: little-endian 16-bit grayscale
/// * YUYV: BT.601 RGB
pub fn decode(raw: &[u8], layout: &FrameLayout) -> Result<FrameImage, DecodeError> {
    if layout.width == 0 || layout.sensor_height == 0 {
        return Err(DecodeError::EmptyLayout {
            width: layout.width,
            height: layout.sensor_height,
        });
    }
    let needed = layout.min_bytes();
    if raw.len() < needed {
        return Err(DecodeError::Truncated {
            needed,
            available: raw.len(),
        });
    }

    let image = match layout.pixel_format {
        PixelFormat::PlanarYuv420 => FrameImage::Gray8(decode_luma(raw, layout)),
        PixelFormat::Grayscale16 => FrameImage::Gray16(decode_y16(raw, layout)),
        PixelFormat::PackedYuyv => FrameImage::Rgb8(decode_yuyv(raw, layout)),
    };
    Ok(image)
}

/// Iterate the unpadded bytes of the first `sensor_height` rows.
fn rows<'a>(raw: &'a [u8], layout: &FrameLayout) -> impl Iterator<Item = &'a [u8]> + 'a {
    let row_bytes = layout.row_bytes();
    raw.chunks(layout.stride as usize)
        .take(layout.sensor_height as usize)
        .filter_map(move |row| row.get(..row_bytes))
}

fn decode_luma(raw: &[u8], layout: &FrameLayout) -> GrayImage {
    let pixels: Vec<u8> = rows(raw, layout).flatten().copied().collect();
    GrayImage::from_raw(layout.width, layout.sensor_height, pixels)
        .unwrap_or_else(|| GrayImage::new(layout.width, layout.sensor_height))
}

fn decode_y16(raw: &[u8], layout: &FrameLayout) -> Gray16Image {
    let samples: Vec<u16> = rows(raw, layout)
        .flat_map(|row| row.chunks_exact(2))
        .map(|pair| match *pair {
            [lo, hi] => u16::from_le_bytes([lo, hi]),
            _ => 0,
        })
        .collect();
    ImageBuffer::from_raw(layout.width, layout.sensor_height, samples)
        .unwrap_or_else(|| ImageBuffer::new(layout.width, layout.sensor_height))
}

fn decode_yuyv(raw: &[u8], layout: &FrameLayout) -> RgbImage {
    let mut rgb = Vec::with_capacity(layout.width as usize * layout.sensor_height as usize * 3);
    for row in rows(raw, layout) {
        // YUYV format: [Y0 U Y1 V] repeats, each pair of pixels shares U and V
        for group in row.chunks_exact(4) {
            if let [y0, u, y1, v] = *group {
                let (r, g, b) = yuv_to_rgb(y0, u, v);
                rgb.extend_from_slice(&[r, g, b]);
                let (r, g, b) = yuv_to_rgb(y1, u, v);
                rgb.extend_from_slice(&[r, g, b]);
            }
        }
        // Odd widths end on a lone luma sample.
        if layout.width % 2 == 1 {
            if let [.., y, u] = *row {
                let (r, g, b) = yuv_to_rgb(y, u, 128);
                rgb.extend_from_slice(&[r, g, b]);
            }
        }
    }
    RgbImage::from_raw(layout.width, layout.sensor_height, rgb)
        .unwrap_or_else(|| RgbImage::new(layout.width, layout.sensor_height))
}

/// Convert YUV values to RGB.
///
/// Uses the ITU-R BT.601 conversion formula.
///
/// # Arguments
///
/// * `y` - Luminance value (16-235 for studio range)
/// * `u` - Blue-difference chroma value (16-240)
/// * `v` - Red-difference chroma value (16-240)
///
/// # Returns
///
/// RGB tuple with values clamped to 0-255 range.
#[must_use]
#[allow(clippy::many_single_char_names)]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let y_f = f32::from(y);
    let u_f = f32::from(u) - 128.0;
    let v_f = f32::from(v) - 128.0;

    let r = 1.402f32.mul_add(v_f, y_f);
    let g = 0.714_14f32.mul_add(-v_f, 0.344_14f32.mul_add(-u_f, y_f));
    let b = 1.772f32.mul_add(u_f, y_f);

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let clamp = |val: f32| -> u8 { val.clamp(0.0, 255.0) as u8 };

    (clamp(r), clamp(g), clamp(b))
}
