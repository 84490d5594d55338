//! Capture configuration.
//!
//! The pixel format is stored as the raw numeric selector so that an
//! unsupported value survives loading and is rejected by `initialize` like
//! any other negotiation failure.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CaptureError, Result};
use crate::traits::PixelFormat;

const fn default_pixel_format() -> u32 {
    PixelFormat::PlanarYuv420.selector()
}

/// Per-camera settings, immutable once a session is constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaptureConfig {
    /// Logical camera name, e.g. `cam_0` or `cam_left`.
    pub cam_id: String,
    /// Device serial number. Informational only.
    #[serde(default)]
    pub device_serial: i64,
    /// Device node, e.g. `/dev/video0`.
    pub device_path: PathBuf,
    /// Requested sensor width in pixels.
    pub sensor_width: u32,
    /// Requested sensor height in pixels.
    pub sensor_height: u32,
    /// Pixel format selector (1 = planar YUV420, 2 = Y16, 5 = YUYV).
    #[serde(default = "default_pixel_format")]
    pub pixel_format: u32,
    /// Clock offset shared with other cameras. Absent or zero means estimate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch_offset_ms: Option<i64>,
}

impl CaptureConfig {
    /// Configuration with planar YUV420 output and no shared offset.
    pub fn new<P: Into<PathBuf>>(cam_id: &str, device_path: P, width: u32, height: u32) -> Self {
        Self {
            cam_id: cam_id.to_owned(),
            device_serial: 0,
            device_path: device_path.into(),
            sensor_width: width,
            sensor_height: height,
            pixel_format: default_pixel_format(),
            epoch_offset_ms: None,
        }
    }

    /// Set the output pixel format.
    #[must_use]
    pub const fn with_pixel_format(mut self, format: PixelFormat) -> Self {
        self.pixel_format = format.selector();
        self
    }

    /// Set a raw pixel format selector.
    #[must_use]
    pub const fn with_selector(mut self, selector: u32) -> Self {
        self.pixel_format = selector;
        self
    }

    /// Set the informational device serial.
    #[must_use]
    pub const fn with_serial(mut self, serial: i64) -> Self {
        self.device_serial = serial;
        self
    }

    /// Share a clock offset with other sessions.
    #[must_use]
    pub const fn with_epoch_offset_ms(mut self, offset_ms: i64) -> Self {
        self.epoch_offset_ms = Some(offset_ms);
        self
    }

    /// The selected pixel format, if the selector is supported.
    pub const fn format(&self) -> Option<PixelFormat> {
        PixelFormat::from_selector(self.pixel_format)
    }

    /// `"<cam_id> <serial> <path>"`, used to tag log lines and errors.
    pub fn description(&self) -> String {
        format!(
            "{} {} {}",
            self.cam_id,
            self.device_serial,
            self.device_path.display()
        )
    }

    /// Parse a single camera from TOML.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| CaptureError::Config {
            path: None,
            message: format!("TOML parse error: {e}"),
        })
    }

    /// Load a single camera from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = read_config(path)?;
        toml::from_str(&content).map_err(|e| CaptureError::Config {
            path: Some(path.to_path_buf()),
            message: format!("TOML parse error: {e}"),
        })
    }
}

/// Several cameras captured side by side with comparable timestamps.
///
/// ```toml
/// shared_clock_offset = true
///
/// [[camera]]
/// cam_id = "cam_left"
/// device_path = "/dev/video0"
/// sensor_width = 640
/// sensor_height = 512
/// pixel_format = 2
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RigConfig {
    /// Estimate one clock offset and hand it to every camera.
    #[serde(default = "default_shared_offset")]
    pub shared_clock_offset: bool,
    /// Cameras in the rig.
    #[serde(rename = "camera", default)]
    pub cameras: Vec<CaptureConfig>,
}

const fn default_shared_offset() -> bool {
    true
}

impl RigConfig {
    /// Parse a rig from TOML.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| CaptureError::Config {
            path: None,
            message: format!("TOML parse error: {e}"),
        })
    }

    /// Load a rig from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = read_config(path)?;
        toml::from_str(&content).map_err(|e| CaptureError::Config {
            path: Some(path.to_path_buf()),
            message: format!("TOML parse error: {e}"),
        })
    }
}

fn read_config(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| CaptureError::Config {
        path: Some(path.to_path_buf()),
        message: e.to_string(),
    })
}
