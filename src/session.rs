//! Device handle ownership and format negotiation.

use std::path::Path;

use tracing::{debug, error, info};

use crate::config::CaptureConfig;
use crate::error::{CaptureError, Result};
use crate::traits::{CaptureBackend, DeviceCapabilities, Format, FrameLayout, PixelFormat};

/// Owns the open device handle and the negotiated frame layout.
///
/// Opened once, closed once; a closed session is never reopened.
pub struct DeviceSession<B: CaptureBackend> {
    backend: B,
    camera: String,
    layout: Option<FrameLayout>,
}

impl<B: CaptureBackend> DeviceSession<B> {
    /// Wrap an unopened backend. `camera` tags every log line and error.
    pub const fn new(backend: B, camera: String) -> Self {
        Self {
            backend,
            camera,
            layout: None,
        }
    }

    /// Camera description used in logs and errors.
    pub fn camera(&self) -> &str {
        &self.camera
    }

    /// Whether the device handle is held.
    pub fn is_open(&self) -> bool {
        self.backend.is_open()
    }

    /// Layout negotiated by the last successful `negotiate_format`.
    pub const fn layout(&self) -> Option<FrameLayout> {
        self.layout
    }

    /// The underlying backend, mutably.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Open the device node for read/write.
    pub fn open(&mut self, path: &Path) -> Result<()> {
        self.backend.open(path).map_err(|source| {
            error!(camera = %self.camera, error = %source, "failed to open cam");
            CaptureError::Io {
                camera: self.camera.clone(),
                source,
            }
        })?;
        info!(camera = %self.camera, "opened cam");
        Ok(())
    }

    /// Require single-planar video capture.
    pub fn query_capability(&mut self) -> Result<DeviceCapabilities> {
        let caps = self.backend.query_capabilities().map_err(|source| {
            error!(camera = %self.camera, error = %source, "VIDIOC_QUERYCAP failed");
            CaptureError::UnsupportedDevice {
                camera: self.camera.clone(),
                reason: format!("VIDIOC_QUERYCAP failed: {source}"),
            }
        })?;

        if !caps.can_capture {
            error!(
                camera = %self.camera,
                driver = %caps.driver,
                "cam cannot handle single-planar video capture"
            );
            return Err(CaptureError::UnsupportedDevice {
                camera: self.camera.clone(),
                reason: format!("driver {} ({}) lacks VIDEO_CAPTURE", caps.driver, caps.card),
            });
        }

        debug!(
            camera = %self.camera,
            driver = %caps.driver,
            card = %caps.card,
            bus = %caps.bus_info,
            streaming = caps.can_stream,
            "queried capabilities"
        );
        Ok(caps)
    }

    /// Request the configured resolution and pixel format from the device.
    ///
    /// The device may adjust a request; any adjustment of width, height or
    /// pixel format counts as a rejection because the raw bytes would no
    /// longer match the layout they are decoded with.
    pub fn negotiate_format(&mut self, config: &CaptureConfig) -> Result<FrameLayout> {
        let Some(pixel_format) = PixelFormat::from_selector(config.pixel_format) else {
            error!(
                camera = %self.camera,
                selector = config.pixel_format,
                "unsupported format, check supported types"
            );
            return Err(CaptureError::UnsupportedFormat {
                camera: self.camera.clone(),
                selector: config.pixel_format,
            });
        };

        if config.sensor_width == 0 || config.sensor_height == 0 {
            return Err(CaptureError::Config {
                path: None,
                message: format!(
                    "sensor resolution {}x{} must be positive",
                    config.sensor_width, config.sensor_height
                ),
            });
        }

        let Some(requested) = Format::new(config.sensor_width, config.sensor_height, pixel_format)
        else {
            error!(
                camera = %self.camera,
                width = config.sensor_width,
                height = config.sensor_height,
                format = ?pixel_format,
                "frame size overflows the driver's 32-bit fields"
            );
            return Err(CaptureError::Config {
                path: None,
                message: format!(
                    "sensor resolution {}x{} is too large for {pixel_format:?}",
                    config.sensor_width, config.sensor_height
                ),
            });
        };
        let applied = self.backend.set_format(&requested).map_err(|source| {
            error!(camera = %self.camera, error = %source, "VIDIOC_S_FMT failed");
            CaptureError::DeviceRejectedFormat {
                camera: self.camera.clone(),
                requested: requested.clone(),
                reason: source.to_string(),
            }
        })?;

        if applied.fourcc != requested.fourcc
            || applied.width != requested.width
            || applied.height != requested.height
        {
            error!(
                camera = %self.camera,
                requested = ?requested,
                applied = ?applied,
                "cam doesn't support the requested video format"
            );
            return Err(CaptureError::DeviceRejectedFormat {
                camera: self.camera.clone(),
                reason: format!(
                    "driver answered {}x{} {:?}",
                    applied.width, applied.height, applied.fourcc
                ),
                requested,
            });
        }

        let layout = FrameLayout::new(pixel_format, applied.width, applied.height)
            .with_stride(applied.stride);
        info!(
            camera = %self.camera,
            format = ?pixel_format,
            width = layout.width,
            buffer_height = layout.buffer_height,
            stride = layout.stride,
            "negotiated format"
        );
        self.layout = Some(layout);
        Ok(layout)
    }

    /// Release the device handle. Safe to call on a closed session.
    pub fn close(&mut self) {
        if !self.backend.is_open() {
            return;
        }
        if let Err(err) = self.backend.close() {
            error!(camera = %self.camera, error = %err, "failed to close cam");
        }
        debug!(camera = %self.camera, "closed cam");
    }
}
