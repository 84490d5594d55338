//! Error taxonomy for capture sessions.
//!
//! Every variant carries the camera description (`"<id> <serial> <path>"`) so a
//! multi-camera host can tell which device failed.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::traits::Format;

/// Error type for camera operations.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The device path could not be opened (or closed) for read/write.
    #[error("failed to open cam {camera}: {source}")]
    Io {
        /// Camera description.
        camera: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// Capability query failed or the device is not a single-planar capture device.
    #[error("cam {camera} cannot handle single-planar video capture: {reason}")]
    UnsupportedDevice {
        /// Camera description.
        camera: String,
        /// What the device reported.
        reason: String,
    },

    /// The configured pixel format selector is outside the supported set.
    #[error("unsupported pixel format selector {selector} for cam {camera}")]
    UnsupportedFormat {
        /// Camera description.
        camera: String,
        /// The raw selector from the configuration.
        selector: u32,
    },

    /// `VIDIOC_S_FMT` failed or the driver substituted a different format.
    #[error("cam {camera} does not support the requested video format {requested:?}: {reason}")]
    DeviceRejectedFormat {
        /// Camera description.
        camera: String,
        /// What was asked for.
        requested: Format,
        /// Why it was rejected.
        reason: String,
    },

    /// `VIDIOC_REQBUFS` failed or granted no buffer.
    #[error("cam {camera} failed to allocate buffer: {source}")]
    BufferAllocation {
        /// Camera description.
        camera: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// `VIDIOC_QUERYBUF` failed.
    #[error("failed to retrieve buffer information for cam {camera}: {source}")]
    BufferQuery {
        /// Camera description.
        camera: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The reported buffer could not be mapped into the process.
    #[error("cam {camera} failed to create a memory map for buffer: {source}")]
    Mapping {
        /// Camera description.
        camera: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// `VIDIOC_STREAMON` failed.
    #[error("failed to activate streaming for cam {camera}: {source}")]
    StreamOn {
        /// Camera description.
        camera: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// `VIDIOC_STREAMOFF` failed. Only ever logged during teardown.
    #[error("failed to disable streaming on cam {camera}: {source}")]
    StreamOff {
        /// Camera description.
        camera: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// `VIDIOC_QBUF` failed. Fatal to the session.
    #[error("failed to queue the image buffer for cam {camera}: {source}")]
    Enqueue {
        /// Camera description.
        camera: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// `VIDIOC_DQBUF` failed. Fatal to the session.
    #[error("failed to dequeue the image buffer for cam {camera}: {source}")]
    Dequeue {
        /// Camera description.
        camera: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The raw bytes could not be reinterpreted as the negotiated layout.
    #[error("cam {camera}: {reason}")]
    Conversion {
        /// Camera description.
        camera: String,
        /// Why decoding failed.
        reason: String,
    },

    /// The clock sources kept producing a zero offset.
    #[error("clock offset stayed zero after {attempts} samples")]
    ClockOffset {
        /// Number of samples taken.
        attempts: u32,
    },

    /// A clock source could not be read.
    #[error("failed to read system clocks: {source}")]
    ClockRead {
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// A frame was requested before `initialize` succeeded.
    #[error("cam {camera} is not initialized")]
    NotInitialized {
        /// Camera description.
        camera: String,
    },

    /// A previous enqueue/dequeue failure left buffer ownership ambiguous.
    #[error("cam {camera} is unusable after a failed buffer hand-off; tear it down")]
    SessionPoisoned {
        /// Camera description.
        camera: String,
    },

    /// The session was torn down; device handles are never reopened.
    #[error("cam {camera} was torn down")]
    TornDown {
        /// Camera description.
        camera: String,
    },

    /// A configuration file could not be read or parsed.
    #[error("invalid capture configuration {path:?}: {message}")]
    Config {
        /// Source file, if any.
        path: Option<PathBuf>,
        /// Parser or I/O message.
        message: String,
    },
}

impl CaptureError {
    /// Whether this error leaves the session unusable for further frame pulls.
    pub const fn is_fatal_to_stream(&self) -> bool {
        matches!(self, Self::Enqueue { .. } | Self::Dequeue { .. })
    }
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CaptureError>;
