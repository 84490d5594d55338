//! v4l2-cam-capture: single-buffer V4L2 frame capture
//!
//! Opens a video-capture device, negotiates a resolution and one of three
//! pixel formats, maps one kernel buffer and exchanges it with the driver one
//! frame at a time. Frames come back decoded and stamped in Unix epoch time.
//!
//! The kernel protocol sits behind [`CaptureBackend`], so the lifecycle can be
//! driven by real hardware ([`V4L2Device`]) or by a mock device in tests.

pub mod acquire;
pub mod buffer;
pub mod camera;
pub mod clock;
pub mod config;
pub mod convert;
pub mod device;
pub mod error;
pub mod session;
pub mod traits;
pub mod validation;

#[cfg(test)]
pub mod mock;

pub use camera::{CaptureSession, SetupStage};
pub use clock::ClockOffset;
pub use config::{CaptureConfig, RigConfig};
pub use device::V4L2Device;
pub use error::{CaptureError, Result};
pub use traits::{
    CaptureBackend, DeviceCapabilities, Format, FourCC, Frame, FrameImage, FrameLayout,
    FrameMetadata, PixelFormat,
};
