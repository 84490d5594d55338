//! Per-camera capture lifecycle: construct, initialize, pull frames, tear down.

use tracing::{debug, error, info};

use crate::acquire::{FrameAcquisitionLoop, StreamState};
use crate::buffer::MappedBuffer;
use crate::clock::ClockOffset;
use crate::config::CaptureConfig;
use crate::device::V4L2Device;
use crate::error::{CaptureError, Result};
use crate::session::DeviceSession;
use crate::traits::{CaptureBackend, Frame, FrameLayout};

/// Setup steps completed by `initialize`, undone in reverse by teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStage {
    /// Device node opened.
    Opened,
    /// Video-capture capability confirmed.
    CapabilityChecked,
    /// Resolution and pixel format accepted.
    FormatNegotiated,
    /// One mmap buffer allocated.
    BufferAllocated,
    /// Buffer length and offset known.
    DescriptorQueried,
    /// Buffer mapped into the process.
    Mapped,
    /// Capture enabled.
    Streaming,
}

/// One camera from configuration to frames.
///
/// Dropping the session tears it down.
pub struct CaptureSession<B: CaptureBackend = V4L2Device> {
    config: CaptureConfig,
    offset: ClockOffset,
    session: DeviceSession<B>,
    buffer: MappedBuffer<B::Region>,
    acquisition: Option<FrameAcquisitionLoop>,
    stages: Vec<SetupStage>,
    torn_down: bool,
}

impl CaptureSession<V4L2Device> {
    /// A session on the V4L2 device named by `config.device_path`.
    pub fn new(config: CaptureConfig) -> Result<Self> {
        Self::with_backend(config, V4L2Device::new())
    }
}

impl<B: CaptureBackend> CaptureSession<B> {
    /// A session on an arbitrary backend.
    ///
    /// Uses `config.epoch_offset_ms` when set and non-zero, otherwise
    /// estimates the clock offset now.
    pub fn with_backend(config: CaptureConfig, backend: B) -> Result<Self> {
        let offset = ClockOffset::resolve(config.epoch_offset_ms)?;
        let description = config.description();
        debug!(camera = %description, offset_ms = offset.as_millis(), "created capture session");
        Ok(Self {
            config,
            offset,
            session: DeviceSession::new(backend, description),
            buffer: MappedBuffer::new(),
            acquisition: None,
            stages: Vec::new(),
            torn_down: false,
        })
    }

    /// The configuration this session was built from.
    pub const fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Offset applied to every frame timestamp.
    pub const fn clock_offset(&self) -> ClockOffset {
        self.offset
    }

    /// Negotiated layout, once initialized.
    pub const fn layout(&self) -> Option<FrameLayout> {
        self.session.layout()
    }

    /// `"<cam_id> <serial> <path>"`.
    pub fn description(&self) -> &str {
        self.session.camera()
    }

    /// Completed setup stages, oldest first.
    pub fn stages(&self) -> &[SetupStage] {
        &self.stages
    }

    /// Whether frames can be pulled.
    pub fn is_streaming(&self) -> bool {
        self.acquisition
            .as_ref()
            .is_some_and(|acquisition| acquisition.state() == StreamState::Streaming)
    }

    /// Open, negotiate, map and start streaming.
    ///
    /// On failure every completed stage is undone before the error is
    /// returned, and the session cannot be initialized again. Calling it on a
    /// streaming session is a no-op.
    pub fn initialize(&mut self) -> Result<()> {
        if self.torn_down {
            return Err(CaptureError::TornDown {
                camera: self.description().to_owned(),
            });
        }
        if self.stages.contains(&SetupStage::Streaming) {
            return Ok(());
        }

        if let Err(err) = self.run_setup() {
            error!(camera = %self.description(), error = %err, stage = ?self.stages.last(), "initialization failed");
            self.teardown();
            return Err(err);
        }
        info!(camera = %self.description(), "cam initialized");
        Ok(())
    }

    fn run_setup(&mut self) -> Result<()> {
        self.session.open(&self.config.device_path)?;
        self.stages.push(SetupStage::Opened);

        self.session.query_capability()?;
        self.stages.push(SetupStage::CapabilityChecked);

        let layout = self.session.negotiate_format(&self.config)?;
        self.stages.push(SetupStage::FormatNegotiated);

        self.buffer.request_allocation(&mut self.session)?;
        self.stages.push(SetupStage::BufferAllocated);

        self.buffer.query_descriptor(&mut self.session)?;
        self.stages.push(SetupStage::DescriptorQueried);

        self.buffer.establish_mapping(&mut self.session)?;
        self.stages.push(SetupStage::Mapped);

        let acquisition = self.acquisition.insert(FrameAcquisitionLoop::new(
            self.config.cam_id.clone(),
            layout,
            self.offset,
        ));
        acquisition.start(&mut self.session)?;
        self.stages.push(SetupStage::Streaming);
        Ok(())
    }

    /// Block until the device delivers the next frame.
    pub fn pull_next_frame(&mut self) -> Result<Frame> {
        if self.torn_down {
            return Err(CaptureError::TornDown {
                camera: self.session.camera().to_owned(),
            });
        }
        let Some(acquisition) = self.acquisition.as_mut() else {
            return Err(CaptureError::NotInitialized {
                camera: self.session.camera().to_owned(),
            });
        };
        acquisition.pull(&mut self.session, &mut self.buffer)
    }

    /// Stop streaming, unmap and close. Safe to call more than once.
    ///
    /// A stream-off failure is logged and does not keep the mapping or the
    /// handle alive.
    pub fn teardown(&mut self) {
        while let Some(stage) = self.stages.pop() {
            self.undo(stage);
        }
        if !self.torn_down {
            debug!(camera = %self.session.camera(), "cam torn down");
        }
        self.torn_down = true;
    }
}

impl<B: CaptureBackend> CaptureSession<B> {
    fn undo(&mut self, stage: SetupStage) {
        match stage {
            SetupStage::Streaming => {
                let Some(acquisition) = self.acquisition.as_mut() else {
                    return;
                };
                match acquisition.stop(&mut self.session) {
                    // STREAMOFF dequeues every buffer.
                    Ok(()) => self.buffer.reclaim_after_stream_off(),
                    Err(err) => {
                        error!(camera = %self.session.camera(), error = %err, "VIDIOC_STREAMOFF failed");
                    }
                }
            }
            SetupStage::Mapped => self.buffer.release(),
            SetupStage::Opened => self.session.close(),
            // Closing the handle frees the kernel-side buffer.
            SetupStage::CapabilityChecked
            | SetupStage::FormatNegotiated
            | SetupStage::BufferAllocated
            | SetupStage::DescriptorQueried => {}
        }
    }
}

impl<B: CaptureBackend> Drop for CaptureSession<B> {
    fn drop(&mut self) {
        self.teardown();
    }
}
