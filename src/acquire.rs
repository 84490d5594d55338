//! Per-frame buffer hand-off: enqueue, wait, dequeue, stamp, convert.
//!
//! ```text
//! Unstreamed --start--> Streaming --pull--> Streaming
//!                           |  \--enqueue/dequeue error--> Failed
//!                           \--stop--> Stopped <--stop-- Failed
//! ```
//!
//! Frame cadence is set by the caller: each `pull` performs exactly one
//! exchange, and the dequeue blocks until the device has a frame ready.

use tracing::{debug, error, info, warn};

use crate::buffer::MappedBuffer;
use crate::clock::ClockOffset;
use crate::convert;
use crate::error::{CaptureError, Result};
use crate::session::DeviceSession;
use crate::traits::{CaptureBackend, Frame, FrameLayout, FrameMetadata};

/// Streaming state of the acquisition loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Buffers mapped, capture not yet enabled.
    Unstreamed,
    /// Capture enabled; frames can be pulled.
    Streaming,
    /// A buffer hand-off failed; only `stop` is allowed.
    Failed,
    /// Capture disabled.
    Stopped,
}

/// Drives the enqueue/dequeue protocol for one camera.
#[derive(Debug)]
pub struct FrameAcquisitionLoop {
    cam_id: String,
    layout: FrameLayout,
    offset: ClockOffset,
    state: StreamState,
    frames: u64,
    last_timestamp_ns: Option<i64>,
}

impl FrameAcquisitionLoop {
    /// A loop for a negotiated layout, stamping frames with `offset`.
    pub const fn new(cam_id: String, layout: FrameLayout, offset: ClockOffset) -> Self {
        Self {
            cam_id,
            layout,
            offset,
            state: StreamState::Unstreamed,
            frames: 0,
            last_timestamp_ns: None,
        }
    }

    /// Current state.
    pub const fn state(&self) -> StreamState {
        self.state
    }

    /// Frames delivered so far.
    pub const fn frames(&self) -> u64 {
        self.frames
    }

    /// `VIDIOC_STREAMON`. Calling it again while streaming is a no-op.
    pub fn start<B: CaptureBackend>(&mut self, session: &mut DeviceSession<B>) -> Result<()> {
        match self.state {
            StreamState::Streaming => return Ok(()),
            StreamState::Unstreamed => {}
            StreamState::Failed | StreamState::Stopped => {
                return Err(CaptureError::StreamOn {
                    camera: session.camera().to_owned(),
                    source: std::io::Error::other("capture was already stopped"),
                });
            }
        }

        session.backend_mut().stream_on().map_err(|source| {
            error!(camera = %session.camera(), error = %source, "VIDIOC_STREAMON failed to activate streaming");
            CaptureError::StreamOn {
                camera: session.camera().to_owned(),
                source,
            }
        })?;
        self.state = StreamState::Streaming;
        info!(camera = %session.camera(), "streaming started");
        Ok(())
    }

    /// Perform one enqueue/dequeue cycle and return the decoded frame.
    ///
    /// An enqueue or dequeue failure moves the loop to `Failed`; every later
    /// pull returns `SessionPoisoned`.
    pub fn pull<B: CaptureBackend>(
        &mut self,
        session: &mut DeviceSession<B>,
        buffer: &mut MappedBuffer<B::Region>,
    ) -> Result<Frame> {
        match self.state {
            StreamState::Streaming => {}
            StreamState::Failed => {
                return Err(CaptureError::SessionPoisoned {
                    camera: session.camera().to_owned(),
                });
            }
            StreamState::Unstreamed | StreamState::Stopped => {
                return Err(CaptureError::NotInitialized {
                    camera: session.camera().to_owned(),
                });
            }
        }

        self.enqueue(session, buffer)?;
        self.dequeue(session, buffer)?;

        let Some(filled) = buffer.descriptor().copied() else {
            return Err(CaptureError::NotInitialized {
                camera: session.camera().to_owned(),
            });
        };
        let timestamp_ns = self.offset.to_epoch_ns(filled.timestamp);
        if let Some(last) = self.last_timestamp_ns {
            if timestamp_ns < last {
                warn!(
                    camera = %session.camera(),
                    timestamp_ns,
                    last,
                    "device timestamp went backwards"
                );
            }
        }

        // The decoded image must own its pixels: the region goes back to the
        // kernel on the next pull.
        let layout = self.layout;
        let payload = filled.bytes_used as usize;
        let decoded = buffer
            .read(|raw| {
                // Drivers that leave bytesused at zero filled the whole buffer.
                let used = match raw.get(..payload) {
                    Some(used) if payload > 0 => used,
                    _ => raw,
                };
                convert::decode(used, &layout)
            })
            .ok_or_else(|| CaptureError::Conversion {
                camera: session.camera().to_owned(),
                reason: "capture buffer is not owned by the caller".to_owned(),
            })?;
        let image = decoded.map_err(|err| CaptureError::Conversion {
            camera: session.camera().to_owned(),
            reason: err.to_string(),
        })?;

        self.frames += 1;
        self.last_timestamp_ns = Some(timestamp_ns);
        debug!(
            camera = %session.camera(),
            sequence = filled.sequence,
            bytes_used = filled.bytes_used,
            timestamp_ns,
            "frame acquired"
        );

        Ok(Frame {
            cam_id: self.cam_id.clone(),
            image,
            timestamp_ns,
            metadata: FrameMetadata {
                sequence: filled.sequence,
                device_timestamp: filled.timestamp.as_duration(),
                bytes_used: filled.bytes_used,
            },
        })
    }

    fn enqueue<B: CaptureBackend>(
        &mut self,
        session: &mut DeviceSession<B>,
        buffer: &mut MappedBuffer<B::Region>,
    ) -> Result<()> {
        let Some(descriptor) = buffer.descriptor().copied() else {
            return Err(CaptureError::NotInitialized {
                camera: session.camera().to_owned(),
            });
        };
        if let Err(source) = session.backend_mut().queue_buffer(&descriptor) {
            error!(camera = %session.camera(), error = %source, "VIDIOC_QBUF failed to queue the image buffer");
            self.state = StreamState::Failed;
            return Err(CaptureError::Enqueue {
                camera: session.camera().to_owned(),
                source,
            });
        }
        buffer.hand_to_kernel();
        Ok(())
    }

    fn dequeue<B: CaptureBackend>(
        &mut self,
        session: &mut DeviceSession<B>,
        buffer: &mut MappedBuffer<B::Region>,
    ) -> Result<()> {
        match session.backend_mut().dequeue_buffer() {
            Ok(filled) => {
                buffer.reclaim(filled);
                Ok(())
            }
            Err(source) => {
                error!(camera = %session.camera(), error = %source, "VIDIOC_DQBUF failed to dequeue the image buffer");
                self.state = StreamState::Failed;
                Err(CaptureError::Dequeue {
                    camera: session.camera().to_owned(),
                    source,
                })
            }
        }
    }

    /// `VIDIOC_STREAMOFF` if capture was ever enabled.
    ///
    /// The loop ends up `Stopped` even when the request fails; the caller
    /// decides whether the error matters.
    pub fn stop<B: CaptureBackend>(&mut self, session: &mut DeviceSession<B>) -> Result<()> {
        let was_streaming = matches!(self.state, StreamState::Streaming | StreamState::Failed);
        self.state = StreamState::Stopped;
        if !was_streaming {
            return Ok(());
        }
        session
            .backend_mut()
            .stream_off()
            .map_err(|source| CaptureError::StreamOff {
                camera: session.camera().to_owned(),
                source,
            })?;
        info!(camera = %session.camera(), frames = self.frames, "streaming stopped");
        Ok(())
    }
}
