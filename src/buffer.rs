//! The single memory-mapped capture buffer and its ownership state.
//!
//! Setup order is fixed: allocate on the device, query the descriptor, then
//! map. Each step refuses to run before its predecessor succeeded.

use std::io;

use tracing::{debug, error, info, warn};

use crate::error::{CaptureError, Result};
use crate::session::DeviceSession;
use crate::traits::{BufferDescriptor, CaptureBackend, MappedRegion};

/// Number of hardware buffers requested from the device.
pub const BUFFER_COUNT: u32 = 1;

/// Who may touch the bytes of the mapped region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// No region is mapped.
    Unmapped,
    /// Dequeued (or never queued); the process may read the bytes.
    Caller,
    /// Queued; the device may be writing the bytes.
    Kernel,
}

/// One kernel capture buffer mapped into the process.
pub struct MappedBuffer<R: MappedRegion> {
    allocated: bool,
    descriptor: Option<BufferDescriptor>,
    region: Option<R>,
    ownership: Ownership,
}

impl<R: MappedRegion> Default for MappedBuffer<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: MappedRegion> MappedBuffer<R> {
    /// A buffer with no device-side state yet.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            allocated: false,
            descriptor: None,
            region: None,
            ownership: Ownership::Unmapped,
        }
    }

    /// Current ownership of the region.
    pub const fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Whether a region is currently mapped.
    pub const fn is_mapped(&self) -> bool {
        self.region.is_some()
    }

    /// Descriptor from `query_descriptor`, updated by every dequeue.
    pub const fn descriptor(&self) -> Option<&BufferDescriptor> {
        self.descriptor.as_ref()
    }

    /// `VIDIOC_REQBUFS` for exactly one mmap capture buffer.
    pub fn request_allocation<B>(&mut self, session: &mut DeviceSession<B>) -> Result<()>
    where
        B: CaptureBackend<Region = R>,
    {
        let camera = session.camera().to_owned();
        let granted = session
            .backend_mut()
            .request_buffers(BUFFER_COUNT)
            .and_then(|granted| {
                if granted == 0 {
                    Err(io::Error::other("device granted no buffers"))
                } else {
                    Ok(granted)
                }
            })
            .map_err(|source| {
                error!(camera = %camera, error = %source, "VIDIOC_REQBUFS failed to allocate buffer");
                CaptureError::BufferAllocation {
                    camera: camera.clone(),
                    source,
                }
            })?;

        if granted != BUFFER_COUNT {
            // Only index 0 is ever mapped and queued.
            warn!(camera = %camera, granted, "device granted more buffers than requested");
        }
        self.allocated = true;
        debug!(camera = %camera, granted, "allocated capture buffer");
        Ok(())
    }

    /// `VIDIOC_QUERYBUF` for index 0.
    pub fn query_descriptor<B>(&mut self, session: &mut DeviceSession<B>) -> Result<BufferDescriptor>
    where
        B: CaptureBackend<Region = R>,
    {
        let camera = session.camera().to_owned();
        let queried = if self.allocated {
            session.backend_mut().query_buffer(0)
        } else {
            Err(io::Error::other("buffers have not been allocated"))
        };
        let descriptor = queried.map_err(|source| {
            error!(camera = %camera, error = %source, "VIDIOC_QUERYBUF failed to retrieve buffer information");
            CaptureError::BufferQuery {
                camera: camera.clone(),
                source,
            }
        })?;

        debug!(
            camera = %camera,
            length = descriptor.length,
            offset = descriptor.offset,
            "queried capture buffer"
        );
        self.descriptor = Some(descriptor);
        Ok(descriptor)
    }

    /// Map the queried buffer and zero it.
    pub fn establish_mapping<B>(&mut self, session: &mut DeviceSession<B>) -> Result<()>
    where
        B: CaptureBackend<Region = R>,
    {
        let camera = session.camera().to_owned();
        if self.region.is_some() {
            return Ok(());
        }
        let mapped = match self.descriptor.as_ref() {
            Some(descriptor) if descriptor.length > 0 => session.backend_mut().map_buffer(descriptor),
            Some(_) => Err(io::Error::other("device reported a zero-length buffer")),
            None => Err(io::Error::other("buffer descriptor has not been queried")),
        };
        let mut region = mapped.map_err(|source| {
            error!(camera = %camera, error = %source, "failed to create a memory map for buffer");
            CaptureError::Mapping {
                camera: camera.clone(),
                source,
            }
        })?;

        region.fill(0);
        info!(camera = %camera, len = region.len(), "mapped capture buffer");
        self.region = Some(region);
        self.ownership = Ownership::Caller;
        Ok(())
    }

    /// Unmap the region. A no-op when nothing is mapped.
    pub fn release(&mut self) {
        if let Some(region) = self.region.take() {
            if self.ownership == Ownership::Kernel {
                warn!(len = region.len(), "unmapping a buffer still queued to the device");
            }
            drop(region);
            debug!("unmapped capture buffer");
        }
        self.ownership = Ownership::Unmapped;
    }

    /// Record that the buffer was queued to the device.
    pub(crate) fn hand_to_kernel(&mut self) {
        self.ownership = Ownership::Kernel;
    }

    /// Record a dequeue; keeps the mapping geometry from the original query.
    pub(crate) fn reclaim(&mut self, filled: BufferDescriptor) {
        let merged = match self.descriptor {
            Some(known) => BufferDescriptor {
                length: known.length,
                offset: known.offset,
                ..filled
            },
            None => filled,
        };
        self.descriptor = Some(merged);
        self.ownership = Ownership::Caller;
    }

    /// Record that `VIDIOC_STREAMOFF` dequeued the buffer without a fill.
    pub(crate) fn reclaim_after_stream_off(&mut self) {
        if self.region.is_some() {
            self.ownership = Ownership::Caller;
        }
    }

    /// Borrow the bytes while the caller owns them; `None` otherwise.
    pub fn read<T, F>(&self, f: F) -> Option<T>
    where
        F: FnOnce(&[u8]) -> T,
    {
        if self.ownership != Ownership::Caller {
            return None;
        }
        self.region.as_ref().map(|region| region.with_bytes(f))
    }
}
