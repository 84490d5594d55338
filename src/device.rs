//! V4L2 device implementation using the v4l crate.
//!
//! Capability and format requests go through v4l's safe `Device` API. The
//! buffer exchange needs exact control over each `VIDIOC_*` request and over
//! the mapping lifetime, so it talks to the kernel through v4l's raw
//! `v4l2::ioctl`/`mmap`/`munmap` wrappers and the `v4l_sys` structure layouts.
#![allow(unsafe_code)]

use std::io;
use std::mem;
use std::os::raw::{c_int, c_void};
use std::path::Path;
use std::ptr::{self, NonNull};

use tracing::{debug, error};
use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::memory::Memory;
use v4l::v4l2;
use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};
use v4l::video::Capture;
use v4l::Device;

use crate::traits::{
    BufferDescriptor, BufferTimestamp, CaptureBackend, DeviceCapabilities, Format, FourCC,
    MappedRegion,
};

/// V4L2 device implementation wrapping the v4l crate.
#[derive(Default)]
pub struct V4L2Device {
    device: Option<Device>,
}

impl V4L2Device {
    /// Create an unopened device.
    #[must_use]
    pub const fn new() -> Self {
        Self { device: None }
    }

    fn device(&self) -> io::Result<&Device> {
        self.device
            .as_ref()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }

    fn fd(&self) -> io::Result<c_int> {
        Ok(self.device()?.handle().fd())
    }

    /// Descriptor template for the single mmap capture buffer.
    fn buffer_template(index: u32) -> v4l2_buffer {
        v4l2_buffer {
            index,
            type_: Type::VideoCapture as u32,
            memory: Memory::Mmap as u32,
            // SAFETY: v4l2_buffer is a plain C struct; all-zero is its documented initial state.
            ..unsafe { mem::zeroed() }
        }
    }

    fn set_streaming(&self, on: bool) -> io::Result<()> {
        let fd = self.fd()?;
        let request = if on {
            v4l2::vidioc::VIDIOC_STREAMON
        } else {
            v4l2::vidioc::VIDIOC_STREAMOFF
        };
        let mut buf_type = Type::VideoCapture as u32;
        // SAFETY: STREAMON/STREAMOFF read a single u32 buffer type from the pointer.
        unsafe { v4l2::ioctl(fd, request, ptr::addr_of_mut!(buf_type).cast::<c_void>()) }
    }

    /// Block until the handle is readable. v4l opens devices non-blocking.
    fn wait_readable(fd: c_int) -> io::Result<()> {
        loop {
            let mut pollfd = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };
            // SAFETY: one valid pollfd, infinite timeout.
            let rc = unsafe { libc::poll(&mut pollfd, 1, -1) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if pollfd.revents & libc::POLLERR != 0 {
                return Err(io::Error::other("device signalled POLLERR"));
            }
            return Ok(());
        }
    }
}

#[allow(clippy::useless_conversion)]
fn descriptor_from_raw(raw: &v4l2_buffer) -> BufferDescriptor {
    BufferDescriptor {
        index: raw.index,
        length: raw.length,
        // SAFETY: for V4L2_MEMORY_MMAP buffers the kernel fills the `offset` member.
        offset: unsafe { raw.m.offset },
        bytes_used: raw.bytesused,
        sequence: raw.sequence,
        timestamp: BufferTimestamp {
            sec: i64::from(raw.timestamp.tv_sec),
            usec: i64::from(raw.timestamp.tv_usec),
        },
    }
}

impl CaptureBackend for V4L2Device {
    type Region = MmapRegion;

    fn open(&mut self, path: &Path) -> io::Result<()> {
        if self.device.is_some() {
            return Ok(());
        }
        self.device = Some(Device::with_path(path)?);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.device.is_some()
    }

    fn query_capabilities(&self) -> io::Result<DeviceCapabilities> {
        let caps = self.device()?.query_caps()?;
        Ok(DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            can_capture: caps.capabilities.contains(Flags::VIDEO_CAPTURE),
            can_stream: caps.capabilities.contains(Flags::STREAMING),
        })
    }

    fn set_format(&mut self, format: &Format) -> io::Result<Format> {
        let device = self.device()?;
        let mut fmt = device.format()?;

        fmt.width = format.width;
        fmt.height = format.height;
        fmt.fourcc = format.fourcc.into();

        let fmt = device.set_format(&fmt)?;

        Ok(Format {
            width: fmt.width,
            height: fmt.height,
            fourcc: FourCC::from(fmt.fourcc),
            stride: fmt.stride,
            size: fmt.size,
        })
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        let fd = self.fd()?;
        let mut request = v4l2_requestbuffers {
            count,
            type_: Type::VideoCapture as u32,
            memory: Memory::Mmap as u32,
            // SAFETY: plain C struct, zero is valid for the remaining fields.
            ..unsafe { mem::zeroed() }
        };
        // SAFETY: REQBUFS reads and writes one v4l2_requestbuffers.
        unsafe {
            v4l2::ioctl(
                fd,
                v4l2::vidioc::VIDIOC_REQBUFS,
                ptr::addr_of_mut!(request).cast::<c_void>(),
            )?;
        }
        Ok(request.count)
    }

    fn query_buffer(&mut self, index: u32) -> io::Result<BufferDescriptor> {
        let fd = self.fd()?;
        let mut raw = Self::buffer_template(index);
        // SAFETY: QUERYBUF reads and writes one v4l2_buffer.
        unsafe {
            v4l2::ioctl(
                fd,
                v4l2::vidioc::VIDIOC_QUERYBUF,
                ptr::addr_of_mut!(raw).cast::<c_void>(),
            )?;
        }
        Ok(descriptor_from_raw(&raw))
    }

    fn map_buffer(&mut self, descriptor: &BufferDescriptor) -> io::Result<MmapRegion> {
        let fd = self.fd()?;
        let len = descriptor.length as usize;
        let offset = libc::off_t::try_from(descriptor.offset)
            .map_err(|_| io::Error::other("buffer offset does not fit off_t"))?;
        // SAFETY: a fresh shared mapping of the driver-reported length/offset; the
        // kernel validates both against the buffer it allocated.
        let start = unsafe {
            v4l2::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                offset,
            )?
        };
        let ptr = NonNull::new(start.cast::<u8>())
            .ok_or_else(|| io::Error::other("mmap returned a null mapping"))?;
        debug!(len, offset = descriptor.offset, "mapped capture buffer");
        Ok(MmapRegion { ptr, len })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        self.set_streaming(true)
    }

    fn stream_off(&mut self) -> io::Result<()> {
        self.set_streaming(false)
    }

    fn queue_buffer(&mut self, descriptor: &BufferDescriptor) -> io::Result<()> {
        let fd = self.fd()?;
        let mut raw = Self::buffer_template(descriptor.index);
        // SAFETY: QBUF reads and writes one v4l2_buffer.
        unsafe {
            v4l2::ioctl(
                fd,
                v4l2::vidioc::VIDIOC_QBUF,
                ptr::addr_of_mut!(raw).cast::<c_void>(),
            )
        }
    }

    fn dequeue_buffer(&mut self) -> io::Result<BufferDescriptor> {
        let fd = self.fd()?;
        loop {
            Self::wait_readable(fd)?;
            let mut raw = Self::buffer_template(0);
            // SAFETY: DQBUF reads and writes one v4l2_buffer.
            let result = unsafe {
                v4l2::ioctl(
                    fd,
                    v4l2::vidioc::VIDIOC_DQBUF,
                    ptr::addr_of_mut!(raw).cast::<c_void>(),
                )
            };
            match result {
                Ok(()) => return Ok(descriptor_from_raw(&raw)),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(err),
            }
        }
    }

    fn close(&mut self) -> io::Result<()> {
        // Dropping the last handle reference closes the descriptor.
        self.device = None;
        Ok(())
    }
}

/// A `mmap`ed V4L2 capture buffer. Unmapped on drop.
pub struct MmapRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is exclusively owned by this value; moving it to another
// thread moves that exclusive ownership with it.
unsafe impl Send for MmapRegion {}

impl MappedRegion for MmapRegion {
    fn len(&self) -> usize {
        self.len
    }

    fn fill(&mut self, byte: u8) {
        // SAFETY: `ptr..ptr+len` is a live writable mapping owned by `self`.
        unsafe { ptr::write_bytes(self.ptr.as_ptr(), byte, self.len) }
    }

    fn with_bytes<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        // SAFETY: live mapping of `len` bytes; callers only borrow it while the
        // buffer is dequeued, so the device is not writing to it.
        let bytes = unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) };
        f(bytes)
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY: unmaps exactly the region created in `map_buffer`, once.
        if let Err(err) = unsafe { v4l2::munmap(self.ptr.as_ptr().cast::<c_void>(), self.len) } {
            error!(error = %err, len = self.len, "munmap of capture buffer failed");
        }
    }
}
