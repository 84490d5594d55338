//! Mock device implementation for testing without hardware.
//!
//! Behaves like a single-buffer V4L2 driver: a buffer must be queued before it
//! can be dequeued, queueing twice fails, and stream-off returns the buffer.
//! A [`MockObserver`] keeps observing the device after it moved into a session.

use std::cell::RefCell;
use std::io;
use std::path::Path;
use std::rc::Rc;

use crate::traits::{
    BufferDescriptor, BufferTimestamp, CaptureBackend, DeviceCapabilities, Format, FrameLayout,
    MappedRegion, PixelFormat,
};

/// Device requests, in the order the mock saw them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// `open(2)`.
    Open,
    /// `VIDIOC_QUERYCAP`.
    QueryCap,
    /// `VIDIOC_S_FMT`.
    SetFormat,
    /// `VIDIOC_REQBUFS`.
    RequestBuffers,
    /// `VIDIOC_QUERYBUF`.
    QueryBuffer,
    /// `mmap(2)`.
    Map,
    /// `VIDIOC_STREAMON`.
    StreamOn,
    /// `VIDIOC_STREAMOFF`.
    StreamOff,
    /// `VIDIOC_QBUF`.
    Queue,
    /// `VIDIOC_DQBUF`.
    Dequeue,
    /// `munmap(2)`.
    Unmap,
    /// `close(2)`.
    Close,
}

/// Test pattern types for mock frame generation.
#[derive(Debug, Clone, Copy)]
pub enum TestPattern {
    /// SMPTE color bars pattern.
    ColorBars,
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Solid color with specified Y, U, V values.
    Solid(u8, u8, u8),
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<Op>,
    open: bool,
    streaming: bool,
    queued: bool,
    unmaps: usize,
    format: Option<Format>,
    sequence: u32,
}

/// Read-only view of a mock device's recorded state.
#[derive(Debug, Clone)]
pub struct MockObserver(Rc<RefCell<MockState>>);

impl MockObserver {
    /// Every request in order.
    pub fn calls(&self) -> Vec<Op> {
        self.0.borrow().calls.clone()
    }

    /// How many times `op` was requested.
    pub fn count(&self, op: Op) -> usize {
        self.0.borrow().calls.iter().filter(|&&call| call == op).count()
    }

    /// Number of regions unmapped.
    pub fn unmaps(&self) -> usize {
        self.0.borrow().unmaps
    }

    /// Whether the device handle is open.
    pub fn is_open(&self) -> bool {
        self.0.borrow().open
    }

    /// Whether capture is enabled.
    pub fn is_streaming(&self) -> bool {
        self.0.borrow().streaming
    }

    /// Whether the buffer is queued to the device.
    pub fn is_queued(&self) -> bool {
        self.0.borrow().queued
    }
}

/// Mock device for testing without hardware.
pub struct MockDevice {
    state: Rc<RefCell<MockState>>,
    capabilities: DeviceCapabilities,
    max_resolution: Option<(u32, u32)>,
    granted_buffers: u32,
    failures: Vec<(Op, Option<usize>)>,
    dirty_byte: u8,
    mapped_len: Option<usize>,
    short_frames: Vec<(usize, u32)>,
    pattern: TestPattern,
    region: Option<Rc<RefCell<Vec<u8>>>>,
    base_time: BufferTimestamp,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// Buffer length reported before any format is set.
    pub const BUFFER_LEN: usize = 640 * 480 * 2;

    /// Microseconds between frames (~30fps).
    pub const FRAME_INTERVAL_US: i64 = 33_333;

    /// Create a new mock device with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(MockState::default())),
            capabilities: DeviceCapabilities {
                driver: "mock".to_owned(),
                card: "Mock Camera".to_owned(),
                bus_info: "mock:0".to_owned(),
                can_capture: true,
                can_stream: true,
            },
            max_resolution: None,
            granted_buffers: 1,
            failures: Vec::new(),
            dirty_byte: 0,
            mapped_len: None,
            short_frames: Vec::new(),
            pattern: TestPattern::Gradient,
            region: None,
            base_time: BufferTimestamp { sec: 1_000, usec: 0 },
        }
    }

    /// Observe this device after it has been moved into a session.
    #[must_use]
    pub fn observer(&self) -> MockObserver {
        MockObserver(Rc::clone(&self.state))
    }

    /// Set the capabilities for this mock device.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: DeviceCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Clamp requested resolutions like a driver with a smaller sensor.
    #[must_use]
    pub const fn with_max_resolution(mut self, width: u32, height: u32) -> Self {
        self.max_resolution = Some((width, height));
        self
    }

    /// Number of buffers `VIDIOC_REQBUFS` grants.
    #[must_use]
    pub const fn with_granted_buffers(mut self, count: u32) -> Self {
        self.granted_buffers = count;
        self
    }

    /// Fill new mappings with `byte` instead of zero.
    #[must_use]
    pub const fn with_dirty_buffer(mut self, byte: u8) -> Self {
        self.dirty_byte = byte;
        self
    }

    /// Map only `len` bytes, whatever length `VIDIOC_QUERYBUF` reported.
    #[must_use]
    pub const fn with_mapped_len(mut self, len: usize) -> Self {
        self.mapped_len = Some(len);
        self
    }

    /// Report `bytes_used` for the `nth` (1-based) dequeue instead of the
    /// full frame size.
    #[must_use]
    pub fn with_short_frame(mut self, nth: usize, bytes_used: u32) -> Self {
        self.short_frames.push((nth, bytes_used));
        self
    }

    /// Pattern written into the buffer on every dequeue.
    #[must_use]
    pub const fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Fail every request of this kind.
    #[must_use]
    pub fn fail_on(mut self, op: Op) -> Self {
        self.failures.push((op, None));
        self
    }

    /// Fail only the `nth` (1-based) request of this kind.
    #[must_use]
    pub fn fail_nth(mut self, op: Op, nth: usize) -> Self {
        self.failures.push((op, Some(nth)));
        self
    }

    /// Record `op` and decide whether it fails.
    fn call(&self, op: Op) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(op);
        let seen = state.calls.iter().filter(|&&call| call == op).count();
        drop(state);

        let injected = self
            .failures
            .iter()
            .any(|&(failing, nth)| failing == op && nth.is_none_or(|n| n == seen));
        if injected {
            return Err(io::Error::other(format!("injected {op:?} failure")));
        }
        if op != Op::Open && op != Op::Close && !self.state.borrow().open {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        Ok(())
    }

    fn buffer_len(&self) -> usize {
        self.state
            .borrow()
            .format
            .as_ref()
            .map_or(Self::BUFFER_LEN, |format| format.size as usize)
    }

    fn layout(&self) -> Option<FrameLayout> {
        let state = self.state.borrow();
        let format = state.format.as_ref()?;
        let pixel_format = PixelFormat::ALL
            .into_iter()
            .find(|candidate| candidate.fourcc() == format.fourcc)?;
        Some(FrameLayout::new(pixel_format, format.width, format.height))
    }
}

impl CaptureBackend for MockDevice {
    type Region = MockRegion;

    fn open(&mut self, _path: &Path) -> io::Result<()> {
        self.call(Op::Open)?;
        self.state.borrow_mut().open = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.borrow().open
    }

    fn query_capabilities(&self) -> io::Result<DeviceCapabilities> {
        self.call(Op::QueryCap)?;
        Ok(self.capabilities.clone())
    }

    fn set_format(&mut self, format: &Format) -> io::Result<Format> {
        self.call(Op::SetFormat)?;
        let pixel_format = PixelFormat::ALL
            .into_iter()
            .find(|candidate| candidate.fourcc() == format.fourcc)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
        let (width, height) = match self.max_resolution {
            Some((max_w, max_h)) => (format.width.min(max_w), format.height.min(max_h)),
            None => (format.width, format.height),
        };
        let applied = Format::new(width, height, pixel_format)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))?;
        self.state.borrow_mut().format = Some(applied.clone());
        Ok(applied)
    }

    fn request_buffers(&mut self, _count: u32) -> io::Result<u32> {
        self.call(Op::RequestBuffers)?;
        Ok(self.granted_buffers)
    }

    fn query_buffer(&mut self, index: u32) -> io::Result<BufferDescriptor> {
        self.call(Op::QueryBuffer)?;
        if index != 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        #[allow(clippy::cast_possible_truncation)]
        let length = self.buffer_len() as u32;
        Ok(BufferDescriptor {
            index,
            length,
            offset: 0,
            ..BufferDescriptor::default()
        })
    }

    fn map_buffer(&mut self, descriptor: &BufferDescriptor) -> io::Result<MockRegion> {
        self.call(Op::Map)?;
        let len = self
            .mapped_len
            .unwrap_or(descriptor.length as usize)
            .min(descriptor.length as usize);
        let bytes = Rc::new(RefCell::new(vec![self.dirty_byte; len]));
        self.region = Some(Rc::clone(&bytes));
        Ok(MockRegion {
            bytes,
            state: Rc::clone(&self.state),
        })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        self.call(Op::StreamOn)?;
        self.state.borrow_mut().streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        self.call(Op::StreamOff)?;
        let mut state = self.state.borrow_mut();
        state.streaming = false;
        state.queued = false;
        Ok(())
    }

    fn queue_buffer(&mut self, descriptor: &BufferDescriptor) -> io::Result<()> {
        self.call(Op::Queue)?;
        let mut state = self.state.borrow_mut();
        if descriptor.index != 0 || state.queued {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        state.queued = true;
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> io::Result<BufferDescriptor> {
        self.call(Op::Dequeue)?;
        {
            let state = self.state.borrow();
            if !state.streaming {
                return Err(io::Error::from_raw_os_error(libc::EINVAL));
            }
            if !state.queued {
                return Err(io::Error::other("no buffer queued, DQBUF would block forever"));
            }
        }

        if let (Some(region), Some(layout)) = (&self.region, self.layout()) {
            generate_test_frame(&mut region.borrow_mut(), &layout, self.pattern);
        }

        let mut state = self.state.borrow_mut();
        state.queued = false;
        let sequence = state.sequence;
        state.sequence += 1;

        let elapsed_us = i64::from(sequence) * Self::FRAME_INTERVAL_US;
        let nth = state.calls.iter().filter(|&&call| call == Op::Dequeue).count();
        #[allow(clippy::cast_possible_truncation)]
        let bytes_used = self
            .short_frames
            .iter()
            .find(|&&(short, _)| short == nth)
            .map_or_else(
                || state.format.as_ref().map_or(Self::BUFFER_LEN as u32, |f| f.size),
                |&(_, bytes_used)| bytes_used,
            );
        Ok(BufferDescriptor {
            index: 0,
            length: 0,
            offset: 0,
            bytes_used,
            sequence,
            timestamp: BufferTimestamp {
                sec: self.base_time.sec + elapsed_us / 1_000_000,
                usec: self.base_time.usec + elapsed_us % 1_000_000,
            },
        })
    }

    fn close(&mut self) -> io::Result<()> {
        self.call(Op::Close)?;
        self.state.borrow_mut().open = false;
        Ok(())
    }
}

/// Heap-backed stand-in for an mmap region. Counts as unmapped when dropped.
pub struct MockRegion {
    bytes: Rc<RefCell<Vec<u8>>>,
    state: Rc<RefCell<MockState>>,
}

impl MappedRegion for MockRegion {
    fn len(&self) -> usize {
        self.bytes.borrow().len()
    }

    fn fill(&mut self, byte: u8) {
        self.bytes.borrow_mut().fill(byte);
    }

    fn with_bytes<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.bytes.borrow())
    }
}

impl Drop for MockRegion {
    fn drop(&mut self) {
        let mut state = self.state.borrow_mut();
        state.unmaps += 1;
        state.calls.push(Op::Unmap);
    }
}

/// SMPTE bars as (Y, U, V): White, Yellow, Cyan, Green, Magenta, Red, Blue, Black.
const COLOR_BARS: [(u8, u8, u8); 8] = [
    (235, 128, 128),
    (210, 16, 146),
    (170, 166, 16),
    (145, 54, 34),
    (106, 202, 222),
    (81, 90, 240),
    (41, 240, 110),
    (16, 128, 128),
];

/// YUV sample for column `x` of a `width`-wide pattern.
fn pattern_yuv(pattern: TestPattern, x: u32, width: u32) -> (u8, u8, u8) {
    match pattern {
        TestPattern::ColorBars => {
            let bar_width = (width / 8).max(1);
            let bar_idx = (x / bar_width).min(7) as usize;
            COLOR_BARS[bar_idx]
        }
        TestPattern::Gradient => {
            #[allow(clippy::cast_possible_truncation)]
            let y = ((x * 255) / width) as u8;
            (y, 128, 128)
        }
        TestPattern::Solid(y, u, v) => (y, u, v),
    }
}

/// Generate test frame data for the negotiated layout.
fn generate_test_frame(data: &mut [u8], layout: &FrameLayout, pattern: TestPattern) {
    match layout.pixel_format {
        PixelFormat::PackedYuyv => generate_yuyv(data, layout.width, layout.sensor_height, pattern),
        PixelFormat::PlanarYuv420 => {
            generate_yvu420(data, layout.width, layout.sensor_height, pattern);
        }
        PixelFormat::Grayscale16 => generate_y16(data, layout.width, layout.sensor_height, pattern),
    }
}

/// Packed YUYV, two pixels per [Y0 U Y1 V] group.
fn generate_yuyv(data: &mut [u8], width: u32, height: u32, pattern: TestPattern) {
    for y in 0..height {
        for x in (0..width).step_by(2) {
            let (y_val, u_val, v_val) = pattern_yuv(pattern, x, width);
            let offset = ((y * width + x) * 2) as usize;
            if offset + 3 < data.len() {
                data[offset] = y_val; // Y0
                data[offset + 1] = u_val; // U
                data[offset + 2] = y_val; // Y1
                data[offset + 3] = v_val; // V
            }
        }
    }
}

/// Planar YVU 4:2:0: full-size Y, then quarter-size V and U planes.
fn generate_yvu420(data: &mut [u8], width: u32, height: u32, pattern: TestPattern) {
    let luma_len = (width * height) as usize;
    let chroma_len = luma_len / 4;
    for y in 0..height {
        for x in 0..width {
            let (y_val, _, _) = pattern_yuv(pattern, x, width);
            if let Some(byte) = data.get_mut((y * width + x) as usize) {
                *byte = y_val;
            }
        }
    }
    let (_, u_val, v_val) = pattern_yuv(pattern, 0, width);
    if let Some(v_plane) = data.get_mut(luma_len..luma_len + chroma_len) {
        v_plane.fill(v_val);
    }
    if let Some(u_plane) = data.get_mut(luma_len + chroma_len..luma_len + 2 * chroma_len) {
        u_plane.fill(u_val);
    }
}

/// Little-endian 16-bit luma, 8-bit pattern value in the high byte.
fn generate_y16(data: &mut [u8], width: u32, height: u32, pattern: TestPattern) {
    for y in 0..height {
        for x in 0..width {
            let (y_val, _, _) = pattern_yuv(pattern, x, width);
            let sample = (u16::from(y_val) << 8) | u16::from(y_val);
            let offset = ((y * width + x) * 2) as usize;
            if let Some(slot) = data.get_mut(offset..offset + 2) {
                slot.copy_from_slice(&sample.to_le_bytes());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::FourCC;

    fn opened() -> MockDevice {
        let mut device = MockDevice::new();
        device.open(Path::new("/dev/video0")).expect("open should succeed");
        device
    }

    #[test]
    fn test_mock_device_creation() {
        let device = opened();
        let caps = device.query_capabilities().expect("caps");
        assert_eq!(caps.driver, "mock");
        assert!(caps.can_capture);
        assert!(caps.can_stream);
    }

    #[test]
    fn test_requests_on_closed_device_fail() {
        let mut device = MockDevice::new();
        let err = device.stream_on().expect_err("closed device");
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }

    #[test]
    fn test_mock_set_format_clamps() {
        let mut device = opened().with_max_resolution(320, 240);
        let requested = Format::new(640, 480, PixelFormat::PackedYuyv).expect("fits");
        let applied = device.set_format(&requested).expect("set_format");
        assert_eq!((applied.width, applied.height), (320, 240));
        assert_eq!(applied.fourcc, FourCC::YUYV);
    }

    #[test]
    fn test_queue_twice_fails() {
        let mut device = opened();
        let descriptor = BufferDescriptor::default();
        device.queue_buffer(&descriptor).expect("first queue");
        assert!(device.queue_buffer(&descriptor).is_err());
    }

    #[test]
    fn test_dequeue_requires_queued_buffer() {
        let mut device = opened();
        device.stream_on().expect("stream on");
        assert!(device.dequeue_buffer().is_err());

        device.queue_buffer(&BufferDescriptor::default()).expect("queue");
        let first = device.dequeue_buffer().expect("dequeue");
        device.queue_buffer(&BufferDescriptor::default()).expect("queue");
        let second = device.dequeue_buffer().expect("dequeue");
        assert_eq!(first.sequence, 0);
        assert_eq!(second.sequence, 1);
        assert!(second.timestamp > first.timestamp);
    }

    #[test]
    fn test_fail_nth_only_hits_once() {
        let mut device = opened().fail_nth(Op::StreamOn, 2);
        assert!(device.stream_on().is_ok());
        assert!(device.stream_on().is_err());
        assert!(device.stream_on().is_ok());
    }

    #[test]
    fn test_color_bars_pattern() {
        let layout = FrameLayout::new(PixelFormat::PackedYuyv, 640, 480);
        let mut data = vec![0u8; layout.min_bytes()];
        generate_test_frame(&mut data, &layout, TestPattern::ColorBars);

        // First bar should be white (Y=235)
        assert_eq!(data[0], 235);
    }

    #[test]
    fn test_gradient_pattern() {
        let layout = FrameLayout::new(PixelFormat::PackedYuyv, 640, 480);
        let mut data = vec![0u8; layout.min_bytes()];
        generate_test_frame(&mut data, &layout, TestPattern::Gradient);

        // Left edge should be dark
        assert!(data[0] < 10);

        // Right edge should be bright (check last row, last pixel)
        let last_row_start = (479 * 640 * 2) as usize;
        let last_pixel_y = data[last_row_start + 638 * 2];
        assert!(last_pixel_y > 200);
    }

    #[test]
    fn test_solid_pattern() {
        let layout = FrameLayout::new(PixelFormat::PackedYuyv, 64, 64);
        let mut data = vec![0u8; layout.min_bytes()];
        generate_test_frame(&mut data, &layout, TestPattern::Solid(128, 64, 192));

        // All Y values should be 128
        assert_eq!(data[0], 128);
        assert_eq!(data[2], 128);

        // U should be 64, V should be 192
        assert_eq!(data[1], 64);
        assert_eq!(data[3], 192);
    }

    #[test]
    fn test_yvu420_planes() {
        let layout = FrameLayout::new(PixelFormat::PlanarYuv420, 8, 4);
        let mut data = vec![0u8; layout.min_bytes()];
        generate_test_frame(&mut data, &layout, TestPattern::Solid(90, 60, 200));

        assert!(data[..32].iter().all(|&b| b == 90));
        assert!(data[32..40].iter().all(|&b| b == 200));
        assert!(data[40..48].iter().all(|&b| b == 60));
    }

    #[test]
    fn test_y16_samples() {
        let layout = FrameLayout::new(PixelFormat::Grayscale16, 4, 1);
        let mut data = vec![0u8; layout.min_bytes()];
        generate_test_frame(&mut data, &layout, TestPattern::Solid(0x12, 0, 0));
        assert_eq!(&data[..2], &[0x12, 0x12]);
    }
}
