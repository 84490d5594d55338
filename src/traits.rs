//! Core traits and types for the V4L2 buffer-exchange protocol.

use std::io;
use std::path::Path;
use std::time::Duration;

use image::{GrayImage, ImageBuffer, Luma, RgbImage};

/// Pixel format representation (e.g., YUYV, YV12, Y16).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// YVU 4:2:0 planar (`V4L2_PIX_FMT_YVU420`).
    pub const YV12: Self = Self::new(b"YV12");
    /// 16-bit greyscale (`V4L2_PIX_FMT_Y16`).
    pub const Y16: Self = Self::new(b"Y16 ");

    /// The little-endian code the kernel stores in `pixelformat`.
    #[must_use]
    pub const fn code(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    /// Rebuild from the kernel's `pixelformat` field.
    #[must_use]
    pub const fn from_code(code: u32) -> Self {
        Self(code.to_le_bytes())
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// The closed set of capture formats this crate can decode.
///
/// The numeric selectors are stable and used by configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Planar YVU 4:2:0; decoded to 8-bit grayscale from the luma plane.
    PlanarYuv420,
    /// Raw 16-bit grayscale.
    Grayscale16,
    /// Packed YUYV 4:2:2; decoded to RGB.
    PackedYuyv,
}

impl PixelFormat {
    /// Every supported format.
    pub const ALL: [Self; 3] = [Self::PlanarYuv420, Self::Grayscale16, Self::PackedYuyv];

    /// Look up a configuration selector.
    #[must_use]
    pub const fn from_selector(selector: u32) -> Option<Self> {
        match selector {
            1 => Some(Self::PlanarYuv420),
            2 => Some(Self::Grayscale16),
            5 => Some(Self::PackedYuyv),
            _ => None,
        }
    }

    /// Configuration selector for this format.
    #[must_use]
    pub const fn selector(self) -> u32 {
        match self {
            Self::PlanarYuv420 => 1,
            Self::Grayscale16 => 2,
            Self::PackedYuyv => 5,
        }
    }

    /// Kernel pixel format code requested from the driver.
    #[must_use]
    pub const fn fourcc(self) -> FourCC {
        match self {
            Self::PlanarYuv420 => FourCC::YV12,
            Self::Grayscale16 => FourCC::Y16,
            Self::PackedYuyv => FourCC::YUYV,
        }
    }

    /// Rows in the raw buffer for a given sensor height.
    ///
    /// Planar 4:2:0 appends the two quarter-size chroma planes below the
    /// luma plane, so the buffer is 1.5x the sensor height. `None` when that
    /// does not fit in `u32`.
    #[must_use]
    pub const fn buffer_height(self, sensor_height: u32) -> Option<u32> {
        match self {
            Self::PlanarYuv420 => sensor_height.checked_add(sensor_height / 2),
            Self::Grayscale16 | Self::PackedYuyv => Some(sensor_height),
        }
    }

    /// Bytes per pixel in the buffer rows.
    #[must_use]
    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::PlanarYuv420 => 1,
            Self::Grayscale16 | Self::PackedYuyv => 2,
        }
    }
}

/// Video format specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Bytes per line (stride).
    pub stride: u32,
    /// Total frame size in bytes.
    pub size: u32,
}

impl Format {
    /// Create a format request for a sensor resolution.
    ///
    /// Returns `None` when the line stride or the frame size overflows `u32`,
    /// the width of the kernel's `bytesperline` and `sizeimage` fields.
    #[must_use]
    pub const fn new(width: u32, height: u32, pixel_format: PixelFormat) -> Option<Self> {
        let Some(stride) = width.checked_mul(pixel_format.bytes_per_pixel()) else {
            return None;
        };
        let Some(rows) = pixel_format.buffer_height(height) else {
            return None;
        };
        let Some(size) = stride.checked_mul(rows) else {
            return None;
        };
        Some(Self {
            width,
            height,
            fourcc: pixel_format.fourcc(),
            stride,
            size,
        })
    }
}

/// Byte layout of a negotiated capture buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    /// Negotiated pixel format.
    pub pixel_format: PixelFormat,
    /// Sensor width in pixels.
    pub width: u32,
    /// Sensor height in pixels.
    pub sensor_height: u32,
    /// Rows in the raw buffer.
    pub buffer_height: u32,
    /// Bytes per buffer row, including any driver padding.
    pub stride: u32,
}

impl FrameLayout {
    /// Derive the layout for a sensor resolution with unpadded rows.
    ///
    /// Dimensions too large for `u32` saturate; negotiation only builds
    /// layouts for formats that [`Format::new`] accepted.
    #[must_use]
    pub const fn new(pixel_format: PixelFormat, width: u32, sensor_height: u32) -> Self {
        let buffer_height = match pixel_format.buffer_height(sensor_height) {
            Some(rows) => rows,
            None => u32::MAX,
        };
        Self {
            pixel_format,
            width,
            sensor_height,
            buffer_height,
            stride: width.saturating_mul(pixel_format.bytes_per_pixel()),
        }
    }

    /// Use the driver-reported line stride; smaller values are ignored.
    #[must_use]
    pub const fn with_stride(mut self, stride: u32) -> Self {
        if stride > self.stride {
            self.stride = stride;
        }
        self
    }

    /// Bytes of one unpadded pixel row.
    #[must_use]
    pub const fn row_bytes(&self) -> usize {
        self.width as usize * self.pixel_format.bytes_per_pixel() as usize
    }

    /// Bytes needed to decode one frame. The last row may omit its padding.
    #[must_use]
    pub const fn min_bytes(&self) -> usize {
        if self.buffer_height == 0 {
            return 0;
        }
        (self.stride as usize)
            .saturating_mul(self.buffer_height as usize - 1)
            .saturating_add(self.row_bytes())
    }
}

/// Device capability flags.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Whether the device can capture single-planar video.
    pub can_capture: bool,
    /// Whether the device supports streaming I/O.
    pub can_stream: bool,
}

/// Device-relative capture time as reported in `v4l2_buffer.timestamp`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct BufferTimestamp {
    /// Seconds on the device's monotonic clock.
    pub sec: i64,
    /// Microseconds within the second.
    pub usec: i64,
}

impl BufferTimestamp {
    /// Nanoseconds on the device clock.
    #[must_use]
    pub const fn as_nanos(self) -> i64 {
        self.sec
            .saturating_mul(1_000_000_000)
            .saturating_add(self.usec.saturating_mul(1_000))
    }

    /// As a duration; negative components clamp to zero.
    #[must_use]
    pub fn as_duration(self) -> Duration {
        #[allow(clippy::cast_sign_loss)]
        let secs = self.sec.max(0) as u64;
        #[allow(clippy::cast_sign_loss)]
        let micros = self.usec.max(0) as u64;
        Duration::from_secs(secs) + Duration::from_micros(micros)
    }
}

/// Kernel buffer descriptor (`struct v4l2_buffer`) fields this crate uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferDescriptor {
    /// Buffer index.
    pub index: u32,
    /// Length of the mappable region.
    pub length: u32,
    /// Device-assigned mmap offset.
    pub offset: u32,
    /// Bytes the device wrote into the buffer.
    pub bytes_used: u32,
    /// Frame sequence number.
    pub sequence: u32,
    /// Capture time on the device clock.
    pub timestamp: BufferTimestamp,
}

/// Metadata for a captured frame.
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    /// Frame sequence number.
    pub sequence: u32,
    /// Capture timestamp on the device clock.
    pub device_timestamp: Duration,
    /// Actual bytes used in the frame buffer.
    pub bytes_used: u32,
}

/// 16-bit single channel image.
pub type Gray16Image = ImageBuffer<Luma<u16>, Vec<u16>>;

/// Decoded pixel matrix, one variant per output color space.
#[derive(Debug, Clone)]
pub enum FrameImage {
    /// 8-bit grayscale.
    Gray8(GrayImage),
    /// 16-bit grayscale.
    Gray16(Gray16Image),
    /// 8-bit RGB.
    Rgb8(RgbImage),
}

impl FrameImage {
    /// Image width in pixels.
    pub fn width(&self) -> u32 {
        match self {
            Self::Gray8(img) => img.width(),
            Self::Gray16(img) => img.width(),
            Self::Rgb8(img) => img.width(),
        }
    }

    /// Image height in pixels.
    pub fn height(&self) -> u32 {
        match self {
            Self::Gray8(img) => img.height(),
            Self::Gray16(img) => img.height(),
            Self::Rgb8(img) => img.height(),
        }
    }

    /// Number of channels per pixel.
    pub const fn channels(&self) -> u8 {
        match self {
            Self::Gray8(_) | Self::Gray16(_) => 1,
            Self::Rgb8(_) => 3,
        }
    }

    /// Get RGB values for a pixel, replicating gray channels.
    ///
    /// 16-bit samples are reduced to their high byte. Returns `None` outside
    /// the image.
    #[must_use]
    pub fn pixel_rgb(&self, x: u32, y: u32) -> Option<(u8, u8, u8)> {
        match self {
            Self::Gray8(img) => img.get_pixel_checked(x, y).map(|&Luma([v])| (v, v, v)),
            Self::Gray16(img) => img.get_pixel_checked(x, y).map(|&Luma([v])| {
                let [hi, _] = v.to_be_bytes();
                (hi, hi, hi)
            }),
            Self::Rgb8(img) => img
                .get_pixel_checked(x, y)
                .map(|&image::Rgb([r, g, b])| (r, g, b)),
        }
    }
}

/// A captured, decoded and epoch-stamped frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Logical camera identifier from the configuration.
    pub cam_id: String,
    /// Decoded pixels, copied out of the shared buffer.
    pub image: FrameImage,
    /// Capture time in nanoseconds since the Unix epoch.
    pub timestamp_ns: i64,
    /// Frame metadata.
    pub metadata: FrameMetadata,
}

/// A memory region shared with the device. Dropping it unmaps it.
pub trait MappedRegion {
    /// Region length in bytes.
    fn len(&self) -> usize;

    /// Whether the region has zero length.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite every byte.
    fn fill(&mut self, byte: u8);

    /// Borrow the bytes for the duration of `f`.
    fn with_bytes<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R;
}

/// Abstraction over the kernel's video-capture ioctl protocol.
///
/// Every method maps to one request on the open device handle. Buffer type is
/// always single-planar video capture and memory type is always mmap.
pub trait CaptureBackend {
    /// Region type returned by `map_buffer`.
    type Region: MappedRegion;

    /// Open the device node for read/write.
    fn open(&mut self, path: &Path) -> io::Result<()>;

    /// Whether a handle is currently held.
    fn is_open(&self) -> bool;

    /// `VIDIOC_QUERYCAP`.
    fn query_capabilities(&self) -> io::Result<DeviceCapabilities>;

    /// `VIDIOC_S_FMT`. Returns the format the driver actually applied.
    fn set_format(&mut self, format: &Format) -> io::Result<Format>;

    /// `VIDIOC_REQBUFS`. Returns the number of buffers granted.
    fn request_buffers(&mut self, count: u32) -> io::Result<u32>;

    /// `VIDIOC_QUERYBUF`.
    fn query_buffer(&mut self, index: u32) -> io::Result<BufferDescriptor>;

    /// Map `descriptor.length` bytes at `descriptor.offset`, read-write, shared.
    fn map_buffer(&mut self, descriptor: &BufferDescriptor) -> io::Result<Self::Region>;

    /// `VIDIOC_STREAMON`.
    fn stream_on(&mut self) -> io::Result<()>;

    /// `VIDIOC_STREAMOFF`.
    fn stream_off(&mut self) -> io::Result<()>;

    /// `VIDIOC_QBUF`: hand the buffer to the kernel.
    fn queue_buffer(&mut self, descriptor: &BufferDescriptor) -> io::Result<()>;

    /// `VIDIOC_DQBUF`: block until a queued buffer has been filled.
    fn dequeue_buffer(&mut self) -> io::Result<BufferDescriptor>;

    /// Release the handle. Closing a closed backend is a no-op.
    fn close(&mut self) -> io::Result<()>;
}
