//! Translation between the device capture clock and wall-clock time.
//!
//! V4L2 drivers stamp buffers with `CLOCK_MONOTONIC`. The offset to the Unix
//! epoch is sampled once per session (or once per process and shared between
//! cameras so their timestamps stay comparable). It goes stale across a
//! suspend/resume cycle; re-estimate after the host wakes up.

use std::io;
use std::num::NonZeroI64;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::error::{CaptureError, Result};
use crate::traits::BufferTimestamp;

/// Samples taken before a persistently zero offset is reported as an error.
pub const MAX_ESTIMATE_ATTEMPTS: u32 = 8;

const NANOS_PER_MILLI: i64 = 1_000_000;

/// Source of back-to-back epoch and monotonic readings.
pub trait ClockSource {
    /// Returns `(epoch_millis, monotonic_millis)` read as close together as possible.
    fn sample_millis(&self) -> io::Result<(i64, i64)>;
}

/// The host's real-time and monotonic clocks.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClocks;

impl SystemClocks {
    fn epoch_millis() -> i64 {
        // Rounded to the nearest millisecond, before-epoch clocks go negative.
        let micros = match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(since) => i128::try_from(since.as_micros()).unwrap_or(i128::MAX),
            Err(err) => -i128::try_from(err.duration().as_micros()).unwrap_or(i128::MAX),
        };
        i64::try_from((micros + 500).div_euclid(1_000)).unwrap_or(i64::MAX)
    }

    #[allow(unsafe_code)]
    fn monotonic_millis() -> io::Result<i64> {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `ts` is a valid, writable timespec for the duration of the call.
        let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        #[allow(clippy::useless_conversion)]
        let secs = i64::from(ts.tv_sec);
        #[allow(clippy::useless_conversion)]
        let nanos = i64::from(ts.tv_nsec);
        Ok(secs * 1_000 + (nanos + 500_000) / NANOS_PER_MILLI)
    }
}

impl ClockSource for SystemClocks {
    fn sample_millis(&self) -> io::Result<(i64, i64)> {
        let epoch = Self::epoch_millis();
        let monotonic = Self::monotonic_millis()?;
        Ok((epoch, monotonic))
    }
}

/// Milliseconds such that `epoch_time = device_monotonic_time + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClockOffset(NonZeroI64);

impl ClockOffset {
    /// Wrap a known offset; zero is not a valid offset.
    #[must_use]
    pub const fn from_millis(millis: i64) -> Option<Self> {
        match NonZeroI64::new(millis) {
            Some(value) => Some(Self(value)),
            None => None,
        }
    }

    /// The offset in milliseconds.
    #[must_use]
    pub const fn as_millis(self) -> i64 {
        self.0.get()
    }

    /// Estimate the offset from the host clocks.
    pub fn estimate() -> Result<Self> {
        Self::estimate_with(&SystemClocks)
    }

    /// Estimate the offset from `clocks`, resampling when the difference is zero.
    pub fn estimate_with<C: ClockSource>(clocks: &C) -> Result<Self> {
        for attempt in 1..=MAX_ESTIMATE_ATTEMPTS {
            let (epoch, monotonic) = clocks
                .sample_millis()
                .map_err(|source| CaptureError::ClockRead { source })?;
            if let Some(offset) = Self::from_millis(epoch.saturating_sub(monotonic)) {
                debug!(offset_ms = offset.as_millis(), attempt, "estimated clock offset");
                return Ok(offset);
            }
            warn!(attempt, "zero clock offset sample, resampling");
        }
        Err(CaptureError::ClockOffset {
            attempts: MAX_ESTIMATE_ATTEMPTS,
        })
    }

    /// Use a caller-shared offset, or estimate one when none (or zero) is given.
    pub fn resolve(shared_millis: Option<i64>) -> Result<Self> {
        match shared_millis.and_then(Self::from_millis) {
            Some(offset) => Ok(offset),
            None => Self::estimate(),
        }
    }

    /// Translate a device buffer timestamp to nanoseconds since the epoch.
    #[must_use]
    pub const fn to_epoch_ns(self, timestamp: BufferTimestamp) -> i64 {
        timestamp
            .as_nanos()
            .saturating_add(self.0.get().saturating_mul(NANOS_PER_MILLI))
    }
}
