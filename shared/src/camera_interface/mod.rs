//! Camera abstraction for the guiding core.
//!
//! The guider never talks to a vendor SDK directly. Each camera driver
//! implements [`Camera`] and advertises what it can do through
//! [`CameraCapabilities`]; the core only branches on those flags.
//!
//! Exposures are split into a start/poll pair so that the worker lane can
//! bound every wait with a watchdog and abort the exposure from its poll loop.

pub mod mock;

use crate::image_proc::AABB;
use ndarray::Array2;
use std::error::Error;
use std::fmt;
use std::time::{Duration, Instant};

/// Timestamp represented as seconds and nanoseconds since an epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    /// Seconds component
    pub seconds: u64,
    /// Nanoseconds component (0-999,999,999)
    pub nanos: u64,
}

impl Timestamp {
    /// Create a new timestamp
    pub fn new(seconds: u64, nanos: u64) -> Self {
        Self { seconds, nanos }
    }

    /// Create a timestamp from a Duration since epoch
    pub fn from_duration(duration: Duration) -> Self {
        let total_nanos = duration.as_nanos();
        let seconds = (total_nanos / 1_000_000_000) as u64;
        let nanos = (total_nanos % 1_000_000_000) as u64;
        Self { seconds, nanos }
    }

    /// Convert to Duration
    pub fn to_duration(&self) -> Duration {
        Duration::new(self.seconds, self.nanos as u32)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{:09}", self.seconds, self.nanos)
    }
}

/// Error type for camera operations
#[derive(Debug, Clone, PartialEq)]
pub enum CameraError {
    /// Camera is not connected
    NotConnected,
    /// Hardware communication error
    HardwareError(String),
    /// Invalid subframe request
    InvalidSubframe(String),
    /// Frame capture error
    CaptureError(String),
    /// An exposure is already running
    Busy,
    /// Exposure was aborted before the frame was read out
    Aborted,
}

impl fmt::Display for CameraError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CameraError::NotConnected => write!(f, "Camera not connected"),
            CameraError::HardwareError(msg) => write!(f, "Hardware error: {msg}"),
            CameraError::InvalidSubframe(msg) => write!(f, "Invalid subframe: {msg}"),
            CameraError::CaptureError(msg) => write!(f, "Capture error: {msg}"),
            CameraError::Busy => write!(f, "Exposure already in progress"),
            CameraError::Aborted => write!(f, "Exposure aborted"),
        }
    }
}

impl Error for CameraError {}

/// Result type for camera operations
pub type CameraResult<T> = Result<T, CameraError>;

/// Camera metadata returned with each frame
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    /// Frame sequence number
    pub frame_number: u64,
    /// Exposure duration
    pub exposure: Duration,
    /// Timestamp when frame was captured
    pub timestamp: Timestamp,
    /// Subframe the image covers, in full-sensor coordinates. `None` for a full frame.
    pub subframe: Option<AABB>,
}

/// A captured guide frame. The image is always full-sensor sized; when a
/// subframe was requested only that region carries data.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: Array2<u16>,
    pub metadata: FrameMetadata,
}

/// Capability flags a driver advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CameraCapabilities {
    /// Camera has an ST-4 style guide port
    pub has_guide_output: bool,
    /// Camera has a regulated cooler
    pub has_cooler: bool,
    /// Camera can read out a subframe
    pub has_subframes: bool,
}

/// Default upper bound used by [`Camera::capture`] for readout after the exposure ends.
pub const DEFAULT_DOWNLOAD_ALLOWANCE: Duration = Duration::from_secs(15);

const CAPTURE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Trait for a guide camera driver
///
/// Implementations must be thread safe. In particular [`Camera::abort_exposure`]
/// may be called from one thread while another thread is polling an exposure
/// started with [`Camera::start_exposure`].
pub trait Camera: Send + Sync {
    /// Human-readable camera name
    fn name(&self) -> &str;

    /// Connect to the hardware
    fn connect(&self) -> CameraResult<()>;

    /// Disconnect from the hardware
    fn disconnect(&self) -> CameraResult<()>;

    /// Check whether the camera is connected
    fn is_connected(&self) -> bool;

    /// Capabilities advertised by the driver
    fn capabilities(&self) -> CameraCapabilities;

    /// Full sensor size as `(height, width)`
    fn frame_size(&self) -> (usize, usize);

    /// Begin an exposure
    ///
    /// # Arguments
    /// * `duration` - Exposure time
    /// * `subframe` - Optional readout region, ignored when subframes are unsupported
    fn start_exposure(&self, duration: Duration, subframe: Option<AABB>) -> CameraResult<()>;

    /// Poll a running exposure
    ///
    /// # Returns
    /// * `Ok(Some(frame))` once the frame has been read out
    /// * `Ok(None)` while the exposure or readout is still in progress
    /// * `Err(CameraError)` if the exposure failed
    fn poll_exposure(&self) -> CameraResult<Option<Frame>>;

    /// Abort any running exposure. Safe to call when nothing is running.
    fn abort_exposure(&self) -> CameraResult<()>;

    /// Capture a single frame, blocking until it is read out
    ///
    /// Convenience wrapper over `start_exposure` / `poll_exposure` with an
    /// upper bound of the exposure time plus [`DEFAULT_DOWNLOAD_ALLOWANCE`].
    fn capture(&self, duration: Duration, subframe: Option<AABB>) -> CameraResult<Frame> {
        self.start_exposure(duration, subframe)?;
        let deadline = Instant::now() + duration + DEFAULT_DOWNLOAD_ALLOWANCE;
        loop {
            if let Some(frame) = self.poll_exposure()? {
                return Ok(frame);
            }
            if Instant::now() >= deadline {
                let _ = self.abort_exposure();
                return Err(CameraError::CaptureError(
                    "exposure did not complete".to_string(),
                ));
            }
            std::thread::sleep(CAPTURE_POLL_INTERVAL);
        }
    }
}

/// Validate a requested subframe against the sensor size.
pub fn validate_subframe(subframe: &AABB, height: usize, width: usize) -> CameraResult<()> {
    if !subframe.is_valid() {
        return Err(CameraError::InvalidSubframe(format!(
            "inverted bounds {subframe:?}"
        )));
    }
    if subframe.max_row >= height || subframe.max_col >= width {
        return Err(CameraError::InvalidSubframe(format!(
            "{subframe:?} exceeds sensor {width}x{height}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_round_trip_duration() {
        let d = Duration::new(12, 345_000_000);
        let ts = Timestamp::from_duration(d);
        assert_eq!(ts.seconds, 12);
        assert_eq!(ts.nanos, 345_000_000);
        assert_eq!(ts.to_duration(), d);
        assert_eq!(ts.to_string(), "12.345000000");
    }

    #[test]
    fn test_validate_subframe() {
        let full = AABB::from_coords(0, 0, 9, 9);
        assert!(validate_subframe(&full, 10, 10).is_ok());
        assert!(matches!(
            validate_subframe(&AABB::from_coords(0, 0, 10, 9), 10, 10),
            Err(CameraError::InvalidSubframe(_))
        ));
        let inverted = AABB::from_coords(5, 5, 4, 9);
        assert!(validate_subframe(&inverted, 10, 10).is_err());
    }
}
