//! Scripted camera for tests.
//!
//! Replays a list of frames (or repeats a single one), records when every
//! exposure starts and finishes, and can be told to hang so timeout paths
//! can be exercised.

use super::{
    validate_subframe, Camera, CameraCapabilities, CameraError, CameraResult, Frame,
    FrameMetadata, Timestamp,
};
use crate::image_proc::AABB;
use ndarray::Array2;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Start and end of one exposure as seen by the mock.
#[derive(Debug, Clone)]
pub struct ExposureRecord {
    pub frame_number: u64,
    pub duration: Duration,
    pub started: Instant,
    pub finished: Option<Instant>,
    pub aborted: bool,
    /// Readout region the exposure used, `None` for a full frame
    pub subframe: Option<AABB>,
}

struct Pending {
    record_index: usize,
    ready_at: Instant,
    subframe: Option<AABB>,
}

struct MockState {
    connected: bool,
    frames: Vec<Array2<u16>>,
    frame_index: usize,
    frame_count: u64,
    pending: Option<Pending>,
    log: Vec<ExposureRecord>,
    hang: bool,
    fail_next: Option<CameraError>,
}

pub struct MockCamera {
    name: String,
    height: usize,
    width: usize,
    capabilities: CameraCapabilities,
    time_scale: f64,
    epoch: Instant,
    state: Mutex<MockState>,
}

impl MockCamera {
    /// Camera that returns `frames` in order, then errors once they run out.
    pub fn new(frames: Vec<Array2<u16>>) -> Self {
        let (height, width) = frames.first().map(|f| f.dim()).unwrap_or((0, 0));
        Self {
            name: "Mock Camera".to_string(),
            height,
            width,
            capabilities: CameraCapabilities {
                has_guide_output: false,
                has_cooler: false,
                has_subframes: true,
            },
            time_scale: 1.0,
            epoch: Instant::now(),
            state: Mutex::new(MockState {
                connected: false,
                frames,
                frame_index: 0,
                frame_count: 0,
                pending: None,
                log: Vec::new(),
                hang: false,
                fail_next: None,
            }),
        }
    }

    /// Camera that returns the same frame forever.
    pub fn new_repeating(frame: Array2<u16>) -> Self {
        Self::new(vec![frame])
    }

    /// Scale exposure wall time; 0.0 makes exposures complete on the first poll.
    pub fn with_time_scale(mut self, scale: f64) -> Self {
        self.time_scale = scale.max(0.0);
        self
    }

    pub fn with_capabilities(mut self, capabilities: CameraCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Make every subsequent exposure hang until aborted.
    pub fn set_hang(&self, hang: bool) {
        self.state.lock().unwrap().hang = hang;
    }

    /// Fail the next exposure with the given error.
    pub fn fail_next(&self, error: CameraError) {
        self.state.lock().unwrap().fail_next = Some(error);
    }

    /// Append frames to the replay list.
    pub fn push_frame(&self, frame: Array2<u16>) {
        self.state.lock().unwrap().frames.push(frame);
    }

    /// Every exposure started so far.
    pub fn exposure_log(&self) -> Vec<ExposureRecord> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn abort_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|r| r.aborted)
            .count()
    }

    fn next_frame(state: &mut MockState) -> CameraResult<Array2<u16>> {
        if state.frames.len() == 1 {
            return Ok(state.frames[0].clone());
        }
        if state.frame_index >= state.frames.len() {
            return Err(CameraError::CaptureError("No more frames".to_string()));
        }
        let frame = state.frames[state.frame_index].clone();
        state.frame_index += 1;
        Ok(frame)
    }
}

/// Zero every pixel outside `roi`, as a sensor reading only that window would.
fn blank_outside(image: &mut Array2<u16>, roi: &AABB) {
    for ((row, col), value) in image.indexed_iter_mut() {
        let inside = (roi.min_row..=roi.max_row).contains(&row)
            && (roi.min_col..=roi.max_col).contains(&col);
        if !inside {
            *value = 0;
        }
    }
}

impl Camera for MockCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&self) -> CameraResult<()> {
        self.state.lock().unwrap().connected = true;
        Ok(())
    }

    fn disconnect(&self) -> CameraResult<()> {
        let mut state = self.state.lock().unwrap();
        state.connected = false;
        state.pending = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    fn capabilities(&self) -> CameraCapabilities {
        self.capabilities
    }

    fn frame_size(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    fn start_exposure(&self, duration: Duration, subframe: Option<AABB>) -> CameraResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(CameraError::NotConnected);
        }
        if state.pending.is_some() {
            return Err(CameraError::Busy);
        }
        if let Some(error) = state.fail_next.take() {
            return Err(error);
        }
        if let Some(roi) = &subframe {
            validate_subframe(roi, self.height, self.width)?;
        }
        let subframe = subframe.filter(|_| self.capabilities.has_subframes);
        state.frame_count += 1;
        let frame_number = state.frame_count;
        let now = Instant::now();
        state.log.push(ExposureRecord {
            frame_number,
            duration,
            started: now,
            finished: None,
            aborted: false,
            subframe,
        });
        state.pending = Some(Pending {
            record_index: state.log.len() - 1,
            ready_at: now + duration.mul_f64(self.time_scale),
            subframe,
        });
        Ok(())
    }

    fn poll_exposure(&self) -> CameraResult<Option<Frame>> {
        let mut state = self.state.lock().unwrap();
        let (ready_at, record_index, subframe) = match &state.pending {
            Some(p) => (p.ready_at, p.record_index, p.subframe),
            None => return Err(CameraError::CaptureError("no exposure running".to_string())),
        };
        if state.hang || Instant::now() < ready_at {
            return Ok(None);
        }
        state.pending = None;
        let mut image = Self::next_frame(&mut state)?;
        if let Some(roi) = &subframe {
            blank_outside(&mut image, roi);
        }
        let record = &mut state.log[record_index];
        record.finished = Some(Instant::now());
        let metadata = FrameMetadata {
            frame_number: record.frame_number,
            exposure: record.duration,
            timestamp: Timestamp::from_duration(self.epoch.elapsed()),
            subframe,
        };
        Ok(Some(Frame { image, metadata }))
    }

    fn abort_exposure(&self) -> CameraResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(pending) = state.pending.take() {
            let record = &mut state.log[pending.record_index];
            record.aborted = true;
            record.finished = Some(Instant::now());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(value: u16) -> Array2<u16> {
        Array2::from_elem((8, 8), value)
    }

    #[test]
    fn test_requires_connection() {
        let camera = MockCamera::new_repeating(frame(1));
        assert_eq!(
            camera.start_exposure(Duration::ZERO, None),
            Err(CameraError::NotConnected)
        );
    }

    #[test]
    fn test_replays_frames_in_order() {
        let camera = MockCamera::new(vec![frame(1), frame(2)]).with_time_scale(0.0);
        camera.connect().unwrap();

        let a = camera.capture(Duration::from_millis(100), None).unwrap();
        let b = camera.capture(Duration::from_millis(100), None).unwrap();
        assert_eq!(a.image[[0, 0]], 1);
        assert_eq!(b.image[[0, 0]], 2);
        assert_eq!(b.metadata.frame_number, 2);
        assert!(camera.capture(Duration::ZERO, None).is_err());
    }

    #[test]
    fn test_subframe_only_carries_window() {
        let camera = MockCamera::new_repeating(frame(7)).with_time_scale(0.0);
        camera.connect().unwrap();
        let roi = AABB::from_coords(2, 3, 4, 5);
        let image = camera.capture(Duration::ZERO, Some(roi)).unwrap().image;
        assert_eq!(image[[2, 3]], 7);
        assert_eq!(image[[4, 5]], 7);
        assert_eq!(image[[0, 0]], 0);
        assert_eq!(image[[2, 6]], 0);
        assert_eq!(camera.exposure_log()[0].subframe, Some(roi));
    }

    #[test]
    fn test_abort_clears_pending_exposure() {
        let camera = MockCamera::new_repeating(frame(3)).with_time_scale(0.0);
        camera.connect().unwrap();
        camera.set_hang(true);
        camera
            .start_exposure(Duration::from_millis(10), None)
            .unwrap();
        assert!(camera.poll_exposure().unwrap().is_none());
        camera.abort_exposure().unwrap();
        assert_eq!(camera.abort_count(), 1);
        assert!(camera.poll_exposure().is_err());
    }

    #[test]
    fn test_rejects_second_exposure_while_busy() {
        let camera = MockCamera::new_repeating(frame(0));
        camera.connect().unwrap();
        camera.start_exposure(Duration::from_secs(10), None).unwrap();
        assert_eq!(
            camera.start_exposure(Duration::from_secs(10), None),
            Err(CameraError::Busy)
        );
    }
}
