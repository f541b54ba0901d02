//! Common utilities for guider integration tests
//!
//! Frames here are only good enough to exercise the control loop. Drift,
//! seeing and realistic noise models live in the guider_harness crate.

#![allow(dead_code)]

use ndarray::Array2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use shared::camera_interface::{
    Camera, CameraCapabilities, CameraResult, Frame, FrameMetadata, Timestamp,
};
use shared::image_proc::AABB;
use shared::mount_interface::{
    GuideAxis, GuideDirection, Mount, MountCapabilities, MountResult, MoveResult, StepGuider,
    StepResult,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const BACKGROUND: f64 = 1000.0;

/// Gaussian star on a flat, slightly noisy background.
pub fn star_frame(
    height: usize,
    width: usize,
    star: Option<(f64, f64)>,
    peak: f64,
    seed: u64,
) -> Array2<u16> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let noise = Normal::new(0.0, 1.5).unwrap();
    let sigma: f64 = 1.5;
    let two_sigma2 = 2.0 * sigma * sigma;
    let radius = (4.0 * sigma).ceil() as i64;

    let mut image = Array2::<f64>::from_elem((height, width), BACKGROUND);
    if let Some((x, y)) = star {
        let (cx, cy) = (x.round() as i64, y.round() as i64);
        for row in (cy - radius).max(0)..=(cy + radius).min(height as i64 - 1) {
            for col in (cx - radius).max(0)..=(cx + radius).min(width as i64 - 1) {
                let d2 = (col as f64 - x).powi(2) + (row as f64 - y).powi(2);
                image[[row as usize, col as usize]] += peak * (-d2 / two_sigma2).exp();
            }
        }
    }
    image.mapv(|v| (v + noise.sample(&mut rng)).clamp(0.0, 65535.0) as u16)
}

/// Star position shared between [`SkyCamera`] and [`SkyMount`].
#[derive(Clone)]
pub struct Sky {
    position: Arc<Mutex<(f64, f64)>>,
    /// Camera pixels moved per millisecond of guide pulse
    pub rate: f64,
}

impl Sky {
    pub fn new(x: f64, y: f64, rate: f64) -> Self {
        Self {
            position: Arc::new(Mutex::new((x, y))),
            rate,
        }
    }

    pub fn position(&self) -> (f64, f64) {
        *self.position.lock().unwrap()
    }

    pub fn shift(&self, dx: f64, dy: f64) {
        let mut position = self.position.lock().unwrap();
        position.0 += dx;
        position.1 += dy;
    }
}

/// Camera that renders the sky star wherever the mount has pushed it.
pub struct SkyCamera {
    sky: Sky,
    height: usize,
    width: usize,
    state: Mutex<SkyCameraState>,
}

struct SkyCameraState {
    connected: bool,
    pending: Option<Option<AABB>>,
    frame_number: u64,
}

impl SkyCamera {
    pub fn new(sky: Sky, height: usize, width: usize) -> Self {
        Self {
            sky,
            height,
            width,
            state: Mutex::new(SkyCameraState {
                connected: false,
                pending: None,
                frame_number: 0,
            }),
        }
    }
}

impl Camera for SkyCamera {
    fn name(&self) -> &str {
        "Sky Camera"
    }

    fn connect(&self) -> CameraResult<()> {
        self.state.lock().unwrap().connected = true;
        Ok(())
    }

    fn disconnect(&self) -> CameraResult<()> {
        self.state.lock().unwrap().connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    fn capabilities(&self) -> CameraCapabilities {
        CameraCapabilities {
            has_guide_output: false,
            has_cooler: false,
            has_subframes: true,
        }
    }

    fn frame_size(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    fn start_exposure(&self, _duration: Duration, subframe: Option<AABB>) -> CameraResult<()> {
        self.state.lock().unwrap().pending = Some(subframe);
        Ok(())
    }

    fn poll_exposure(&self) -> CameraResult<Option<Frame>> {
        let mut state = self.state.lock().unwrap();
        let Some(subframe) = state.pending.take() else {
            return Ok(None);
        };
        state.frame_number += 1;
        let image = star_frame(
            self.height,
            self.width,
            Some(self.sky.position()),
            20_000.0,
            state.frame_number,
        );
        Ok(Some(Frame {
            image,
            metadata: FrameMetadata {
                frame_number: state.frame_number,
                exposure: Duration::ZERO,
                timestamp: Timestamp::new(state.frame_number, 0),
                subframe,
            },
        }))
    }

    fn abort_exposure(&self) -> CameraResult<()> {
        self.state.lock().unwrap().pending = None;
        Ok(())
    }
}

/// Mount whose pulses shift the sky star. West moves the star along +x and
/// North along +y.
pub struct SkyMount {
    sky: Sky,
    connected: Mutex<bool>,
    pulses: Mutex<Vec<(GuideDirection, u64)>>,
}

impl SkyMount {
    pub fn new(sky: Sky) -> Self {
        Self {
            sky,
            connected: Mutex::new(false),
            pulses: Mutex::new(Vec::new()),
        }
    }

    pub fn pulses(&self) -> Vec<(GuideDirection, u64)> {
        self.pulses.lock().unwrap().clone()
    }
}

impl Mount for SkyMount {
    fn name(&self) -> &str {
        "Sky Mount"
    }

    fn connect(&self) -> MountResult<()> {
        *self.connected.lock().unwrap() = true;
        Ok(())
    }

    fn disconnect(&self) -> MountResult<()> {
        *self.connected.lock().unwrap() = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap()
    }

    fn capabilities(&self) -> MountCapabilities {
        MountCapabilities {
            can_pulse_guide: true,
            synchronous_only: false,
        }
    }

    fn guide(&self, direction: GuideDirection, duration: Duration) -> MoveResult {
        let ms = duration.as_millis() as u64;
        self.pulses.lock().unwrap().push((direction, ms));
        let distance = direction.sign() as f64 * ms as f64 * self.sky.rate;
        match direction.axis() {
            GuideAxis::Axis1 => self.sky.shift(distance, 0.0),
            GuideAxis::Axis2 => self.sky.shift(0.0, distance),
        }
        MoveResult::Ok
    }

    fn is_guiding(&self) -> MountResult<bool> {
        Ok(false)
    }

    fn slewing(&self) -> MountResult<bool> {
        Ok(false)
    }

    fn stop_guiding(&self) -> MountResult<()> {
        Ok(())
    }
}

/// AO unit whose steps shift the sky star by `px_per_step`, West along +x
/// and North along +y.
pub struct SkyStepGuider {
    sky: Sky,
    px_per_step: f64,
    max_position: u32,
    connected: Mutex<bool>,
    position: Mutex<(i32, i32)>,
}

impl SkyStepGuider {
    pub fn new(sky: Sky, px_per_step: f64, max_position: u32) -> Self {
        Self {
            sky,
            px_per_step,
            max_position,
            connected: Mutex::new(false),
            position: Mutex::new((0, 0)),
        }
    }
}

impl StepGuider for SkyStepGuider {
    fn name(&self) -> &str {
        "Sky AO"
    }

    fn connect(&self) -> MountResult<()> {
        *self.connected.lock().unwrap() = true;
        Ok(())
    }

    fn disconnect(&self) -> MountResult<()> {
        *self.connected.lock().unwrap() = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock().unwrap()
    }

    fn capabilities(&self) -> MountCapabilities {
        MountCapabilities::default()
    }

    fn step(&self, direction: GuideDirection, count: u32) -> StepResult {
        let mut position = self.position.lock().unwrap();
        let limit = self.max_position as i32;
        let pos = match direction.axis() {
            GuideAxis::Axis1 => &mut position.0,
            GuideAxis::Axis2 => &mut position.1,
        };
        let target = *pos + direction.sign() * count as i32;
        let reached = target.clamp(-limit, limit);
        let distance = (reached - *pos) as f64 * self.px_per_step;
        *pos = reached;
        match direction.axis() {
            GuideAxis::Axis1 => self.sky.shift(distance, 0.0),
            GuideAxis::Axis2 => self.sky.shift(0.0, distance),
        }
        if reached != target {
            StepResult::LimitReached
        } else {
            StepResult::Ok
        }
    }

    fn max_position(&self, _axis: GuideAxis) -> u32 {
        self.max_position
    }

    fn position(&self, axis: GuideAxis) -> i32 {
        let position = self.position.lock().unwrap();
        match axis {
            GuideAxis::Axis1 => position.0,
            GuideAxis::Axis2 => position.1,
        }
    }

    fn center(&self) -> StepResult {
        let mut position = self.position.lock().unwrap();
        self.sky.shift(
            -position.0 as f64 * self.px_per_step,
            -position.1 as f64 * self.px_per_step,
        );
        *position = (0, 0);
        StepResult::Ok
    }
}
