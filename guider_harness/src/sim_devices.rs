//! Camera, mount and AO drivers backed by a [`SimulatedSky`]
//!
//! Every exposure advances simulated time by one frame interval, so a run
//! of N frames covers N intervals of drift no matter how fast the host is.

use crate::sky::SimulatedSky;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use shared::camera_interface::{
    validate_subframe, Camera, CameraCapabilities, CameraError, CameraResult, Frame,
    FrameMetadata, Timestamp,
};
use shared::image_proc::AABB;
use shared::mount_interface::{
    GuideAxis, GuideDirection, Mount, MountCapabilities, MountError, MountResult, MoveResult,
    StepGuider, StepResult,
};
use std::sync::Mutex;
use std::time::Duration;

struct CameraState {
    connected: bool,
    pending: Option<(Duration, Option<AABB>)>,
    frame_number: u64,
    rng: ChaCha8Rng,
}

/// Camera that renders the simulated sky.
pub struct SimulatorCamera {
    sky: SimulatedSky,
    state: Mutex<CameraState>,
}

impl SimulatorCamera {
    pub fn new(sky: SimulatedSky) -> Self {
        let seed = sky.config().seed;
        Self {
            sky,
            state: Mutex::new(CameraState {
                connected: false,
                pending: None,
                frame_number: 0,
                rng: ChaCha8Rng::seed_from_u64(seed),
            }),
        }
    }

    pub fn frames_taken(&self) -> u64 {
        self.state.lock().unwrap().frame_number
    }
}

impl Camera for SimulatorCamera {
    fn name(&self) -> &str {
        "Simulator Camera"
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
        CameraCapabilities {
            has_guide_output: false,
            has_cooler: false,
            has_subframes: true,
        }
    }

    fn frame_size(&self) -> (usize, usize) {
        (self.sky.config().height, self.sky.config().width)
    }

    fn start_exposure(&self, duration: Duration, subframe: Option<AABB>) -> CameraResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(CameraError::NotConnected);
        }
        if state.pending.is_some() {
            return Err(CameraError::Busy);
        }
        if let Some(roi) = &subframe {
            let (height, width) = self.frame_size();
            validate_subframe(roi, height, width)?;
        }
        state.pending = Some((duration, subframe));
        Ok(())
    }

    fn poll_exposure(&self) -> CameraResult<Option<Frame>> {
        let mut state = self.state.lock().unwrap();
        let Some((exposure, subframe)) = state.pending.take() else {
            return Err(CameraError::CaptureError("no exposure running".to_string()));
        };
        self.sky.advance_frame();
        state.frame_number += 1;
        let image = self.sky.render(subframe.as_ref(), &mut state.rng);
        Ok(Some(Frame {
            image,
            metadata: FrameMetadata {
                frame_number: state.frame_number,
                exposure,
                timestamp: Timestamp::from_duration(self.sky.elapsed()),
                subframe,
            },
        }))
    }

    fn abort_exposure(&self) -> CameraResult<()> {
        self.state.lock().unwrap().pending = None;
        Ok(())
    }
}

/// Mount whose pulses move the simulated star instantly.
pub struct SimulatorMount {
    sky: SimulatedSky,
    connected: Mutex<bool>,
}

impl SimulatorMount {
    pub fn new(sky: SimulatedSky) -> Self {
        Self {
            sky,
            connected: Mutex::new(false),
        }
    }
}

impl Mount for SimulatorMount {
    fn name(&self) -> &str {
        "Simulator Mount"
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
        if !self.is_connected() {
            return MoveResult::Error;
        }
        self.sky.pulse(direction, duration.as_millis() as u32);
        MoveResult::Ok
    }

    fn is_guiding(&self) -> MountResult<bool> {
        if self.is_connected() {
            Ok(false)
        } else {
            Err(MountError::NotConnected)
        }
    }

    fn slewing(&self) -> MountResult<bool> {
        Ok(false)
    }

    fn stop_guiding(&self) -> MountResult<()> {
        Ok(())
    }

    fn declination(&self) -> Option<f64> {
        self.sky.config().declination
    }
}

/// AO unit that shifts the simulated star by a fixed amount per step.
pub struct SimulatorStepGuider {
    sky: SimulatedSky,
    connected: Mutex<bool>,
}

impl SimulatorStepGuider {
    pub fn new(sky: SimulatedSky) -> Self {
        Self {
            sky,
            connected: Mutex::new(false),
        }
    }
}

impl StepGuider for SimulatorStepGuider {
    fn name(&self) -> &str {
        "Simulator AO"
    }

    fn connect(&self) -> MountResult<()> {
        if self.sky.config().ao.is_none() {
            return Err(MountError::Unsupported(
                "sky has no AO unit configured".to_string(),
            ));
        }
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
        if !self.is_connected() {
            return StepResult::Error;
        }
        self.sky.step_ao(direction, count)
    }

    fn max_position(&self, _axis: GuideAxis) -> u32 {
        self.sky
            .config()
            .ao
            .as_ref()
            .map_or(0, |ao| ao.max_position)
    }

    fn position(&self, axis: GuideAxis) -> i32 {
        let (x, y) = self.sky.ao_position();
        match axis {
            GuideAxis::Axis1 => x,
            GuideAxis::Axis2 => y,
        }
    }

    fn center(&self) -> StepResult {
        if !self.is_connected() {
            return StepResult::Error;
        }
        self.sky.center_ao();
        StepResult::Ok
    }
}
