//! Scripted mount and AO unit for tests.

use super::{
    GuideAxis, GuideDirection, Mount, MountCapabilities, MountError, MountResult, MoveResult,
    StepGuider, StepResult,
};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// One accepted guide pulse.
#[derive(Debug, Clone)]
pub struct PulseRecord {
    pub direction: GuideDirection,
    pub duration: Duration,
    pub issued: Instant,
}

#[derive(Default)]
struct MockMountState {
    connected: bool,
    pulses: Vec<PulseRecord>,
    guiding_until: Option<Instant>,
    slewing: bool,
    stuck: bool,
    failing_polls: u32,
    stop_count: usize,
    declination: Option<f64>,
}

/// Mount that records pulses and can be told to hang, slew, or fail polls.
pub struct MockMount {
    name: String,
    capabilities: MountCapabilities,
    time_scale: f64,
    state: Mutex<MockMountState>,
}

impl Default for MockMount {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMount {
    pub fn new() -> Self {
        Self {
            name: "Mock Mount".to_string(),
            capabilities: MountCapabilities {
                can_pulse_guide: true,
                synchronous_only: false,
            },
            time_scale: 0.0,
            state: Mutex::new(MockMountState::default()),
        }
    }

    /// Scale pulse wall time; the default 0.0 finishes pulses immediately.
    pub fn with_time_scale(mut self, scale: f64) -> Self {
        self.time_scale = scale.max(0.0);
        self
    }

    pub fn with_capabilities(mut self, capabilities: MountCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Declination in radians.
    pub fn with_declination(self, declination: f64) -> Self {
        self.set_declination(Some(declination));
        self
    }

    /// Point the mount somewhere else, as after a slew.
    pub fn set_declination(&self, declination: Option<f64>) {
        self.state.lock().unwrap().declination = declination;
    }

    /// Report `is_guiding() == true` forever.
    pub fn set_stuck(&self, stuck: bool) {
        self.state.lock().unwrap().stuck = stuck;
    }

    pub fn set_slewing(&self, slewing: bool) {
        self.state.lock().unwrap().slewing = slewing;
    }

    /// Fail the next `count` calls to `is_guiding`.
    pub fn fail_polls(&self, count: u32) {
        self.state.lock().unwrap().failing_polls = count;
    }

    pub fn pulses(&self) -> Vec<PulseRecord> {
        self.state.lock().unwrap().pulses.clone()
    }

    pub fn stop_count(&self) -> usize {
        self.state.lock().unwrap().stop_count
    }
}

impl Mount for MockMount {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&self) -> MountResult<()> {
        self.state.lock().unwrap().connected = true;
        Ok(())
    }

    fn disconnect(&self) -> MountResult<()> {
        self.state.lock().unwrap().connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    fn capabilities(&self) -> MountCapabilities {
        self.capabilities
    }

    fn guide(&self, direction: GuideDirection, duration: Duration) -> MoveResult {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return MoveResult::Error;
        }
        if state.slewing {
            return MoveResult::ErrorSlewing;
        }
        let now = Instant::now();
        state.pulses.push(PulseRecord {
            direction,
            duration,
            issued: now,
        });
        state.guiding_until = Some(now + duration.mul_f64(self.time_scale));
        MoveResult::Ok
    }

    fn is_guiding(&self) -> MountResult<bool> {
        let mut state = self.state.lock().unwrap();
        if state.failing_polls > 0 {
            state.failing_polls -= 1;
            return Err(MountError::Communication("poll failed".to_string()));
        }
        if state.stuck {
            return Ok(true);
        }
        Ok(state
            .guiding_until
            .is_some_and(|until| Instant::now() < until))
    }

    fn slewing(&self) -> MountResult<bool> {
        Ok(self.state.lock().unwrap().slewing)
    }

    fn stop_guiding(&self) -> MountResult<()> {
        let mut state = self.state.lock().unwrap();
        state.guiding_until = None;
        state.stop_count += 1;
        Ok(())
    }

    fn declination(&self) -> Option<f64> {
        self.state.lock().unwrap().declination
    }
}

#[derive(Default)]
struct MockStepState {
    connected: bool,
    x: i32,
    y: i32,
    commands: Vec<(GuideDirection, u32)>,
    fail_next: bool,
}

/// AO unit with a symmetric travel limit.
pub struct MockStepGuider {
    name: String,
    max_position: u32,
    capabilities: MountCapabilities,
    state: Mutex<MockStepState>,
}

impl MockStepGuider {
    pub fn new(max_position: u32) -> Self {
        Self {
            name: "Mock AO".to_string(),
            max_position,
            capabilities: MountCapabilities::default(),
            state: Mutex::new(MockStepState::default()),
        }
    }

    pub fn with_capabilities(mut self, capabilities: MountCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn fail_next(&self) {
        self.state.lock().unwrap().fail_next = true;
    }

    pub fn commands(&self) -> Vec<(GuideDirection, u32)> {
        self.state.lock().unwrap().commands.clone()
    }
}

impl StepGuider for MockStepGuider {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&self) -> MountResult<()> {
        self.state.lock().unwrap().connected = true;
        Ok(())
    }

    fn disconnect(&self) -> MountResult<()> {
        self.state.lock().unwrap().connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    fn capabilities(&self) -> MountCapabilities {
        self.capabilities
    }

    fn step(&self, direction: GuideDirection, count: u32) -> StepResult {
        let mut state = self.state.lock().unwrap();
        if !state.connected || std::mem::take(&mut state.fail_next) {
            return StepResult::Error;
        }
        state.commands.push((direction, count));
        let limit = self.max_position as i32;
        let pos = match direction.axis() {
            GuideAxis::Axis1 => &mut state.x,
            GuideAxis::Axis2 => &mut state.y,
        };
        let target = *pos + direction.sign() * count as i32;
        *pos = target.clamp(-limit, limit);
        if *pos != target {
            StepResult::LimitReached
        } else {
            StepResult::Ok
        }
    }

    fn max_position(&self, _axis: GuideAxis) -> u32 {
        self.max_position
    }

    fn position(&self, axis: GuideAxis) -> i32 {
        let state = self.state.lock().unwrap();
        match axis {
            GuideAxis::Axis1 => state.x,
            GuideAxis::Axis2 => state.y,
        }
    }

    fn center(&self) -> StepResult {
        let mut state = self.state.lock().unwrap();
        state.x = 0;
        state.y = 0;
        StepResult::Ok
    }
}
