//! Calibration: measures the camera-space direction and rate of each axis of
//! the mount and, when present, the AO unit.
//!
//! Sequencing is a pure transition function over a tagged state
//! ([`mount::transition`], [`stepguider::transition`]). [`CalibrationEngine`]
//! holds the current state for one device and feeds it star samples; the
//! caller executes the returned [`CalibrationAction`] and reports back.

pub mod assistant;
pub mod config;
pub mod data;
pub mod fit;
pub mod mount;
pub mod stepguider;

pub use assistant::{
    AssistantThresholds, CalibrationAssistant, CalibrationIssue, IssueKind, Severity,
};
pub use config::{CalibrationConfig, StepGuiderCalibrationConfig};
pub use data::{CalibrationData, MoveUnits};

use crate::error::GuideError;
use crate::worker::MoveTarget;
use nalgebra::Vector2;
use shared::mount_interface::GuideDirection;
use std::fmt;
use std::mem;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationState {
    Cleared,
    AverageStart,
    GotoPlusAxis1,
    GotoMinusAxis1,
    ClearBacklash,
    GotoPlusAxis2,
    GotoMinusAxis2,
    NudgeAxis2,
    Recenter,
    Complete,
}

impl fmt::Display for CalibrationState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Star position observed after the previous move.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationSample {
    pub x: f64,
    pub y: f64,
    /// Amount the device actually moved, when it differs from the request
    pub moved: Option<u32>,
}

impl CalibrationSample {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y, moved: None }
    }

    pub fn with_moved(mut self, moved: u32) -> Self {
        self.moved = Some(moved);
        self
    }

    pub fn position(&self) -> Vector2<f64> {
        Vector2::new(self.x, self.y)
    }
}

/// What the caller must do next.
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationAction {
    /// Issue a calibration move, then report the new star position.
    Move {
        direction: GuideDirection,
        amount: u32,
    },
    /// Take another frame without moving.
    Sample,
    Done(CalibrationData),
    Failed(GuideError),
}

#[derive(Debug, Clone)]
enum Procedure {
    Mount {
        config: CalibrationConfig,
        declination: Option<f64>,
        state: mount::MountCalibration,
    },
    StepGuider {
        config: StepGuiderCalibrationConfig,
        max_position: (u32, u32),
        state: stepguider::StepGuiderCalibration,
    },
}

/// Calibration driver for a single device.
#[derive(Debug, Clone)]
pub struct CalibrationEngine {
    procedure: Procedure,
}

impl CalibrationEngine {
    pub fn for_mount(config: CalibrationConfig, declination: Option<f64>) -> Self {
        Self {
            procedure: Procedure::Mount {
                config,
                declination,
                state: mount::MountCalibration::Cleared,
            },
        }
    }

    pub fn for_step_guider(
        config: StepGuiderCalibrationConfig,
        max_position: (u32, u32),
    ) -> Self {
        Self {
            procedure: Procedure::StepGuider {
                config,
                max_position,
                state: stepguider::StepGuiderCalibration::default(),
            },
        }
    }

    pub fn target(&self) -> MoveTarget {
        match self.procedure {
            Procedure::Mount { .. } => MoveTarget::Mount,
            Procedure::StepGuider { .. } => MoveTarget::StepGuider,
        }
    }

    pub fn state(&self) -> CalibrationState {
        match &self.procedure {
            Procedure::Mount { state, .. } => state.state(),
            Procedure::StepGuider { state, .. } => state.state(),
        }
    }

    pub fn is_running(&self) -> bool {
        !matches!(
            self.state(),
            CalibrationState::Cleared | CalibrationState::Complete
        )
    }

    /// Feed the star position observed after the last action.
    pub fn advance(&mut self, sample: CalibrationSample) -> CalibrationAction {
        match &mut self.procedure {
            Procedure::Mount {
                config,
                declination,
                state,
            } => {
                let (next, action) = mount::transition(mem::take(state), &sample, config);
                *state = next;
                match action {
                    CalibrationAction::Done(mut data) => {
                        data.declination = *declination;
                        CalibrationAction::Done(data)
                    }
                    other => other,
                }
            }
            Procedure::StepGuider {
                config,
                max_position,
                state,
            } => {
                let (next, action) =
                    stepguider::transition(mem::take(state), &sample, config, *max_position);
                *state = next;
                action
            }
        }
    }

    /// Report that the last requested move failed.
    ///
    /// A mount calibration fails outright; an AO calibration retries until
    /// its error budget is spent.
    pub fn move_failed(&mut self, error: GuideError) -> CalibrationAction {
        match &mut self.procedure {
            Procedure::Mount { state, .. } => {
                *state = mount::MountCalibration::Cleared;
                CalibrationAction::Failed(error)
            }
            Procedure::StepGuider { config, state, .. } => {
                log::warn!("AO calibration move failed: {error}");
                let (next, action) = stepguider::step_failed(mem::take(state), config);
                *state = next;
                action
            }
        }
    }

    /// Return to `Cleared`. Previously produced calibration data is not
    /// affected.
    pub fn abort(&mut self) {
        if self.is_running() {
            log::info!("Calibration aborted in {}", self.state());
        }
        match &mut self.procedure {
            Procedure::Mount { state, .. } => *state = mount::MountCalibration::Cleared,
            Procedure::StepGuider { state, .. } => {
                *state = stepguider::StepGuiderCalibration::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GuideError;
    use approx::assert_relative_eq;
    use shared::mount_interface::GuideAxis;

    /// Star displacement per ms of West pulse and per ms of North pulse.
    struct SkyModel {
        west: Vector2<f64>,
        north: Vector2<f64>,
        star: Vector2<f64>,
    }

    impl SkyModel {
        fn apply(&mut self, direction: GuideDirection, amount: u32) {
            let amount = amount as f64;
            self.star += match direction {
                GuideDirection::West => self.west * amount,
                GuideDirection::East => -self.west * amount,
                GuideDirection::North => self.north * amount,
                GuideDirection::South => -self.north * amount,
            };
        }

        fn sample(&self) -> CalibrationSample {
            CalibrationSample::new(self.star.x, self.star.y)
        }
    }

    fn run(engine: &mut CalibrationEngine, sky: &mut SkyModel) -> (CalibrationAction, usize) {
        let mut moves = 0;
        let mut action = engine.advance(sky.sample());
        while let CalibrationAction::Move { direction, amount } = action {
            moves += 1;
            assert!(moves < 1000, "calibration did not terminate");
            sky.apply(direction, amount);
            action = engine.advance(sky.sample());
        }
        (action, moves)
    }

    fn fast_config() -> CalibrationConfig {
        CalibrationConfig {
            calibration_step_ms: 10,
            calibration_distance: 200.0,
            ..CalibrationConfig::default()
        }
    }

    #[test]
    fn test_mount_calibration_east_drift() {
        let mut sky = SkyModel {
            west: Vector2::new(1.0, 0.0),
            north: Vector2::new(0.0, 1.0),
            star: Vector2::new(100.0, 100.0),
        };
        let mut engine = CalibrationEngine::for_mount(fast_config(), Some(0.2));
        let (action, _) = run(&mut engine, &mut sky);
        let CalibrationAction::Done(data) = action else {
            panic!("expected completed calibration, got {action:?}");
        };
        assert!(data.valid);
        assert_eq!(data.ra_steps, 20);
        assert_relative_eq!(data.ra_angle, 0.0, epsilon = 0.01);
        assert_relative_eq!(data.ra_rate, 1.0, max_relative = 0.05);
        assert_relative_eq!(data.dec_angle, std::f64::consts::FRAC_PI_2, epsilon = 0.01);
        assert_eq!(data.declination, Some(0.2));
        assert_eq!(engine.state(), CalibrationState::Complete);
    }

    #[test]
    fn test_mount_calibration_too_short() {
        let mut sky = SkyModel {
            west: Vector2::new(0.01, 0.0),
            north: Vector2::new(0.0, 1.0),
            star: Vector2::new(100.0, 100.0),
        };
        let mut engine = CalibrationEngine::for_mount(fast_config(), None);
        let (action, moves) = run(&mut engine, &mut sky);
        assert_eq!(moves, 60);
        match action {
            CalibrationAction::Failed(GuideError::CalibrationTooShort { axis, distance, .. }) => {
                assert_eq!(axis, GuideAxis::Axis1);
                assert!(distance < 8.0);
            }
            other => panic!("expected CalibrationTooShort, got {other:?}"),
        }
        assert_eq!(engine.state(), CalibrationState::Cleared);
    }

    #[test]
    fn test_abort_returns_to_cleared() {
        let mut engine = CalibrationEngine::for_mount(fast_config(), None);
        engine.advance(CalibrationSample::new(10.0, 10.0));
        assert_eq!(engine.state(), CalibrationState::GotoPlusAxis1);
        engine.abort();
        assert_eq!(engine.state(), CalibrationState::Cleared);
    }

    #[test]
    fn test_step_guider_calibration() {
        let mut sky = SkyModel {
            west: Vector2::new(0.0, 0.5),
            north: Vector2::new(-0.5, 0.0),
            star: Vector2::new(50.0, 50.0),
        };
        let mut engine =
            CalibrationEngine::for_step_guider(StepGuiderCalibrationConfig::default(), (45, 45));
        let mut action = engine.advance(sky.sample());
        let mut frames = 0;
        let mut net = (0i64, 0i64);
        let data = loop {
            frames += 1;
            assert!(frames < 500);
            match action {
                CalibrationAction::Sample => {}
                CalibrationAction::Move { direction, amount } => {
                    sky.apply(direction, amount);
                    match direction.axis() {
                        GuideAxis::Axis1 => net.0 += direction.sign() as i64 * amount as i64,
                        GuideAxis::Axis2 => net.1 += direction.sign() as i64 * amount as i64,
                    }
                }
                CalibrationAction::Done(data) => break data,
                CalibrationAction::Failed(e) => panic!("AO calibration failed: {e}"),
            }
            action = engine.advance(sky.sample());
        };
        assert_eq!(data.units, MoveUnits::Steps);
        assert_eq!(data.ra_steps, 36);
        assert_relative_eq!(data.ra_rate, 0.5, epsilon = 1e-9);
        assert_relative_eq!(data.ra_angle, std::f64::consts::FRAC_PI_2, epsilon = 1e-9);
        assert_relative_eq!(data.dec_angle.abs(), std::f64::consts::PI, epsilon = 1e-9);
        assert_eq!(net, (0, 0));
    }

    #[test]
    fn test_mount_move_failure_fails_calibration() {
        let mut engine = CalibrationEngine::for_mount(fast_config(), None);
        engine.advance(CalibrationSample::new(10.0, 10.0));
        let action = engine.move_failed(GuideError::HardwareError("cable".to_string()));
        assert!(matches!(
            action,
            CalibrationAction::Failed(GuideError::HardwareError(_))
        ));
        assert_eq!(engine.state(), CalibrationState::Cleared);
    }
}
