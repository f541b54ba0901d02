use crate::error::{GuideError, GuideResult};
use serde::{Deserialize, Serialize};

/// Mount calibration parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Duration of each calibration pulse (ms)
    pub calibration_step_ms: u32,
    /// Star travel along each axis that ends a leg (pixels)
    pub calibration_distance: f64,
    /// Smallest travel accepted when the step budget runs out (pixels)
    pub min_distance: f64,
    /// Step budget per leg
    pub max_steps: u32,
    /// Extra pulses on the axis 1 return leg to clear backlash
    pub return_overshoot_steps: u32,
    /// Pulses allowed to clear axis 2 backlash before moving on anyway
    pub max_backlash_steps: u32,
    /// Fraction of the expected per-step travel a backlash pulse must reach
    pub backlash_threshold: f64,
    /// Consecutive full-size pulses that prove backlash is cleared
    pub backlash_consecutive: u32,
    /// Distance from the axis 2 start that triggers a corrective nudge (pixels)
    pub nudge_tolerance: f64,
    /// Corrective nudges after the axis 2 return leg
    pub max_nudges: u32,
    /// Skip axis 2 and derive it from axis 1
    pub assume_orthogonal: bool,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            calibration_step_ms: 750,
            calibration_distance: 25.0,
            min_distance: 8.0,
            max_steps: 60,
            return_overshoot_steps: 1,
            max_backlash_steps: 8,
            backlash_threshold: 0.6,
            backlash_consecutive: 3,
            nudge_tolerance: 3.0,
            max_nudges: 3,
            assume_orthogonal: false,
        }
    }
}

impl CalibrationConfig {
    pub fn validate(&self) -> GuideResult<()> {
        if self.calibration_step_ms == 0 {
            return Err(GuideError::InvalidConfig(
                "calibration step must be at least 1 ms".to_string(),
            ));
        }
        if !(self.calibration_distance > 0.0) {
            return Err(GuideError::InvalidConfig(format!(
                "calibration distance must be positive, got {}",
                self.calibration_distance
            )));
        }
        if !(0.0..=self.calibration_distance).contains(&self.min_distance) {
            return Err(GuideError::InvalidConfig(format!(
                "minimum distance {} must be within 0..={}",
                self.min_distance, self.calibration_distance
            )));
        }
        if self.max_steps == 0 {
            return Err(GuideError::InvalidConfig(
                "max_steps must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.backlash_threshold) {
            return Err(GuideError::InvalidConfig(format!(
                "backlash threshold must be within 0..=1, got {}",
                self.backlash_threshold
            )));
        }
        if self.backlash_consecutive == 0 {
            return Err(GuideError::InvalidConfig(
                "backlash_consecutive must be at least 1".to_string(),
            ));
        }
        if !(self.nudge_tolerance >= 0.0) {
            return Err(GuideError::InvalidConfig(format!(
                "nudge tolerance must be >= 0, got {}",
                self.nudge_tolerance
            )));
        }
        Ok(())
    }
}

/// AO (step guider) calibration parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepGuiderCalibrationConfig {
    /// Steps commanded per calibration move
    pub steps_per_iteration: u32,
    /// Frames averaged at centre before the sweeps
    pub start_samples: u32,
    /// Fraction of the travel range covered by each plus leg
    pub travel_fraction: f64,
    /// Failed steps tolerated before calibration is abandoned
    pub max_step_errors: u32,
}

impl Default for StepGuiderCalibrationConfig {
    fn default() -> Self {
        Self {
            steps_per_iteration: 3,
            start_samples: 3,
            travel_fraction: 0.8,
            max_step_errors: 12,
        }
    }
}

impl StepGuiderCalibrationConfig {
    pub fn validate(&self) -> GuideResult<()> {
        if self.steps_per_iteration == 0 || self.start_samples == 0 {
            return Err(GuideError::InvalidConfig(
                "steps_per_iteration and start_samples must be at least 1".to_string(),
            ));
        }
        if !(self.travel_fraction > 0.0 && self.travel_fraction <= 1.0) {
            return Err(GuideError::InvalidConfig(format!(
                "travel fraction must be within (0, 1], got {}",
                self.travel_fraction
            )));
        }
        Ok(())
    }
}
