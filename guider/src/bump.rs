//! AO bump controller.
//!
//! When the AO unit drifts towards the end of its travel the mount is moved
//! so that normal AO guiding walks the unit back to centre. The controller
//! only decides how many AO steps' worth of recentring to ask for; the
//! guider converts that into a mount pulse.

use crate::error::{GuideError, GuideResult};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Smoothing factor for the AO position average.
const POSITION_ALPHA: f64 = 0.33;
/// Weight growth per frame between the trigger and upper thresholds.
const SLOW_WEIGHT_STEP: f64 = 1.0 / 6.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BumpConfig {
    /// Percentage of travel that starts a bump
    pub bump_percentage: f64,
    /// Base AO steps recentred per frame
    pub bump_max_steps_per_cycle: f64,
    /// Percentage of travel around centre where a bump ends
    pub bump_center_tolerance: f64,
    /// Recentre after every dither
    pub bump_on_dither: bool,
    /// Warn when a bump has not finished after this long (seconds)
    pub bump_warn_time_s: f64,
}

impl Default for BumpConfig {
    fn default() -> Self {
        Self {
            bump_percentage: 80.0,
            bump_max_steps_per_cycle: 1.0,
            bump_center_tolerance: 10.0,
            bump_on_dither: true,
            bump_warn_time_s: 240.0,
        }
    }
}

impl BumpConfig {
    pub fn validate(&self) -> GuideResult<()> {
        if !(self.bump_center_tolerance >= 0.0
            && self.bump_center_tolerance < self.bump_percentage
            && self.bump_percentage <= 100.0)
        {
            return Err(GuideError::InvalidConfig(format!(
                "bump thresholds must satisfy 0 <= tolerance ({}) < percentage ({}) <= 100",
                self.bump_center_tolerance, self.bump_percentage
            )));
        }
        if !(self.bump_max_steps_per_cycle > 0.0) || !(self.bump_warn_time_s >= 0.0) {
            return Err(GuideError::InvalidConfig(
                "bump step size must be positive and warn time non-negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Upper threshold, halfway between the trigger and full travel.
    pub fn upper_percentage(&self) -> f64 {
        (100.0 + self.bump_percentage) / 2.0
    }
}

/// Recentring requested for this frame, in AO steps per axis. The sign is
/// the direction the AO unit should travel, positive West / North.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BumpRequest {
    pub axis1_steps: f64,
    pub axis2_steps: f64,
}

#[derive(Debug, Clone)]
pub struct BumpController {
    config: BumpConfig,
    max_position: (u32, u32),
    average: Option<(f64, f64)>,
    weight: f64,
    active: bool,
    forced: bool,
    started: Option<Instant>,
    warned: bool,
}

impl BumpController {
    pub fn new(config: BumpConfig, max_position: (u32, u32)) -> Self {
        Self {
            config,
            max_position,
            average: None,
            weight: 0.0,
            active: false,
            forced: false,
            started: None,
            warned: false,
        }
    }

    pub fn config(&self) -> &BumpConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Request a recentre on the next update, e.g. after a dither.
    pub fn force(&mut self) {
        if self.config.bump_on_dither {
            self.forced = true;
        }
    }

    pub fn reset(&mut self) {
        self.average = None;
        self.stop();
    }

    fn stop(&mut self) {
        self.weight = 0.0;
        self.active = false;
        self.forced = false;
        self.started = None;
        self.warned = false;
    }

    /// Largest per-axis excursion of the averaged position, percent of travel.
    fn excursion(&self, average: (f64, f64)) -> f64 {
        let pct = |pos: f64, max: u32| {
            if max == 0 {
                0.0
            } else {
                100.0 * pos.abs() / max as f64
            }
        };
        pct(average.0, self.max_position.0).max(pct(average.1, self.max_position.1))
    }

    /// Feed the AO position after the latest guide step.
    pub fn update(&mut self, position: (i32, i32)) -> Option<BumpRequest> {
        let (x, y) = (position.0 as f64, position.1 as f64);
        let average = match self.average {
            Some((ax, ay)) => (ax + POSITION_ALPHA * (x - ax), ay + POSITION_ALPHA * (y - ay)),
            None => (x, y),
        };
        self.average = Some(average);
        let excursion = self.excursion(average);

        if excursion <= self.config.bump_center_tolerance {
            if self.active {
                log::info!(
                    "AO bump complete, position ({:.1}, {:.1})",
                    average.0,
                    average.1
                );
            }
            self.stop();
            return None;
        }

        if !self.active && (excursion > self.config.bump_percentage || self.forced) {
            log::info!("AO at {excursion:.0}% of travel, starting bump");
            self.active = true;
            self.weight = 1.0;
            self.started = Some(Instant::now());
        } else if self.active {
            if excursion > self.config.upper_percentage() {
                self.weight += 1.0;
            } else if excursion > self.config.bump_percentage {
                self.weight += SLOW_WEIGHT_STEP;
            }
        }
        self.forced = false;

        if !self.active {
            return None;
        }
        if self.is_overdue() && !self.warned {
            log::warn!(
                "AO bump has run for more than {:.0} s, mount may be unable to keep up",
                self.config.bump_warn_time_s
            );
            self.warned = true;
        }

        let (dx, dy) = (-average.0, -average.1);
        let length = dx.hypot(dy);
        let steps = self.config.bump_max_steps_per_cycle * self.weight;
        let scale = if length > steps { steps / length } else { 1.0 };
        Some(BumpRequest {
            axis1_steps: dx * scale,
            axis2_steps: dy * scale,
        })
    }

    /// A bump has been running longer than the warn time.
    pub fn is_overdue(&self) -> bool {
        self.started.is_some_and(|t| {
            t.elapsed() >= Duration::from_secs_f64(self.config.bump_warn_time_s)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_idle_inside_threshold() {
        let mut bump = BumpController::new(BumpConfig::default(), (45, 45));
        for _ in 0..10 {
            assert!(bump.update((30, -20)).is_none());
        }
        assert!(!bump.is_active());
    }

    #[test]
    fn test_engages_above_threshold_and_releases_near_centre() {
        let mut bump = BumpController::new(BumpConfig::default(), (45, 45));
        let request = bump.update((40, 0)).expect("bump should start at 89%");
        assert!(bump.is_active());
        assert_relative_eq!(request.axis1_steps, -1.0, epsilon = 1e-12);
        assert_relative_eq!(request.axis2_steps, 0.0, epsilon = 1e-12);

        let mut released = false;
        for _ in 0..20 {
            if bump.update((0, 0)).is_none() {
                released = true;
                break;
            }
        }
        assert!(released);
        assert!(!bump.is_active());
        assert_eq!(bump.weight(), 0.0);
    }

    #[test]
    fn test_weight_grows_faster_beyond_upper_threshold() {
        let mut fast = BumpController::new(BumpConfig::default(), (100, 100));
        let mut slow = BumpController::new(BumpConfig::default(), (100, 100));
        for _ in 0..6 {
            fast.update((95, 0));
            slow.update((85, 0));
        }
        assert_relative_eq!(fast.weight(), 6.0, epsilon = 1e-12);
        assert_relative_eq!(slow.weight(), 1.0 + 5.0 / 6.0, epsilon = 1e-12);
    }

    #[test]
    fn test_dither_forces_bump() {
        let mut bump = BumpController::new(BumpConfig::default(), (45, 45));
        assert!(bump.update((20, 0)).is_none());
        bump.force();
        assert!(bump.update((20, 0)).is_some());
    }

    #[test]
    fn test_overdue_warning() {
        let config = BumpConfig {
            bump_warn_time_s: 0.0,
            ..BumpConfig::default()
        };
        let mut bump = BumpController::new(config, (45, 45));
        bump.update((44, 44));
        assert!(bump.is_overdue());
    }

    #[test]
    fn test_invalid_thresholds() {
        let config = BumpConfig {
            bump_center_tolerance: 90.0,
            ..BumpConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
