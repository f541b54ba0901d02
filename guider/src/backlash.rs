//! Dec backlash compensation.
//!
//! When a Dec guide pulse reverses the previous Dec direction, the gear
//! slack has to be taken up before the mount moves. The compensator adds a
//! fixed extra pulse on every reversal and, when auto adjustment is on,
//! tunes that pulse from how far the star missed on the frame after it.

use crate::error::{GuideError, GuideResult};
use serde::{Deserialize, Serialize};
use shared::mount_interface::{GuideAxis, GuideDirection};
use std::collections::VecDeque;

/// Longest compensation pulse (ms).
pub const MAX_COMP_AMOUNT: u32 = 8000;
/// Smallest useful compensation pulse (ms).
pub const MIN_COMP_AMOUNT: u32 = 20;
/// Reversal misses kept for adjustment.
const HISTORY_SIZE: usize = 10;
/// A single adjustment grows the pulse by at most this factor.
const MAX_INCREASE: f64 = 1.1;
/// A single adjustment shrinks the pulse to no less than this factor.
const MAX_DECREASE: f64 = 0.8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacklashConfig {
    /// Add the compensation pulse on Dec reversals
    pub enabled: bool,
    /// Compensation pulse (ms)
    pub pulse_ms: u32,
    /// Tune the pulse from the miss after each reversal
    pub auto_adjust: bool,
    /// Auto adjustment never goes below this (ms)
    pub floor_ms: u32,
    /// Auto adjustment never goes above this (ms). Defaults to 1.5x the
    /// starting pulse.
    pub ceiling_ms: Option<u32>,
}

impl Default for BacklashConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            pulse_ms: 100,
            auto_adjust: true,
            floor_ms: MIN_COMP_AMOUNT,
            ceiling_ms: None,
        }
    }
}

impl BacklashConfig {
    pub fn validate(&self) -> GuideResult<()> {
        if self.pulse_ms > MAX_COMP_AMOUNT {
            return Err(GuideError::InvalidConfig(format!(
                "backlash pulse of {} ms exceeds {MAX_COMP_AMOUNT} ms",
                self.pulse_ms
            )));
        }
        if let Some(ceiling) = self.ceiling_ms {
            if ceiling < self.floor_ms {
                return Err(GuideError::InvalidConfig(format!(
                    "backlash ceiling {ceiling} ms is below the floor {} ms",
                    self.floor_ms
                )));
            }
        }
        Ok(())
    }

    fn ceiling(&self) -> u32 {
        let ceiling = match self.ceiling_ms {
            Some(ceiling) => ceiling,
            None => (1.5 * self.pulse_ms as f64).round() as u32,
        };
        ceiling.min(MAX_COMP_AMOUNT)
    }
}

#[derive(Debug, Clone)]
pub struct BacklashCompensator {
    enabled: bool,
    auto_adjust: bool,
    pulse_ms: u32,
    floor_ms: u32,
    ceiling_ms: u32,
    last_direction: Option<GuideDirection>,
    /// A compensated pulse went out and its result has not been seen yet
    awaiting_result: bool,
    /// Signed residuals after reversals, positive when the pulse fell short
    misses: VecDeque<f64>,
}

impl BacklashCompensator {
    pub fn new(config: &BacklashConfig) -> Self {
        let floor_ms = config.floor_ms.min(config.pulse_ms);
        let ceiling_ms = config.ceiling().max(config.pulse_ms);
        Self {
            enabled: config.enabled,
            // Floor and ceiling this close leave nothing to adjust.
            auto_adjust: config.auto_adjust && ceiling_ms - floor_ms >= MIN_COMP_AMOUNT,
            pulse_ms: config.pulse_ms,
            floor_ms,
            ceiling_ms,
            last_direction: None,
            awaiting_result: false,
            misses: VecDeque::with_capacity(HISTORY_SIZE),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn pulse_ms(&self) -> u32 {
        self.pulse_ms
    }

    pub fn last_direction(&self) -> Option<GuideDirection> {
        self.last_direction
    }

    /// Forget the last Dec direction, e.g. after a dither or any Dec move
    /// the compensator did not see.
    pub fn reset_baseline(&mut self) {
        if self.last_direction.is_some() {
            log::debug!("Backlash baseline reset");
        }
        self.last_direction = None;
        self.awaiting_result = false;
    }

    /// Extend a Dec guide pulse when it reverses the previous direction.
    /// Returns the pulse to send.
    pub fn apply(&mut self, direction: GuideDirection, amount: u32) -> u32 {
        self.awaiting_result = false;
        if !self.enabled || self.pulse_ms == 0 || amount == 0 {
            return amount;
        }
        let mut amount = amount;
        if let Some(last) = self.last_direction {
            if last != direction {
                log::debug!(
                    "Dec reversal {last} -> {direction}, adding {} ms backlash pulse",
                    self.pulse_ms
                );
                amount = amount.saturating_add(self.pulse_ms);
                self.awaiting_result = true;
            }
        }
        self.last_direction = Some(direction);
        amount
    }

    /// Look at the raw Dec offset on the frame after a compensated pulse and
    /// tune the pulse. `dec_rate` is pixels per millisecond.
    pub fn track(&mut self, dec_offset: f64, min_move: f64, dec_rate: f64) {
        if !self.awaiting_result {
            return;
        }
        self.awaiting_result = false;
        let Some(last) = self.last_direction else {
            return;
        };
        if !self.auto_adjust || !dec_offset.is_finite() || dec_rate <= 0.0 {
            return;
        }

        // The move this offset asks for, same sign convention as guide plans.
        let wanted = GuideDirection::along(GuideAxis::Axis2, dec_offset < 0.0);
        let miss = if wanted == last {
            dec_offset.abs()
        } else {
            -dec_offset.abs()
        };
        if self.misses.len() == HISTORY_SIZE {
            self.misses.pop_front();
        }
        self.misses.push_back(miss);

        if dec_offset.abs() < min_move {
            return;
        }
        let average = self.misses.iter().sum::<f64>() / self.misses.len() as f64;
        if average.abs() <= min_move {
            return;
        }

        let pulse = self.pulse_ms as f64;
        let correction = (average / dec_rate).abs().round();
        let adjusted = if average > 0.0 {
            (pulse + correction).min(pulse * MAX_INCREASE).round() as u32
        } else {
            (pulse - correction).max(pulse * MAX_DECREASE).round() as u32
        };
        let adjusted = adjusted.clamp(self.floor_ms, self.ceiling_ms);
        if adjusted != self.pulse_ms {
            log::info!(
                "Backlash pulse adjusted {} -> {adjusted} ms (average miss {average:.2} px)",
                self.pulse_ms
            );
            if self.misses.len() > 2 {
                self.misses.pop_front();
            }
            self.pulse_ms = adjusted;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled(pulse_ms: u32) -> BacklashCompensator {
        BacklashCompensator::new(&BacklashConfig {
            enabled: true,
            pulse_ms,
            ..BacklashConfig::default()
        })
    }

    #[test]
    fn test_disabled_leaves_pulses_alone() {
        let mut blc = BacklashCompensator::new(&BacklashConfig::default());
        assert_eq!(blc.apply(GuideDirection::North, 200), 200);
        assert_eq!(blc.apply(GuideDirection::South, 200), 200);
    }

    #[test]
    fn test_adds_pulse_only_on_reversal() {
        let mut blc = enabled(300);
        assert_eq!(blc.apply(GuideDirection::North, 100), 100);
        assert_eq!(blc.apply(GuideDirection::North, 100), 100);
        assert_eq!(blc.apply(GuideDirection::South, 100), 400);
        assert_eq!(blc.apply(GuideDirection::South, 50), 50);
        assert_eq!(blc.last_direction(), Some(GuideDirection::South));
    }

    #[test]
    fn test_reset_baseline_skips_next_reversal() {
        let mut blc = enabled(300);
        blc.apply(GuideDirection::North, 100);
        blc.reset_baseline();
        assert_eq!(blc.apply(GuideDirection::South, 100), 100);
    }

    #[test]
    fn test_undershoot_grows_pulse_by_at_most_ten_percent() {
        let mut blc = enabled(200);
        blc.apply(GuideDirection::North, 100);
        blc.apply(GuideDirection::South, 100);
        // Star is still asking for South: the reversal fell short.
        // Offset > 0 wants a South move.
        blc.track(2.0, 0.2, 0.01);
        assert_eq!(blc.pulse_ms(), 220);
    }

    #[test]
    fn test_overshoot_shrinks_pulse() {
        let mut blc = enabled(200);
        blc.apply(GuideDirection::North, 100);
        blc.apply(GuideDirection::South, 100);
        // Star went past and now wants North.
        blc.track(-0.5, 0.2, 0.01);
        assert_eq!(blc.pulse_ms(), 160);
    }

    #[test]
    fn test_small_miss_keeps_pulse() {
        let mut blc = enabled(200);
        blc.apply(GuideDirection::North, 100);
        blc.apply(GuideDirection::South, 100);
        blc.track(0.1, 0.2, 0.01);
        assert_eq!(blc.pulse_ms(), 200);
    }

    #[test]
    fn test_tracks_only_after_a_compensated_pulse() {
        let mut blc = enabled(200);
        blc.apply(GuideDirection::North, 100);
        blc.track(5.0, 0.2, 0.01);
        assert_eq!(blc.pulse_ms(), 200);
    }

    #[test]
    fn test_adjustment_respects_ceiling() {
        let mut blc = BacklashCompensator::new(&BacklashConfig {
            enabled: true,
            pulse_ms: 200,
            ceiling_ms: Some(205),
            ..BacklashConfig::default()
        });
        blc.apply(GuideDirection::North, 100);
        blc.apply(GuideDirection::South, 100);
        blc.track(2.0, 0.2, 0.01);
        assert_eq!(blc.pulse_ms(), 205);
    }

    #[test]
    fn test_validate() {
        BacklashConfig::default().validate().unwrap();
        let too_long = BacklashConfig {
            pulse_ms: MAX_COMP_AMOUNT + 1,
            ..BacklashConfig::default()
        };
        assert!(too_long.validate().is_err());
        let inverted = BacklashConfig {
            floor_ms: 100,
            ceiling_ms: Some(50),
            ..BacklashConfig::default()
        };
        assert!(inverted.validate().is_err());
    }
}
