//! Lowpass: windowed median plus a weighted trend term.

use super::axis_stats::AxisStats;
use super::{is_null_input, AlgorithmKind, GuideAlgorithm, MoveLimits};
use crate::error::{GuideError, GuideResult};
use serde::{Deserialize, Serialize};

const HISTORY_SIZE: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LowpassParams {
    /// Weight of the fitted slope added to the median
    pub slope_weight: f64,
    /// Percentage of the filtered value corrected per frame, 0 ..= 100
    pub aggressiveness: f64,
    #[serde(flatten)]
    pub limits: MoveLimits,
}

impl Default for LowpassParams {
    fn default() -> Self {
        Self {
            slope_weight: 5.0,
            aggressiveness: 100.0,
            limits: MoveLimits::default(),
        }
    }
}

impl LowpassParams {
    pub fn validate(&self) -> GuideResult<()> {
        if !(0.0..=100.0).contains(&self.aggressiveness) {
            return Err(GuideError::InvalidConfig(format!(
                "aggressiveness must be within 0..=100, got {}",
                self.aggressiveness
            )));
        }
        if !self.slope_weight.is_finite() || self.slope_weight < 0.0 {
            return Err(GuideError::InvalidConfig(format!(
                "slope weight must be >= 0, got {}",
                self.slope_weight
            )));
        }
        self.limits.validate()
    }
}

/// The history starts as a full window of zeros so early frames are damped.
#[derive(Debug, Clone)]
pub struct Lowpass {
    params: LowpassParams,
    history: AxisStats,
    time_base: u64,
}

impl Lowpass {
    pub fn new(params: LowpassParams) -> GuideResult<Self> {
        params.validate()?;
        let mut algo = Self {
            params,
            history: AxisStats::new(0),
            time_base: 0,
        };
        algo.reset();
        Ok(algo)
    }
}

impl GuideAlgorithm for Lowpass {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::Lowpass
    }

    fn result(&mut self, input: f64) -> f64 {
        if is_null_input(input) {
            return 0.0;
        }
        self.history.add(self.time_base as f64, input);
        self.time_base += 1;
        let median = self.history.median();
        self.history.remove_oldest();
        let (slope, _) = self.history.linear_fit();

        let mut filtered = median + self.params.slope_weight * slope;
        if filtered.abs() > input.abs() {
            filtered = input;
        }
        filtered *= self.params.aggressiveness / 100.0;

        if input.abs() < self.params.limits.min_move {
            return 0.0;
        }
        self.params.limits.apply(filtered)
    }

    fn reset(&mut self) {
        self.history.clear();
        self.time_base = 0;
        while self.history.count() < HISTORY_SIZE {
            self.history.add(self.time_base as f64, 0.0);
            self.time_base += 1;
        }
    }

    fn min_move(&self) -> f64 {
        self.params.limits.min_move
    }

    fn max_move(&self) -> f64 {
        self.params.limits.max_move
    }

    fn set_min_move(&mut self, min_move: f64) -> GuideResult<()> {
        self.params.limits.set_min_move(min_move)
    }

    fn set_max_move(&mut self, max_move: f64) -> GuideResult<()> {
        self.params.limits.set_max_move(max_move)
    }

    fn configuration_string(&self) -> String {
        format!(
            "{}, Slope weight = {:.3}, Aggressiveness = {:.1}, Minimum move = {:.3}, Maximum move = {:.3}",
            self.kind(),
            self.params.slope_weight,
            self.params.aggressiveness,
            self.params.limits.min_move,
            self.params.limits.max_move
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_single_spike_is_damped() {
        let mut algo = Lowpass::new(LowpassParams::default()).unwrap();
        // Median of nine zeros and one spike is zero; only the slope term remains.
        let out = algo.result(2.0);
        assert!(out < 2.0);
        assert!(out >= 0.0);
    }

    #[test]
    fn test_steady_offset_converges_to_input() {
        let mut algo = Lowpass::new(LowpassParams::default()).unwrap();
        let mut out = 0.0;
        for _ in 0..15 {
            out = algo.result(1.0);
        }
        assert_relative_eq!(out, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_never_exceeds_input_magnitude() {
        let mut algo = Lowpass::new(LowpassParams::default()).unwrap();
        for i in 0..30 {
            let x = 0.3 + 0.1 * i as f64;
            assert!(algo.result(x).abs() <= x + 1e-12);
        }
    }

    #[test]
    fn test_aggressiveness_scales_output() {
        let mut full = Lowpass::new(LowpassParams::default()).unwrap();
        let mut half = Lowpass::new(LowpassParams {
            aggressiveness: 50.0,
            ..LowpassParams::default()
        })
        .unwrap();
        let mut a = 0.0;
        let mut b = 0.0;
        for _ in 0..15 {
            a = full.result(1.0);
            b = half.result(1.0);
        }
        assert_relative_eq!(b, 0.5 * a, epsilon = 1e-9);
    }
}
