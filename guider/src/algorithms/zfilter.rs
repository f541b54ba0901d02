//! Z-Filter: moving average over the most recent offsets.

use super::{is_null_input, AlgorithmKind, GuideAlgorithm, MoveLimits};
use crate::error::{GuideError, GuideResult};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub const MAX_ZFILTER_LENGTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZFilterParams {
    /// Number of frames averaged, 1 ..= 32
    pub length: usize,
    #[serde(flatten)]
    pub limits: MoveLimits,
}

impl Default for ZFilterParams {
    fn default() -> Self {
        Self {
            length: 4,
            limits: MoveLimits::default(),
        }
    }
}

impl ZFilterParams {
    pub fn validate(&self) -> GuideResult<()> {
        if !(1..=MAX_ZFILTER_LENGTH).contains(&self.length) {
            return Err(GuideError::InvalidConfig(format!(
                "filter length must be within 1..={MAX_ZFILTER_LENGTH}, got {}",
                self.length
            )));
        }
        self.limits.validate()
    }
}

#[derive(Debug, Clone)]
pub struct ZFilter {
    params: ZFilterParams,
    window: VecDeque<f64>,
}

impl ZFilter {
    pub fn new(params: ZFilterParams) -> GuideResult<Self> {
        params.validate()?;
        Ok(Self {
            window: VecDeque::with_capacity(params.length + 1),
            params,
        })
    }
}

impl GuideAlgorithm for ZFilter {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::ZFilter
    }

    fn result(&mut self, input: f64) -> f64 {
        if is_null_input(input) {
            return 0.0;
        }
        self.window.push_back(input);
        while self.window.len() > self.params.length {
            self.window.pop_front();
        }
        let average = self.window.iter().sum::<f64>() / self.window.len() as f64;
        self.params.limits.apply(average)
    }

    fn reset(&mut self) {
        self.window.clear();
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
            "{}, Length = {}, Minimum move = {:.3}, Maximum move = {:.3}",
            self.kind(),
            self.params.length,
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
    fn test_moving_average() {
        let mut algo = ZFilter::new(ZFilterParams::default()).unwrap();
        assert_relative_eq!(algo.result(1.0), 1.0);
        assert_relative_eq!(algo.result(2.0), 1.5);
        assert_relative_eq!(algo.result(3.0), 2.0);
        assert_relative_eq!(algo.result(4.0), 2.5);
        // 1.0 falls out of the window
        assert_relative_eq!(algo.result(5.0), 3.5);
    }

    #[test]
    fn test_alternating_noise_cancels() {
        let mut algo = ZFilter::new(ZFilterParams::default()).unwrap();
        let mut out = 1.0;
        for i in 0..12 {
            out = algo.result(if i % 2 == 0 { 1.0 } else { -1.0 });
        }
        assert_eq!(out, 0.0);
    }

    #[test]
    fn test_length_bounds() {
        for length in [0, MAX_ZFILTER_LENGTH + 1] {
            let params = ZFilterParams {
                length,
                ..ZFilterParams::default()
            };
            assert!(ZFilter::new(params).is_err());
        }
    }
}
