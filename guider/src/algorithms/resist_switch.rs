//! Resist Switch: holds the correction direction until the recent history
//! clearly favours the other side. Intended for the declination axis.

use super::{is_null_input, AlgorithmKind, GuideAlgorithm, MoveLimits};
use crate::error::{GuideError, GuideResult};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

const HISTORY_SIZE: usize = 10;
const TREND_SPAN: usize = 3;
const MIN_SIDE_VOTES: i32 = 3;
const FAST_SWITCH_FACTOR: f64 = 3.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResistSwitchParams {
    /// Fraction of the offset corrected once the side is settled, 0.0 ..= 1.0
    pub aggression: f64,
    /// Allow an immediate switch on a large opposite offset
    pub fast_switch: bool,
    #[serde(flatten)]
    pub limits: MoveLimits,
}

impl Default for ResistSwitchParams {
    fn default() -> Self {
        Self {
            aggression: 1.0,
            fast_switch: true,
            limits: MoveLimits::default(),
        }
    }
}

impl ResistSwitchParams {
    pub fn validate(&self) -> GuideResult<()> {
        if !(0.0..=1.0).contains(&self.aggression) {
            return Err(GuideError::InvalidConfig(format!(
                "aggression must be within 0..=1, got {}",
                self.aggression
            )));
        }
        self.limits.validate()
    }
}

#[derive(Debug, Clone)]
pub struct ResistSwitch {
    params: ResistSwitchParams,
    history: VecDeque<f64>,
    /// -1, 0 or +1
    current_side: i32,
}

fn sign(value: f64) -> i32 {
    if value > 0.0 {
        1
    } else if value < 0.0 {
        -1
    } else {
        0
    }
}

impl ResistSwitch {
    pub fn new(params: ResistSwitchParams) -> GuideResult<Self> {
        params.validate()?;
        let mut algo = Self {
            params,
            history: VecDeque::with_capacity(HISTORY_SIZE + 1),
            current_side: 0,
        };
        algo.reset();
        Ok(algo)
    }

    /// Side currently being corrected: -1, 0 (undecided) or +1.
    pub fn current_side(&self) -> i32 {
        self.current_side
    }

    fn push(&mut self, input: f64) {
        self.history.push_back(input);
        while self.history.len() > HISTORY_SIZE {
            self.history.pop_front();
        }
    }

    /// Newest entries outweigh the oldest ones, i.e. the offset is growing.
    fn trend_is_growing(&self) -> bool {
        let oldest: f64 = self.history.iter().take(TREND_SPAN).sum();
        let newest: f64 = self.history.iter().rev().take(TREND_SPAN).sum();
        newest.abs() > oldest.abs()
    }
}

impl GuideAlgorithm for ResistSwitch {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::ResistSwitch
    }

    fn result(&mut self, input: f64) -> f64 {
        if is_null_input(input) {
            return 0.0;
        }
        let min_move = self.params.limits.min_move;
        self.push(input);

        if input.abs() < min_move {
            return 0.0;
        }

        if self.params.fast_switch
            && sign(input) != self.current_side
            && input.abs() > FAST_SWITCH_FACTOR * min_move
        {
            log::debug!(
                "Resist Switch fast switch to side {} on {input:.3}",
                sign(input)
            );
            let keep_from = self.history.len().saturating_sub(TREND_SPAN);
            for (i, value) in self.history.iter_mut().enumerate() {
                if i < keep_from {
                    *value = 0.0;
                }
            }
            self.current_side = sign(input);
            return self.params.limits.apply(input * self.params.aggression);
        }

        let votes: i32 = self
            .history
            .iter()
            .filter(|v| v.abs() > min_move)
            .map(|&v| sign(v))
            .sum();

        if self.current_side == 0 || self.current_side == -sign(votes as f64) {
            if votes.abs() < MIN_SIDE_VOTES || !self.trend_is_growing() {
                return 0.0;
            }
            log::debug!("Resist Switch side now {}", votes.signum());
            self.current_side = votes.signum();
        }

        if self.current_side != sign(input) {
            return 0.0;
        }
        self.params.limits.apply(input * self.params.aggression)
    }

    fn reset(&mut self) {
        self.history.clear();
        self.history.resize(HISTORY_SIZE, 0.0);
        self.current_side = 0;
    }

    fn min_move(&self) -> f64 {
        self.params.limits.min_move
    }

    fn max_move(&self) -> f64 {
        self.params.limits.max_move
    }

    fn set_min_move(&mut self, min_move: f64) -> GuideResult<()> {
        self.params.limits.set_min_move(min_move)?;
        self.current_side = 0;
        Ok(())
    }

    fn set_max_move(&mut self, max_move: f64) -> GuideResult<()> {
        self.params.limits.set_max_move(max_move)
    }

    fn configuration_string(&self) -> String {
        format!(
            "{}, Aggression = {:.3}, Fast switch = {}, Minimum move = {:.3}, Maximum move = {:.3}",
            self.kind(),
            self.params.aggression,
            self.params.fast_switch,
            self.params.limits.min_move,
            self.params.limits.max_move
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slow_switch() -> ResistSwitch {
        ResistSwitch::new(ResistSwitchParams {
            fast_switch: false,
            ..ResistSwitchParams::default()
        })
        .unwrap()
    }

    #[test]
    fn test_waits_for_consistent_side() {
        let mut algo = slow_switch();
        assert_eq!(algo.result(0.3), 0.0);
        assert_eq!(algo.result(0.4), 0.0);
        // Third vote on the same side with a growing trend commits.
        assert_eq!(algo.result(0.5), 0.5);
        assert_eq!(algo.current_side(), 1);
    }

    #[test]
    fn test_resists_single_opposite_offset() {
        let mut algo = slow_switch();
        for x in [0.3, 0.4, 0.5, 0.5] {
            algo.result(x);
        }
        assert_eq!(algo.current_side(), 1);
        assert_eq!(algo.result(-0.4), 0.0);
        assert_eq!(algo.current_side(), 1);
    }

    #[test]
    fn test_below_min_move_is_ignored() {
        let mut algo = ResistSwitch::new(ResistSwitchParams::default()).unwrap();
        for _ in 0..10 {
            assert_eq!(algo.result(0.1), 0.0);
        }
        assert_eq!(algo.current_side(), 0);
    }

    #[test]
    fn test_fast_switch_on_large_offset() {
        let mut algo = ResistSwitch::new(ResistSwitchParams::default()).unwrap();
        for x in [0.3, 0.4, 0.5, 0.5] {
            algo.result(x);
        }
        assert_eq!(algo.result(-2.0), -2.0);
        assert_eq!(algo.current_side(), -1);
        assert_eq!(algo.result(-0.4), -0.4);
    }
}
