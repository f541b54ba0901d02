//! Hysteresis: blends the new offset with the previous correction and
//! refuses small direction reversals.

use super::{is_null_input, AlgorithmKind, GuideAlgorithm, MoveLimits};
use crate::error::{GuideError, GuideResult};
use serde::{Deserialize, Serialize};

pub const MAX_HYSTERESIS: f64 = 0.99;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HysteresisParams {
    /// Weight of the previous correction, 0.0 ..= 0.99
    pub hysteresis: f64,
    /// Fraction of the blended offset corrected per frame, 0.0 ..= 1.0.
    /// Large offsets pass through unattenuated only at 1.0; the default
    /// 0.7 scales every move.
    pub aggression: f64,
    #[serde(flatten)]
    pub limits: MoveLimits,
}

impl Default for HysteresisParams {
    fn default() -> Self {
        Self {
            hysteresis: 0.1,
            aggression: 0.7,
            limits: MoveLimits::default(),
        }
    }
}

impl HysteresisParams {
    pub fn validate(&self) -> GuideResult<()> {
        if !(0.0..=MAX_HYSTERESIS).contains(&self.hysteresis) {
            return Err(GuideError::InvalidConfig(format!(
                "hysteresis must be within 0..={MAX_HYSTERESIS}, got {}",
                self.hysteresis
            )));
        }
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
pub struct Hysteresis {
    params: HysteresisParams,
    last_move: f64,
}

impl Hysteresis {
    pub fn new(params: HysteresisParams) -> GuideResult<Self> {
        params.validate()?;
        Ok(Self {
            params,
            last_move: 0.0,
        })
    }

    pub fn params(&self) -> &HysteresisParams {
        &self.params
    }
}

impl GuideAlgorithm for Hysteresis {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::Hysteresis
    }

    fn result(&mut self, input: f64) -> f64 {
        if is_null_input(input) {
            return 0.0;
        }
        let h = self.params.hysteresis;
        let reversal = self.last_move != 0.0 && input.signum() != self.last_move.signum();
        if reversal && input.abs() < self.params.limits.min_move + h {
            log::debug!("Hysteresis suppressed reversal of {input:.3}");
            self.last_move = 0.0;
            return 0.0;
        }

        let blended = (1.0 - h) * input + h * self.last_move;
        let output = self.params.limits.apply(blended * self.params.aggression);
        self.last_move = output;
        output
    }

    fn reset(&mut self) {
        self.last_move = 0.0;
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
            "{}, Hysteresis = {:.3}, Aggression = {:.3}, Minimum move = {:.3}, Maximum move = {:.3}",
            self.kind(),
            self.params.hysteresis,
            self.params.aggression,
            self.params.limits.min_move,
            self.params.limits.max_move
        )
    }
}
