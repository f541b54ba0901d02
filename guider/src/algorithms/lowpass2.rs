//! Lowpass2: corrects along the trend of a short sample window and falls
//! back to an attenuated raw offset when the trend disagrees.

use super::axis_stats::AxisStats;
use super::{is_null_input, AlgorithmKind, GuideAlgorithm, MoveLimits};
use crate::error::{GuideError, GuideResult};
use serde::{Deserialize, Serialize};

const HISTORY_SIZE: usize = 10;
const MIN_FIT_POINTS: usize = 4;
const MAX_REJECTS: u32 = 3;
const OUTLIER_FACTOR: f64 = 4.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lowpass2Params {
    /// Percentage of the filtered value corrected per frame, 0 ..= 100
    pub aggressiveness: f64,
    #[serde(flatten)]
    pub limits: MoveLimits,
}

impl Default for Lowpass2Params {
    fn default() -> Self {
        Self {
            aggressiveness: 80.0,
            limits: MoveLimits::default(),
        }
    }
}

impl Lowpass2Params {
    pub fn validate(&self) -> GuideResult<()> {
        if !(0.0..=100.0).contains(&self.aggressiveness) {
            return Err(GuideError::InvalidConfig(format!(
                "aggressiveness must be within 0..=100, got {}",
                self.aggressiveness
            )));
        }
        self.limits.validate()
    }
}

#[derive(Debug, Clone)]
pub struct Lowpass2 {
    params: Lowpass2Params,
    history: AxisStats,
    time_base: u64,
    rejects: u32,
}

impl Lowpass2 {
    pub fn new(params: Lowpass2Params) -> GuideResult<Self> {
        params.validate()?;
        Ok(Self {
            params,
            history: AxisStats::new(HISTORY_SIZE),
            time_base: 0,
            rejects: 0,
        })
    }

    fn attenuation(&self) -> f64 {
        self.params.aggressiveness / 100.0
    }
}

impl GuideAlgorithm for Lowpass2 {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::Lowpass2
    }

    fn result(&mut self, input: f64) -> f64 {
        if is_null_input(input) {
            return 0.0;
        }
        self.history.add(self.time_base as f64, input);
        self.time_base += 1;
        let atten = self.attenuation();

        let mut out;
        if self.history.count() < MIN_FIT_POINTS {
            out = input * atten;
        } else if input.abs() > OUTLIER_FACTOR * self.params.limits.min_move {
            log::debug!("Lowpass2 treating {input:.3} as a step change, history reset");
            out = input * atten;
            self.reset();
        } else {
            let (slope, _) = self.history.linear_fit();
            out = slope * self.history.count() as f64 * atten;
            if out * input < 0.0 {
                out = 0.0;
            }
            if out.abs() > input.abs() {
                out = input * atten;
                self.rejects += 1;
                if self.rejects > MAX_REJECTS {
                    log::debug!("Lowpass2 trend rejected {} times, history reset", self.rejects);
                    self.reset();
                }
            } else {
                self.rejects = 0;
            }
        }

        self.params.limits.apply(out)
    }

    fn reset(&mut self) {
        self.history.clear();
        self.time_base = 0;
        self.rejects = 0;
    }

    fn min_move(&self) -> f64 {
        self.params.limits.min_move
    }

    fn max_move(&self) -> f64 {
        self.params.limits.max_move
    }

    fn set_min_move(&mut self, min_move: f64) -> GuideResult<()> {
        self.params.limits.set_min_move(min_move)?;
        self.reset();
        Ok(())
    }

    fn set_max_move(&mut self, max_move: f64) -> GuideResult<()> {
        self.params.limits.set_max_move(max_move)
    }

    fn configuration_string(&self) -> String {
        format!(
            "{}, Aggressiveness = {:.1}, Minimum move = {:.3}, Maximum move = {:.3}",
            self.kind(),
            self.params.aggressiveness,
            self.params.limits.min_move,
            self.params.limits.max_move
        )
    }
}
