//! Guide algorithms: per-axis filters that turn a measured offset into a
//! correction.
//!
//! Each axis owns one boxed [`GuideAlgorithm`]. Inputs and outputs are in
//! pixels along the device axis; converting to pulse milliseconds or AO
//! steps happens later using the calibration rates.
//!
//! Rules every implementation follows:
//! - `result(0.0)` returns 0.0 and leaves internal state untouched
//! - outputs are clamped to `[-max_move, max_move]`
//! - outputs smaller than `min_move` are reported as 0.0

pub mod axis_stats;
pub mod gaussian_process;
pub mod hysteresis;
pub mod identity;
pub mod lowpass;
pub mod lowpass2;
pub mod resist_switch;
pub mod zfilter;

use crate::error::{GuideError, GuideResult};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use axis_stats::AxisStats;
pub use gaussian_process::{GaussianProcess, GaussianProcessParams};
pub use hysteresis::{Hysteresis, HysteresisParams};
pub use identity::Identity;
pub use lowpass::{Lowpass, LowpassParams};
pub use lowpass2::{Lowpass2, Lowpass2Params};
pub use resist_switch::{ResistSwitch, ResistSwitchParams};
pub use zfilter::{ZFilter, ZFilterParams};

/// Default minimum move in pixels.
pub const DEFAULT_MIN_MOVE: f64 = 0.2;

/// Default maximum move in pixels.
pub const DEFAULT_MAX_MOVE: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlgorithmKind {
    Identity,
    Lowpass,
    Lowpass2,
    Hysteresis,
    ResistSwitch,
    ZFilter,
    GaussianProcess,
}

impl AlgorithmKind {
    pub fn display_name(&self) -> &'static str {
        match self {
            AlgorithmKind::Identity => "Identity",
            AlgorithmKind::Lowpass => "Lowpass",
            AlgorithmKind::Lowpass2 => "Lowpass2",
            AlgorithmKind::Hysteresis => "Hysteresis",
            AlgorithmKind::ResistSwitch => "Resist Switch",
            AlgorithmKind::ZFilter => "Z-Filter",
            AlgorithmKind::GaussianProcess => "Gaussian Process",
        }
    }
}

impl fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// One axis of guide filtering.
pub trait GuideAlgorithm: Send {
    fn kind(&self) -> AlgorithmKind;

    /// Correction for this frame's offset. Call at most once per frame.
    fn result(&mut self, input: f64) -> f64;

    /// Forget all learned state.
    fn reset(&mut self);

    fn min_move(&self) -> f64;

    fn max_move(&self) -> f64;

    fn set_min_move(&mut self, min_move: f64) -> GuideResult<()>;

    fn set_max_move(&mut self, max_move: f64) -> GuideResult<()>;

    /// Display name and every tunable parameter, for logging.
    fn configuration_string(&self) -> String;
}

/// Minimum and maximum correction magnitudes shared by all algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MoveLimits {
    pub min_move: f64,
    pub max_move: f64,
}

impl Default for MoveLimits {
    fn default() -> Self {
        Self {
            min_move: DEFAULT_MIN_MOVE,
            max_move: DEFAULT_MAX_MOVE,
        }
    }
}

impl MoveLimits {
    pub fn new(min_move: f64, max_move: f64) -> GuideResult<Self> {
        let limits = Self { min_move, max_move };
        limits.validate()?;
        Ok(limits)
    }

    pub fn validate(&self) -> GuideResult<()> {
        if !self.min_move.is_finite() || self.min_move < 0.0 {
            return Err(GuideError::InvalidConfig(format!(
                "min_move must be >= 0, got {}",
                self.min_move
            )));
        }
        if !self.max_move.is_finite() || self.max_move <= 0.0 {
            return Err(GuideError::InvalidConfig(format!(
                "max_move must be > 0, got {}",
                self.max_move
            )));
        }
        if self.min_move > self.max_move {
            return Err(GuideError::InvalidConfig(format!(
                "min_move {} exceeds max_move {}",
                self.min_move, self.max_move
            )));
        }
        Ok(())
    }

    pub fn set_min_move(&mut self, min_move: f64) -> GuideResult<()> {
        Self::new(min_move, self.max_move)?;
        self.min_move = min_move;
        Ok(())
    }

    pub fn set_max_move(&mut self, max_move: f64) -> GuideResult<()> {
        Self::new(self.min_move, max_move)?;
        self.max_move = max_move;
        Ok(())
    }

    /// Zero out moves below `min_move` and clamp to `max_move`.
    pub fn apply(&self, value: f64) -> f64 {
        if !value.is_finite() || value.abs() < self.min_move {
            0.0
        } else {
            value.clamp(-self.max_move, self.max_move)
        }
    }
}

/// Inputs that must not touch algorithm state.
pub(crate) fn is_null_input(input: f64) -> bool {
    input == 0.0 || !input.is_finite()
}

/// Serializable algorithm selection with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum AlgorithmConfig {
    Identity(MoveLimits),
    Lowpass(LowpassParams),
    Lowpass2(Lowpass2Params),
    Hysteresis(HysteresisParams),
    ResistSwitch(ResistSwitchParams),
    ZFilter(ZFilterParams),
    GaussianProcess(GaussianProcessParams),
}

impl AlgorithmConfig {
    pub fn kind(&self) -> AlgorithmKind {
        match self {
            AlgorithmConfig::Identity(_) => AlgorithmKind::Identity,
            AlgorithmConfig::Lowpass(_) => AlgorithmKind::Lowpass,
            AlgorithmConfig::Lowpass2(_) => AlgorithmKind::Lowpass2,
            AlgorithmConfig::Hysteresis(_) => AlgorithmKind::Hysteresis,
            AlgorithmConfig::ResistSwitch(_) => AlgorithmKind::ResistSwitch,
            AlgorithmConfig::ZFilter(_) => AlgorithmKind::ZFilter,
            AlgorithmConfig::GaussianProcess(_) => AlgorithmKind::GaussianProcess,
        }
    }

    /// Default parameters for a given algorithm.
    pub fn default_for(kind: AlgorithmKind) -> Self {
        match kind {
            AlgorithmKind::Identity => AlgorithmConfig::Identity(MoveLimits::default()),
            AlgorithmKind::Lowpass => AlgorithmConfig::Lowpass(LowpassParams::default()),
            AlgorithmKind::Lowpass2 => AlgorithmConfig::Lowpass2(Lowpass2Params::default()),
            AlgorithmKind::Hysteresis => AlgorithmConfig::Hysteresis(HysteresisParams::default()),
            AlgorithmKind::ResistSwitch => {
                AlgorithmConfig::ResistSwitch(ResistSwitchParams::default())
            }
            AlgorithmKind::ZFilter => AlgorithmConfig::ZFilter(ZFilterParams::default()),
            AlgorithmKind::GaussianProcess => {
                AlgorithmConfig::GaussianProcess(GaussianProcessParams::default())
            }
        }
    }

    /// Construct the algorithm, validating its parameters.
    pub fn build(&self) -> GuideResult<Box<dyn GuideAlgorithm>> {
        Ok(match self {
            AlgorithmConfig::Identity(limits) => Box::new(Identity::new(*limits)?),
            AlgorithmConfig::Lowpass(p) => Box::new(Lowpass::new(p.clone())?),
            AlgorithmConfig::Lowpass2(p) => Box::new(Lowpass2::new(p.clone())?),
            AlgorithmConfig::Hysteresis(p) => Box::new(Hysteresis::new(p.clone())?),
            AlgorithmConfig::ResistSwitch(p) => Box::new(ResistSwitch::new(p.clone())?),
            AlgorithmConfig::ZFilter(p) => Box::new(ZFilter::new(p.clone())?),
            AlgorithmConfig::GaussianProcess(p) => Box::new(GaussianProcess::new(p.clone())?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_KINDS: [AlgorithmKind; 7] = [
        AlgorithmKind::Identity,
        AlgorithmKind::Lowpass,
        AlgorithmKind::Lowpass2,
        AlgorithmKind::Hysteresis,
        AlgorithmKind::ResistSwitch,
        AlgorithmKind::ZFilter,
        AlgorithmKind::GaussianProcess,
    ];

    #[test]
    fn test_limits_apply() {
        let limits = MoveLimits::new(0.2, 5.0).unwrap();
        assert_eq!(limits.apply(0.1), 0.0);
        assert_eq!(limits.apply(-0.19), 0.0);
        assert_eq!(limits.apply(0.3), 0.3);
        assert_eq!(limits.apply(12.0), 5.0);
        assert_eq!(limits.apply(-12.0), -5.0);
        assert_eq!(limits.apply(f64::NAN), 0.0);
    }

    #[test]
    fn test_limits_validation() {
        assert!(MoveLimits::new(-0.1, 5.0).is_err());
        assert!(MoveLimits::new(0.1, 0.0).is_err());
        assert!(MoveLimits::new(6.0, 5.0).is_err());
        let mut limits = MoveLimits::default();
        assert!(limits.set_max_move(0.1).is_err());
        assert_eq!(limits.max_move, DEFAULT_MAX_MOVE);
    }

    #[test]
    fn test_null_input_is_idempotent_for_every_algorithm() {
        for kind in ALL_KINDS {
            let mut algo = AlgorithmConfig::default_for(kind).build().unwrap();
            // Give stateful filters some history first.
            for x in [0.5, -0.7, 0.9, 1.2] {
                algo.result(x);
            }
            let before = algo.configuration_string();
            for _ in 0..20 {
                assert_eq!(algo.result(0.0), 0.0, "{kind}");
            }
            assert_eq!(algo.configuration_string(), before, "{kind}");
        }
    }

    #[test]
    fn test_output_never_exceeds_max_move() {
        for kind in ALL_KINDS {
            let mut algo = AlgorithmConfig::default_for(kind).build().unwrap();
            algo.set_max_move(1.5).unwrap();
            for i in 0..60 {
                let x = ((i as f64) * 0.7).sin() * 40.0 + if i % 7 == 0 { 500.0 } else { 0.0 };
                let out = algo.result(x);
                assert!(out.abs() <= 1.5 + 1e-12, "{kind}: {out}");
            }
        }
    }

    #[test]
    fn test_configuration_string_names_algorithm() {
        for kind in ALL_KINDS {
            let algo = AlgorithmConfig::default_for(kind).build().unwrap();
            let config = algo.configuration_string();
            assert!(config.starts_with(kind.display_name()), "{config}");
            assert!(config.contains("Minimum move"), "{config}");
            assert!(config.contains("Maximum move"), "{config}");
        }
    }

    #[test]
    fn test_config_serde_uses_kind_tag() {
        let config = AlgorithmConfig::default_for(AlgorithmKind::Hysteresis);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"kind\":\"Hysteresis\""));
        let back: AlgorithmConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
