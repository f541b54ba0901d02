//! Pass-through algorithm.

use super::{is_null_input, AlgorithmKind, GuideAlgorithm, MoveLimits};
use crate::error::GuideResult;

/// Corrects the full measured offset, subject to the move limits.
#[derive(Debug, Clone)]
pub struct Identity {
    limits: MoveLimits,
}

impl Identity {
    pub fn new(limits: MoveLimits) -> GuideResult<Self> {
        limits.validate()?;
        Ok(Self { limits })
    }
}

impl GuideAlgorithm for Identity {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::Identity
    }

    fn result(&mut self, input: f64) -> f64 {
        if is_null_input(input) {
            return 0.0;
        }
        self.limits.apply(input)
    }

    fn reset(&mut self) {}

    fn min_move(&self) -> f64 {
        self.limits.min_move
    }

    fn max_move(&self) -> f64 {
        self.limits.max_move
    }

    fn set_min_move(&mut self, min_move: f64) -> GuideResult<()> {
        self.limits.set_min_move(min_move)
    }

    fn set_max_move(&mut self, max_move: f64) -> GuideResult<()> {
        self.limits.set_max_move(max_move)
    }

    fn configuration_string(&self) -> String {
        format!(
            "{}, Minimum move = {:.3}, Maximum move = {:.3}",
            self.kind(),
            self.limits.min_move,
            self.limits.max_move
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_definition() {
        let mut algo = Identity::new(MoveLimits::new(0.25, 3.0).unwrap()).unwrap();
        for x in [-0.2, -0.1, 0.05, 0.249] {
            assert_eq!(algo.result(x), 0.0);
        }
        for x in [0.25, 1.0, -2.5, 3.0] {
            assert_eq!(algo.result(x), x);
        }
        assert_eq!(algo.result(7.0), 3.0);
        assert_eq!(algo.result(-7.0), -3.0);
    }

    #[test]
    fn test_configuration_string() {
        let algo = Identity::new(MoveLimits::default()).unwrap();
        assert_eq!(
            algo.configuration_string(),
            "Identity, Minimum move = 0.200, Maximum move = 50.000"
        );
    }
}
