//! Least-squares fit of star displacement against commanded steps.

use crate::error::{GuideError, GuideResult};
use nalgebra::Vector2;

/// One calibration sample: cumulative commanded units and star position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LegSample {
    pub units: f64,
    pub position: Vector2<f64>,
}

impl LegSample {
    pub fn new(units: f64, x: f64, y: f64) -> Self {
        Self {
            units,
            position: Vector2::new(x, y),
        }
    }
}

/// Direction and size of the star motion per commanded unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisFit {
    /// Camera-space angle of the motion, radians
    pub angle: f64,
    /// Pixels per commanded unit
    pub rate: f64,
}

/// Fit `position = slope * units + intercept` independently in x and y.
pub fn fit_axis(samples: &[LegSample]) -> GuideResult<AxisFit> {
    if samples.len() < 2 {
        return Err(GuideError::CalibrationInvalid(format!(
            "need at least two samples to fit an axis, got {}",
            samples.len()
        )));
    }
    let n = samples.len() as f64;
    let mean_u = samples.iter().map(|s| s.units).sum::<f64>() / n;
    let mean_p = samples
        .iter()
        .fold(Vector2::<f64>::zeros(), |acc, s| acc + s.position)
        / n;

    let mut suu = 0.0;
    let mut sup = Vector2::<f64>::zeros();
    for s in samples {
        let du = s.units - mean_u;
        suu += du * du;
        sup += (s.position - mean_p) * du;
    }
    if suu <= f64::EPSILON {
        return Err(GuideError::CalibrationInvalid(
            "all samples were taken at the same step count".to_string(),
        ));
    }
    let slope: Vector2<f64> = sup / suu;
    let rate = slope.norm();
    if !rate.is_finite() || rate <= 1e-9 {
        return Err(GuideError::CalibrationInvalid(format!(
            "star did not move during calibration (rate {rate:.3e})"
        )));
    }
    Ok(AxisFit {
        angle: slope.y.atan2(slope.x),
        rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_fit_straight_leg() {
        let samples: Vec<LegSample> = (0..10)
            .map(|i| {
                let i = i as f64;
                LegSample::new(i * 100.0, 5.0 + 3.0 * i, 7.0 + 4.0 * i)
            })
            .collect();
        let fit = fit_axis(&samples).unwrap();
        assert_relative_eq!(fit.rate, 0.05, epsilon = 1e-12);
        assert_relative_eq!(fit.angle, (4.0f64).atan2(3.0), epsilon = 1e-12);
    }

    #[test]
    fn test_fit_tolerates_centroid_noise() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let samples: Vec<LegSample> = (0..20)
            .map(|i| {
                LegSample::new(
                    i as f64,
                    -2.0 * i as f64 + rng.gen_range(-0.2..0.2),
                    rng.gen_range(-0.2..0.2),
                )
            })
            .collect();
        let fit = fit_axis(&samples).unwrap();
        assert_relative_eq!(fit.rate, 2.0, epsilon = 0.05);
        assert!((fit.angle.abs() - std::f64::consts::PI).abs() < 0.02);
    }

    #[test]
    fn test_stationary_star_is_invalid() {
        let samples: Vec<LegSample> = (0..5).map(|i| LegSample::new(i as f64, 1.0, 1.0)).collect();
        assert!(matches!(
            fit_axis(&samples),
            Err(GuideError::CalibrationInvalid(_))
        ));
    }
}
