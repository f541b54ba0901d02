//! Star drift patterns for guiding tests
//!
//! A drift profile gives the uncorrected star displacement, in camera pixels,
//! after a given amount of simulated time.

use std::f64::consts::PI;
use std::time::Duration;

/// Trait for uncorrected star motion
pub trait DriftProfile: Send + Sync {
    /// Star displacement `(dx, dy)` at time `t`
    fn offset(&self, t: Duration) -> (f64, f64);

    /// Short description for logs
    fn description(&self) -> &str;
}

/// No drift at all
pub struct NoDrift;

impl DriftProfile for NoDrift {
    fn offset(&self, _t: Duration) -> (f64, f64) {
        (0.0, 0.0)
    }

    fn description(&self) -> &str {
        "Static (no drift)"
    }
}

/// Constant-rate drift, as from polar misalignment
pub struct LinearDrift {
    /// Pixels per second along x and y
    rate: (f64, f64),
}

impl LinearDrift {
    pub fn new(x_px_per_s: f64, y_px_per_s: f64) -> Self {
        Self {
            rate: (x_px_per_s, y_px_per_s),
        }
    }
}

impl DriftProfile for LinearDrift {
    fn offset(&self, t: Duration) -> (f64, f64) {
        let s = t.as_secs_f64();
        (self.rate.0 * s, self.rate.1 * s)
    }

    fn description(&self) -> &str {
        "Linear drift"
    }
}

/// Sinusoidal error along one direction, as from worm gear periodic error
pub struct PeriodicError {
    amplitude_px: f64,
    period_s: f64,
    /// Direction of the error in camera coordinates (radians)
    angle: f64,
}

impl PeriodicError {
    pub fn new(amplitude_px: f64, period_s: f64, angle: f64) -> Self {
        Self {
            amplitude_px,
            period_s,
            angle,
        }
    }
}

impl DriftProfile for PeriodicError {
    fn offset(&self, t: Duration) -> (f64, f64) {
        let phase = 2.0 * PI * t.as_secs_f64() / self.period_s;
        let along = self.amplitude_px * phase.sin();
        (along * self.angle.cos(), along * self.angle.sin())
    }

    fn description(&self) -> &str {
        "Periodic error"
    }
}

/// Sum of several profiles
pub struct CompositeDrift {
    parts: Vec<Box<dyn DriftProfile>>,
    description: String,
}

impl CompositeDrift {
    pub fn new(parts: Vec<Box<dyn DriftProfile>>) -> Self {
        let description = parts
            .iter()
            .map(|p| p.description())
            .collect::<Vec<_>>()
            .join(" + ");
        Self { parts, description }
    }
}

impl DriftProfile for CompositeDrift {
    fn offset(&self, t: Duration) -> (f64, f64) {
        self.parts.iter().fold((0.0, 0.0), |(x, y), part| {
            let (dx, dy) = part.offset(t);
            (x + dx, y + dy)
        })
    }

    fn description(&self) -> &str {
        &self.description
    }
}

/// Named drift patterns used by the demo and the tests
pub struct TestDrifts;

impl TestDrifts {
    /// Look up a profile by name: none, linear, periodic or combined.
    pub fn by_name(name: &str) -> Option<Box<dyn DriftProfile>> {
        match name {
            "none" => Some(Box::new(NoDrift)),
            "linear" => Some(Box::new(LinearDrift::new(0.02, -0.01))),
            "periodic" => Some(Box::new(PeriodicError::new(1.5, 120.0, 0.0))),
            "combined" => Some(Self::combined()),
            _ => None,
        }
    }

    /// Slow polar-alignment drift plus RA periodic error
    pub fn combined() -> Box<dyn DriftProfile> {
        Box::new(CompositeDrift::new(vec![
            Box::new(LinearDrift::new(0.02, -0.01)),
            Box::new(PeriodicError::new(1.5, 120.0, 0.0)),
        ]))
    }

    pub fn names() -> &'static [&'static str] {
        &["none", "linear", "periodic", "combined"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_linear_drift_scales_with_time() {
        let drift = LinearDrift::new(0.5, -0.25);
        let (x, y) = drift.offset(Duration::from_secs(4));
        assert_relative_eq!(x, 2.0);
        assert_relative_eq!(y, -1.0);
    }

    #[test]
    fn test_periodic_error_peaks_at_quarter_period() {
        let drift = PeriodicError::new(2.0, 100.0, 0.0);
        let (x, y) = drift.offset(Duration::from_secs(25));
        assert_relative_eq!(x, 2.0, epsilon = 1e-9);
        assert_relative_eq!(y, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_composite_sums_parts() {
        let drift = TestDrifts::combined();
        let (x, _) = drift.offset(Duration::from_secs(30));
        assert_relative_eq!(x, 0.6 + 1.5, epsilon = 1e-9);
        assert_eq!(drift.description(), "Linear drift + Periodic error");
    }

    #[test]
    fn test_lookup_by_name() {
        for name in TestDrifts::names() {
            assert!(TestDrifts::by_name(name).is_some(), "{name}");
        }
        assert!(TestDrifts::by_name("chaotic").is_none());
    }
}
