//! Gaussian Process guiding.
//!
//! The algorithm reconstructs the uncorrected drift of the star by adding the
//! corrections it has already issued back onto each measured offset. A linear
//! trend is removed from that drift and the residual is modelled as a Gaussian
//! process with a squared-exponential plus periodic kernel. The output is a
//! proportional term on the current offset plus the predicted drift increment
//! over the next frame interval.

use super::axis_stats::AxisStats;
use super::{is_null_input, AlgorithmKind, GuideAlgorithm, MoveLimits};
use crate::error::{GuideError, GuideResult};
use nalgebra::{DMatrix, DVector};
use rustfft::{num_complex::Complex64, FftPlanner};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Samples kept for trend removal and period estimation.
pub const MAX_GP_HISTORY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GaussianProcessParams {
    /// Gain applied to the measured offset
    pub control_gain: f64,
    /// Gain applied to the predicted drift increment
    pub prediction_gain: f64,
    /// Samples required before predictions are used
    pub min_points_for_inference: usize,
    /// Newest samples used in the kernel solve
    pub inference_window: usize,
    /// Nominal time between frames in seconds
    pub frame_interval_s: f64,
    /// Squared-exponential length scale in seconds
    pub se_length_scale: f64,
    /// Squared-exponential signal variance in px^2
    pub se_signal_variance: f64,
    /// Periodic kernel length scale (dimensionless)
    pub periodic_length_scale: f64,
    /// Periodic kernel signal variance in px^2
    pub periodic_signal_variance: f64,
    /// Periodic error period in seconds
    pub period_length: f64,
    /// Measurement noise variance in px^2
    pub noise_variance: f64,
    /// Re-estimate the period from the drift spectrum
    pub compute_period: bool,
    #[serde(flatten)]
    pub limits: MoveLimits,
}

impl Default for GaussianProcessParams {
    fn default() -> Self {
        Self {
            control_gain: 0.7,
            prediction_gain: 0.5,
            min_points_for_inference: 25,
            inference_window: 96,
            frame_interval_s: 2.0,
            se_length_scale: 500.0,
            se_signal_variance: 10.0,
            periodic_length_scale: 1.0,
            periodic_signal_variance: 10.0,
            period_length: 200.0,
            noise_variance: 1.0,
            compute_period: true,
            limits: MoveLimits::default(),
        }
    }
}

impl GaussianProcessParams {
    pub fn validate(&self) -> GuideResult<()> {
        let invalid = |what: &str, value: f64| -> GuideResult<()> {
            Err(GuideError::InvalidConfig(format!(
                "{what} out of range: {value}"
            )))
        };
        if !(0.0..=1.0).contains(&self.control_gain) {
            return invalid("control gain", self.control_gain);
        }
        if !(0.0..=1.0).contains(&self.prediction_gain) {
            return invalid("prediction gain", self.prediction_gain);
        }
        if self.min_points_for_inference < 2 || self.min_points_for_inference > MAX_GP_HISTORY {
            return invalid(
                "minimum points for inference",
                self.min_points_for_inference as f64,
            );
        }
        if self.inference_window < 2 || self.inference_window > MAX_GP_HISTORY {
            return invalid("inference window", self.inference_window as f64);
        }
        for (what, value) in [
            ("frame interval", self.frame_interval_s),
            ("SE length scale", self.se_length_scale),
            ("SE signal variance", self.se_signal_variance),
            ("periodic length scale", self.periodic_length_scale),
            ("periodic signal variance", self.periodic_signal_variance),
            ("period length", self.period_length),
            ("noise variance", self.noise_variance),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return invalid(what, value);
            }
        }
        self.limits.validate()
    }
}

#[derive(Debug, Clone)]
pub struct GaussianProcess {
    params: GaussianProcessParams,
    /// Reconstructed drift indexed by time in seconds
    drift: AxisStats,
    /// Sum of every correction issued since reset
    accumulated: f64,
    frame_count: u64,
    period: f64,
    last_prediction: f64,
}

impl GaussianProcess {
    pub fn new(params: GaussianProcessParams) -> GuideResult<Self> {
        params.validate()?;
        Ok(Self {
            period: params.period_length,
            params,
            drift: AxisStats::new(MAX_GP_HISTORY),
            accumulated: 0.0,
            frame_count: 0,
            last_prediction: 0.0,
        })
    }

    pub fn params(&self) -> &GaussianProcessParams {
        &self.params
    }

    /// Predicted drift increment over the next frame, in pixels.
    pub fn last_prediction(&self) -> f64 {
        self.last_prediction
    }

    /// Period currently used by the periodic kernel, in seconds.
    pub fn period(&self) -> f64 {
        self.period
    }

    pub fn sample_count(&self) -> usize {
        self.drift.count()
    }

    fn now(&self) -> f64 {
        self.frame_count as f64 * self.params.frame_interval_s
    }

    fn kernel(&self, tau: f64) -> f64 {
        let p = &self.params;
        let se = p.se_signal_variance * (-tau * tau / (2.0 * p.se_length_scale.powi(2))).exp();
        let s = (PI * tau / self.period).sin();
        let periodic =
            p.periodic_signal_variance * (-2.0 * s * s / p.periodic_length_scale.powi(2)).exp();
        se + periodic
    }

    /// Dominant period of the detrended drift, from the peak of a Hann
    /// windowed spectrum refined by parabolic interpolation.
    fn estimate_period(&self) -> Option<f64> {
        let n = self.drift.count();
        if n < 2 * self.params.min_points_for_inference {
            return None;
        }
        let (slope, intercept) = self.drift.linear_fit();
        let mut buffer: Vec<Complex64> = self
            .drift
            .points()
            .enumerate()
            .map(|(i, (t, v))| {
                let window = 0.5 * (1.0 - (2.0 * PI * i as f64 / (n - 1) as f64).cos());
                Complex64::new((v - (slope * t + intercept)) * window, 0.0)
            })
            .collect();

        let mut planner = FftPlanner::<f64>::new();
        let fft = planner.plan_fft_forward(n);
        fft.process(&mut buffer);

        let magnitude: Vec<f64> = buffer[..n / 2].iter().map(|c| c.norm()).collect();
        // At least two full cycles must fit in the history.
        let (peak, peak_mag) = magnitude
            .iter()
            .enumerate()
            .skip(2)
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(k, &m)| (k, m))?;
        if peak_mag <= f64::EPSILON || peak + 1 >= magnitude.len() {
            return None;
        }
        let (left, right) = (magnitude[peak - 1], magnitude[peak + 1]);
        let denom = left - 2.0 * peak_mag + right;
        let offset = if denom.abs() > f64::EPSILON {
            (0.5 * (left - right) / denom).clamp(-0.5, 0.5)
        } else {
            0.0
        };
        let span = n as f64 * self.params.frame_interval_s;
        Some(span / (peak as f64 + offset))
    }

    /// Posterior mean of the detrended drift at each query time.
    fn residual_mean(
        &self,
        times: &[f64],
        residuals: &[f64],
        queries: [f64; 2],
    ) -> Option<[f64; 2]> {
        let n = times.len();
        let noise = self.params.noise_variance;
        let gram = DMatrix::from_fn(n, n, |i, j| {
            self.kernel(times[i] - times[j]) + if i == j { noise } else { 0.0 }
        });
        let cholesky = gram.cholesky()?;
        let alpha = cholesky.solve(&DVector::from_column_slice(residuals));
        let mean = |q: f64| -> f64 {
            times
                .iter()
                .zip(alpha.iter())
                .map(|(&t, &a)| self.kernel(q - t) * a)
                .sum()
        };
        Some([mean(queries[0]), mean(queries[1])])
    }

    /// Predicted drift change between the newest sample and one frame later.
    fn predict_increment(&self) -> f64 {
        let (slope, intercept) = self.drift.linear_fit();
        let dt = self.params.frame_interval_s;
        let trend_increment = slope * dt;

        let count = self.drift.count();
        let skip = count.saturating_sub(self.params.inference_window);
        let (times, residuals): (Vec<f64>, Vec<f64>) = self
            .drift
            .points()
            .skip(skip)
            .map(|(t, v)| (t, v - (slope * t + intercept)))
            .unzip();
        let Some(&t_last) = times.last() else {
            return trend_increment;
        };
        match self.residual_mean(&times, &residuals, [t_last, t_last + dt]) {
            Some([now, next]) => trend_increment + (next - now),
            None => {
                log::warn!(
                    "Gaussian Process kernel matrix is not positive definite, using trend only"
                );
                trend_increment
            }
        }
    }
}

impl GuideAlgorithm for GaussianProcess {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::GaussianProcess
    }

    fn result(&mut self, input: f64) -> f64 {
        if is_null_input(input) {
            return 0.0;
        }
        let t = self.now();
        self.drift.add(t, input + self.accumulated);
        self.frame_count += 1;

        if self.params.compute_period {
            if let Some(period) = self.estimate_period() {
                if (period - self.period).abs() > 1e-9 {
                    log::trace!("Gaussian Process period estimate {period:.1}s");
                }
                self.period = period;
            }
        }

        let mut output = self.params.control_gain * input;
        if self.drift.count() >= self.params.min_points_for_inference {
            self.last_prediction = self.predict_increment();
            output += self.params.prediction_gain * self.last_prediction;
        }

        let output = self.params.limits.apply(output);
        self.accumulated += output;
        output
    }

    fn reset(&mut self) {
        self.drift.clear();
        self.accumulated = 0.0;
        self.frame_count = 0;
        self.period = self.params.period_length;
        self.last_prediction = 0.0;
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
        let p = &self.params;
        format!(
            "{}, Control gain = {:.3}, Prediction gain = {:.3}, Min points = {}, \
             Period = {:.1}, Compute period = {}, Minimum move = {:.3}, Maximum move = {:.3}",
            self.kind(),
            p.control_gain,
            p.prediction_gain,
            p.min_points_for_inference,
            p.period_length,
            p.compute_period,
            p.limits.min_move,
            p.limits.max_move
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Closed-loop run where the star drifts by `drift(frame)` and every
    /// correction is applied exactly.
    fn run_closed_loop(gp: &mut GaussianProcess, frames: usize, drift: impl Fn(usize) -> f64) {
        let mut corrected = 0.0;
        for k in 1..=frames {
            let offset = drift(k) - corrected;
            corrected += gp.result(offset);
        }
    }

    #[test]
    fn test_proportional_before_inference() {
        let mut gp = GaussianProcess::new(GaussianProcessParams::default()).unwrap();
        assert_relative_eq!(gp.result(1.0), 0.7, epsilon = 1e-12);
        assert_eq!(gp.last_prediction(), 0.0);
    }

    #[test]
    fn test_linear_drift_prediction() {
        let mut gp = GaussianProcess::new(GaussianProcessParams {
            compute_period: false,
            ..GaussianProcessParams::default()
        })
        .unwrap();
        run_closed_loop(&mut gp, 40, |k| 0.1 * k as f64);
        assert_relative_eq!(gp.last_prediction(), 0.1, epsilon = 1e-6);
    }

    #[test]
    fn test_period_estimate_from_sine() {
        let mut gp = GaussianProcess::new(GaussianProcessParams::default()).unwrap();
        let dt = gp.params().frame_interval_s;
        let sine = |k: usize| 2.0 * (2.0 * PI * k as f64 * dt / 60.0).sin();
        run_closed_loop(&mut gp, 300, sine);
        let period = gp.period();
        assert!((period - 60.0).abs() < 6.0, "period {period}");
    }

    #[test]
    fn test_reset_restores_configured_period() {
        let mut gp = GaussianProcess::new(GaussianProcessParams::default()).unwrap();
        let dt = gp.params().frame_interval_s;
        let sine = |k: usize| 2.0 * (2.0 * PI * k as f64 * dt / 60.0).sin();
        run_closed_loop(&mut gp, 80, sine);
        gp.reset();
        assert_eq!(gp.sample_count(), 0);
        assert_eq!(gp.period(), 200.0);
    }

    #[test]
    fn test_rejects_bad_gain() {
        let params = GaussianProcessParams {
            control_gain: 1.5,
            ..GaussianProcessParams::default()
        };
        assert!(GaussianProcess::new(params).is_err());
    }
}
