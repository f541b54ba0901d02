//! Windowed statistics over a single guide axis.

use std::collections::VecDeque;

/// Rolling window of `(time, value)` samples with median, linear fit and
/// RMS helpers. A window of 0 keeps every sample.
#[derive(Debug, Clone, Default)]
pub struct AxisStats {
    window: usize,
    samples: VecDeque<(f64, f64)>,
}

impl AxisStats {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    pub fn add(&mut self, time: f64, value: f64) {
        self.samples.push_back((time, value));
        if self.window > 0 {
            while self.samples.len() > self.window {
                self.samples.pop_front();
            }
        }
    }

    pub fn remove_oldest(&mut self) {
        self.samples.pop_front();
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().map(|&(_, v)| v)
    }

    pub fn points(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.samples.iter().copied()
    }

    pub fn last(&self) -> Option<f64> {
        self.samples.back().map(|&(_, v)| v)
    }

    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.values().sum::<f64>() / self.samples.len() as f64
    }

    pub fn median(&self) -> f64 {
        let mut values: Vec<f64> = self.values().collect();
        if values.is_empty() {
            return 0.0;
        }
        values.sort_by(|a, b| a.total_cmp(b));
        let mid = values.len() / 2;
        if values.len() % 2 == 0 {
            (values[mid - 1] + values[mid]) / 2.0
        } else {
            values[mid]
        }
    }

    /// Root mean square about zero.
    pub fn rms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        (self.values().map(|v| v * v).sum::<f64>() / self.samples.len() as f64).sqrt()
    }

    /// Standard deviation about the mean.
    pub fn sigma(&self) -> f64 {
        let n = self.samples.len();
        if n < 2 {
            return 0.0;
        }
        let mean = self.mean();
        (self.values().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64).sqrt()
    }

    pub fn max_abs(&self) -> f64 {
        self.values().fold(0.0, |acc, v| acc.max(v.abs()))
    }

    /// Least-squares fit `value = slope * time + intercept`.
    ///
    /// Returns `(0.0, mean)` when fewer than two distinct times are present.
    pub fn linear_fit(&self) -> (f64, f64) {
        let n = self.samples.len() as f64;
        if self.samples.len() < 2 {
            return (0.0, self.mean());
        }
        let mean_t = self.samples.iter().map(|&(t, _)| t).sum::<f64>() / n;
        let mean_v = self.mean();
        let mut sxx = 0.0;
        let mut sxy = 0.0;
        for &(t, v) in &self.samples {
            sxx += (t - mean_t).powi(2);
            sxy += (t - mean_t) * (v - mean_v);
        }
        if sxx <= f64::EPSILON {
            return (0.0, mean_v);
        }
        let slope = sxy / sxx;
        (slope, mean_v - slope * mean_t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_window_drops_oldest() {
        let mut stats = AxisStats::new(3);
        for i in 0..5 {
            stats.add(i as f64, i as f64);
        }
        assert_eq!(stats.count(), 3);
        assert_eq!(stats.values().collect::<Vec<_>>(), vec![2.0, 3.0, 4.0]);
        assert_eq!(stats.median(), 3.0);
    }

    #[test]
    fn test_linear_fit_recovers_line() {
        let mut stats = AxisStats::new(0);
        for i in 0..10 {
            let t = i as f64;
            stats.add(t, 0.25 * t - 1.0);
        }
        let (slope, intercept) = stats.linear_fit();
        assert_relative_eq!(slope, 0.25, epsilon = 1e-12);
        assert_relative_eq!(intercept, -1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_rms_and_sigma() {
        let mut stats = AxisStats::new(0);
        for v in [1.0, -1.0, 1.0, -1.0] {
            stats.add(0.0, v);
        }
        assert_relative_eq!(stats.rms(), 1.0);
        assert_relative_eq!(stats.sigma(), 1.0);
        assert_relative_eq!(stats.max_abs(), 1.0);
        assert_eq!(stats.linear_fit(), (0.0, 0.0));
    }
}
