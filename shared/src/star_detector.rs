//! Guide-star detection and tracking.
//!
//! The guiding core only depends on the [`StarDetector`] trait. The
//! [`CentroidStarDetector`] implementation finds stars by thresholding a
//! small window and computing an intensity-weighted centroid.

use crate::image_proc::centroid::{border_background, centroid_in_window};
use crate::image_proc::AABB;
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

/// Star location for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StarPosition {
    /// X position in full-frame pixels
    pub x: f64,
    /// Y position in full-frame pixels
    pub y: f64,
    /// Detection quality (signal-to-noise ratio)
    pub quality: f64,
    /// False when the measurement should not be trusted
    pub valid: bool,
}

impl StarPosition {
    pub fn new(x: f64, y: f64, quality: f64) -> Self {
        Self {
            x,
            y,
            quality,
            valid: true,
        }
    }

    /// Position with no measurement behind it.
    pub fn invalid() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            quality: 0.0,
            valid: false,
        }
    }

    pub fn distance_to(&self, other: &StarPosition) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Star detection collaborator used by the guider.
pub trait StarDetector: Send {
    /// Find the star inside `roi`.
    fn find_star(&self, image: &ArrayView2<u16>, roi: &AABB) -> Option<StarPosition>;

    /// Re-measure a star near its last known position.
    fn track_star(&self, image: &ArrayView2<u16>, last: &StarPosition) -> Option<StarPosition>;

    /// True when the star at `position` can no longer be measured.
    fn is_star_lost(&self, image: &ArrayView2<u16>, position: &StarPosition) -> bool;

    /// Pick the best isolated, unsaturated star in the whole frame.
    fn auto_select(&self, image: &ArrayView2<u16>) -> Option<StarPosition>;
}

/// Tuning for [`CentroidStarDetector`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StarDetectorConfig {
    /// Half size of the tracking window in pixels
    pub search_radius: usize,
    /// Detection threshold in background sigmas
    pub threshold_sigma: f64,
    /// Minimum SNR for a usable star
    pub min_snr: f64,
    /// Raw pixel value treated as saturated
    pub saturation: u16,
    /// Stars closer than this to the frame edge are not auto-selected
    pub edge_margin: usize,
    /// Maximum number of candidates considered by auto-selection
    pub max_candidates: usize,
}

impl Default for StarDetectorConfig {
    fn default() -> Self {
        Self {
            search_radius: 15,
            threshold_sigma: 5.0,
            min_snr: 6.0,
            saturation: 65000,
            edge_margin: 20,
            max_candidates: 50,
        }
    }
}

/// Threshold-and-centroid star detector.
#[derive(Debug, Clone, Default)]
pub struct CentroidStarDetector {
    config: StarDetectorConfig,
}

impl CentroidStarDetector {
    pub fn new(config: StarDetectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StarDetectorConfig {
        &self.config
    }

    fn measure(&self, image: &ArrayView2<u16>, roi: &AABB) -> Option<StarPosition> {
        let (result, snr) = centroid_in_window(image, roi, self.config.threshold_sigma)?;
        if snr < self.config.min_snr {
            log::debug!("Rejecting star at ({:.1}, {:.1}): SNR {snr:.1}", result.x, result.y);
            return None;
        }
        Some(StarPosition::new(result.x, result.y, snr))
    }

    fn window(&self, image: &ArrayView2<u16>, x: f64, y: f64) -> Option<AABB> {
        let (height, width) = image.dim();
        AABB::around(x, y, self.config.search_radius, height, width)
    }

    fn is_saturated(&self, image: &ArrayView2<u16>, position: &StarPosition) -> bool {
        let (height, width) = image.dim();
        AABB::around(position.x, position.y, 2, height, width)
            .map(|roi| {
                roi.extract_from_frame(image)
                    .iter()
                    .any(|&v| v >= self.config.saturation)
            })
            .unwrap_or(false)
    }
}

impl StarDetector for CentroidStarDetector {
    fn find_star(&self, image: &ArrayView2<u16>, roi: &AABB) -> Option<StarPosition> {
        let coarse = self.measure(image, roi)?;
        // Re-center the window on the coarse fit so the background ring is clean.
        let refined_roi = self.window(image, coarse.x, coarse.y)?;
        self.measure(image, &refined_roi).or(Some(coarse))
    }

    fn track_star(&self, image: &ArrayView2<u16>, last: &StarPosition) -> Option<StarPosition> {
        let roi = self.window(image, last.x, last.y)?;
        self.find_star(image, &roi)
    }

    fn is_star_lost(&self, image: &ArrayView2<u16>, position: &StarPosition) -> bool {
        match self.track_star(image, position) {
            Some(found) => found.distance_to(position) > self.config.search_radius as f64,
            None => true,
        }
    }

    fn auto_select(&self, image: &ArrayView2<u16>) -> Option<StarPosition> {
        let (height, width) = image.dim();
        let margin = self.config.edge_margin.max(1);
        if height <= 2 * margin + 2 || width <= 2 * margin + 2 {
            return None;
        }

        let as_f64: Array2<f64> = image.mapv(|v| v as f64);
        let (background, sigma) = border_background(&as_f64.view());
        let threshold = background + self.config.threshold_sigma * sigma.max(1.0);

        let mut candidates: Vec<(usize, usize, u16)> = Vec::new();
        for row in margin..height - margin {
            for col in margin..width - margin {
                let value = image[[row, col]];
                if (value as f64) <= threshold {
                    continue;
                }
                let is_peak = (row - 1..=row + 1).all(|r| {
                    (col - 1..=col + 1).all(|c| (r == row && c == col) || image[[r, c]] < value)
                });
                if is_peak {
                    candidates.push((row, col, value));
                }
            }
        }
        candidates.sort_by(|a, b| b.2.cmp(&a.2));
        candidates.truncate(self.config.max_candidates);

        let isolation = 2.0 * self.config.search_radius as f64;
        let mut best: Option<StarPosition> = None;
        for (i, &(row, col, value)) in candidates.iter().enumerate() {
            let crowded = candidates.iter().enumerate().any(|(j, &(r, c, v))| {
                let dist =
                    ((r as f64 - row as f64).powi(2) + (c as f64 - col as f64).powi(2)).sqrt();
                i != j && dist < isolation && v as f64 > 0.5 * value as f64
            });
            if crowded {
                continue;
            }
            let Some(roi) = self.window(image, col as f64, row as f64) else {
                continue;
            };
            let Some(star) = self.find_star(image, &roi) else {
                continue;
            };
            if self.is_saturated(image, &star) {
                continue;
            }
            if best.map_or(true, |b| star.quality > b.quality) {
                best = Some(star);
            }
        }

        if let Some(star) = &best {
            log::info!(
                "Auto-selected star at ({:.1}, {:.1}) SNR {:.1}",
                star.x,
                star.y,
                star.quality
            );
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn add_gaussian(image: &mut Array2<u16>, x: f64, y: f64, peak: f64, sigma: f64) {
        for ((r, c), v) in image.indexed_iter_mut() {
            let d2 = (c as f64 - x).powi(2) + (r as f64 - y).powi(2);
            let add = peak * (-d2 / (2.0 * sigma * sigma)).exp();
            *v = (*v as f64 + add).min(65535.0) as u16;
        }
    }

    fn noisy_frame(seed: u64) -> Array2<u16> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Array2::from_shape_fn((120, 160), |_| 200 + rng.gen_range(0..10))
    }

    #[test]
    fn test_track_star_follows_motion() {
        let mut image = noisy_frame(1);
        add_gaussian(&mut image, 70.3, 50.7, 3000.0, 1.5);
        let detector = CentroidStarDetector::default();

        let last = StarPosition::new(68.0, 52.0, 0.0);
        let found = detector.track_star(&image.view(), &last).unwrap();
        assert_abs_diff_eq!(found.x, 70.3, epsilon = 0.1);
        assert_abs_diff_eq!(found.y, 50.7, epsilon = 0.1);
        assert!(found.valid);
        assert!(!detector.is_star_lost(&image.view(), &found));
    }

    #[test]
    fn test_blank_frame_loses_star() {
        let image = noisy_frame(2);
        let detector = CentroidStarDetector::default();
        let last = StarPosition::new(70.0, 50.0, 20.0);
        assert!(detector.track_star(&image.view(), &last).is_none());
        assert!(detector.is_star_lost(&image.view(), &last));
    }

    #[test]
    fn test_auto_select_prefers_unsaturated_isolated_star() {
        let mut image = noisy_frame(3);
        add_gaussian(&mut image, 40.0, 40.0, 70000.0, 1.5);
        add_gaussian(&mut image, 110.0, 70.0, 4000.0, 1.5);
        let detector = CentroidStarDetector::default();

        let star = detector.auto_select(&image.view()).unwrap();
        assert_abs_diff_eq!(star.x, 110.0, epsilon = 0.2);
        assert_abs_diff_eq!(star.y, 70.0, epsilon = 0.2);
    }
}
