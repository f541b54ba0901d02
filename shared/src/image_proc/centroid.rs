//! Centroid calculation for guide-star measurement.
//!
//! Computes intensity-weighted centers and second moments inside a small
//! search window, after removing a local background estimate.

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use super::aabb::AABB;

/// Result from centroid calculation containing position and shape properties
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CentroidResult {
    /// Centroid x-coordinate relative to sub-image origin
    pub x: f64,
    /// Centroid y-coordinate relative to sub-image origin
    pub y: f64,
    /// Total flux (sum of background-subtracted intensities in mask)
    pub flux: f64,
    /// Second central moment μ₂₀ (variance in x-direction)
    pub m_xx: f64,
    /// Second central moment μ₀₂ (variance in y-direction)
    pub m_yy: f64,
    /// Second central moment μ₁₁ (covariance between x and y)
    pub m_xy: f64,
    /// Estimated object diameter in pixels
    pub diameter: f64,
    /// Peak background-subtracted value
    pub peak: f64,
    /// Number of pixels that contributed
    pub n_pixels: usize,
}

/// Calculate centroid and shape moments from image data and binary mask
///
/// # Arguments
///
/// * `image` - Sub-image containing the object
/// * `mask` - Binary mask (same size as image) with true where pixels belong to object
///
/// # Returns
///
/// CentroidResult with position relative to sub-image origin
pub fn compute_centroid_from_mask(
    image: &ArrayView2<f64>,
    mask: &ArrayView2<bool>,
) -> CentroidResult {
    assert_eq!(
        image.shape(),
        mask.shape(),
        "Image and mask must have same dimensions"
    );

    let mut m00 = 0.0;
    let mut m10 = 0.0;
    let mut m01 = 0.0;
    let mut m20 = 0.0;
    let mut m02 = 0.0;
    let mut m11 = 0.0;
    let mut peak = 0.0_f64;
    let mut n_pixels = 0;

    for ((row, col), &mask_val) in mask.indexed_iter() {
        if mask_val {
            let intensity = image[[row, col]];
            m00 += intensity;
            m10 += col as f64 * intensity;
            m01 += row as f64 * intensity;
            m20 += (col as f64).powi(2) * intensity;
            m02 += (row as f64).powi(2) * intensity;
            m11 += (row as f64) * (col as f64) * intensity;
            peak = peak.max(intensity);
            n_pixels += 1;
        }
    }

    if m00 < f64::EPSILON {
        return CentroidResult {
            x: 0.0,
            y: 0.0,
            flux: 0.0,
            m_xx: 0.0,
            m_yy: 0.0,
            m_xy: 0.0,
            diameter: 0.0,
            peak: 0.0,
            n_pixels,
        };
    }

    let x_centroid = m10 / m00;
    let y_centroid = m01 / m00;

    let mu20 = m20 / m00 - x_centroid.powi(2);
    let mu02 = m02 / m00 - y_centroid.powi(2);
    let mu11 = m11 / m00 - x_centroid * y_centroid;

    let sum = mu20 + mu02;
    let diff = mu20 - mu02;
    let discriminant = (4.0 * mu11.powi(2) + diff.powi(2)).sqrt();
    let lambda1 = (sum + discriminant) / 2.0;
    let lambda2 = (sum - discriminant) / 2.0;
    let diameter = 4.0 * ((lambda1 + lambda2).max(0.0) / 2.0).sqrt();

    CentroidResult {
        x: x_centroid,
        y: y_centroid,
        flux: m00,
        m_xx: mu20,
        m_yy: mu02,
        m_xy: mu11,
        diameter,
        peak,
        n_pixels,
    }
}

/// Background level and noise of a window, estimated from its border pixels.
///
/// Returns `(median, sigma)` where sigma is derived from the median absolute
/// deviation of the border.
pub fn border_background(window: &ArrayView2<f64>) -> (f64, f64) {
    let (rows, cols) = window.dim();
    if rows == 0 || cols == 0 {
        return (0.0, 0.0);
    }
    let mut border: Vec<f64> = window
        .indexed_iter()
        .filter(|&((r, c), _)| r == 0 || c == 0 || r == rows - 1 || c == cols - 1)
        .map(|(_, &v)| v)
        .collect();
    let median = median_in_place(&mut border);
    let mut deviations: Vec<f64> = border.iter().map(|v| (v - median).abs()).collect();
    let mad = median_in_place(&mut deviations);
    (median, 1.4826 * mad)
}

fn median_in_place(values: &mut [f64]) -> f64 {
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

/// Centroid of the brightest blob inside `roi`, in full-frame coordinates.
///
/// The local background is taken from the window border. Pixels more than
/// `threshold_sigma` noise sigmas above background form the mask. Returns the
/// centroid together with its signal-to-noise estimate, or `None` when
/// nothing rises above the threshold.
pub fn centroid_in_window(
    frame: &ArrayView2<u16>,
    roi: &AABB,
    threshold_sigma: f64,
) -> Option<(CentroidResult, f64)> {
    let (height, width) = frame.dim();
    let roi = roi.clip_to(height, width)?;
    let window: Array2<f64> = roi.extract_from_frame(frame).mapv(|v| v as f64);
    let (background, sigma) = border_background(&window.view());
    let noise = sigma.max(1.0);

    let subtracted = window.mapv(|v| (v - background).max(0.0));
    let mask = subtracted.mapv(|v| v > threshold_sigma * noise);
    if !mask.iter().any(|&m| m) {
        return None;
    }

    let mut result = compute_centroid_from_mask(&subtracted.view(), &mask.view());
    if result.flux <= 0.0 {
        return None;
    }
    result.x += roi.min_col as f64;
    result.y += roi.min_row as f64;

    let snr = result.flux / (noise * (result.n_pixels as f64).sqrt());
    Some((result, snr))
}
