//! Axis-aligned bounding boxes used for subframes and star search windows.

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

/// Axis-Aligned Bounding Box for 2D image regions.
///
/// Represents a rectangular region in image coordinates (row, column) using
/// inclusive bounds. Used for camera subframes and for the search window the
/// star detector looks at around the last known star position.
///
/// # Coordinate System
/// - **Rows (y-axis)**: Increase downward from top of image
/// - **Columns (x-axis)**: Increase rightward from left of image
/// - **Bounds**: Both min and max coordinates are inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AABB {
    /// Minimum row (y) coordinate (inclusive)
    pub min_row: usize,
    /// Minimum column (x) coordinate (inclusive)
    pub min_col: usize,
    /// Maximum row (y) coordinate (inclusive)
    pub max_row: usize,
    /// Maximum column (x) coordinate (inclusive)
    pub max_col: usize,
}

impl AABB {
    /// Create an AABB from explicit coordinate bounds.
    pub fn from_coords(min_row: usize, min_col: usize, max_row: usize, max_col: usize) -> Self {
        Self {
            min_row,
            min_col,
            max_row,
            max_col,
        }
    }

    /// Full-frame box for an image of the given shape `(rows, cols)`.
    pub fn full_frame(height: usize, width: usize) -> Self {
        Self::from_coords(0, 0, height.saturating_sub(1), width.saturating_sub(1))
    }

    /// Square box of `half_size` pixels around a sub-pixel center, clipped to the frame.
    ///
    /// Returns `None` when the center lies outside the frame.
    pub fn around(x: f64, y: f64, half_size: usize, height: usize, width: usize) -> Option<Self> {
        if !x.is_finite() || !y.is_finite() || x < 0.0 || y < 0.0 {
            return None;
        }
        let col = x.round() as usize;
        let row = y.round() as usize;
        if row >= height || col >= width {
            return None;
        }
        Some(Self::from_coords(
            row.saturating_sub(half_size),
            col.saturating_sub(half_size),
            (row + half_size).min(height - 1),
            (col + half_size).min(width - 1),
        ))
    }

    /// Width of the box in pixels.
    pub fn width(&self) -> usize {
        if self.is_valid() {
            self.max_col - self.min_col + 1
        } else {
            0
        }
    }

    /// Height of the box in pixels.
    pub fn height(&self) -> usize {
        if self.is_valid() {
            self.max_row - self.min_row + 1
        } else {
            0
        }
    }

    /// Check if bounds are ordered.
    pub fn is_valid(&self) -> bool {
        self.min_row <= self.max_row && self.min_col <= self.max_col
    }

    /// True when the pixel `(row, col)` is inside the box.
    pub fn contains(&self, row: usize, col: usize) -> bool {
        row >= self.min_row && row <= self.max_row && col >= self.min_col && col <= self.max_col
    }

    /// Center of the box as `(x, y)`.
    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_col + self.max_col) as f64 / 2.0,
            (self.min_row + self.max_row) as f64 / 2.0,
        )
    }

    /// Intersection with a frame of the given shape, or `None` if disjoint.
    pub fn clip_to(&self, height: usize, width: usize) -> Option<Self> {
        if !self.is_valid() || self.min_row >= height || self.min_col >= width {
            return None;
        }
        Some(Self::from_coords(
            self.min_row,
            self.min_col,
            self.max_row.min(height - 1),
            self.max_col.min(width - 1),
        ))
    }

    /// Copy the region out of a frame. The box must already be inside the frame.
    pub fn extract_from_frame<T: Clone>(&self, frame: &ArrayView2<T>) -> Array2<T> {
        frame
            .slice(ndarray::s![
                self.min_row..=self.max_row,
                self.min_col..=self.max_col
            ])
            .to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_around_clips_at_edges() {
        let roi = AABB::around(2.2, 1.6, 5, 100, 80).unwrap();
        assert_eq!(roi.min_row, 0);
        assert_eq!(roi.min_col, 0);
        assert_eq!(roi.max_row, 7);
        assert_eq!(roi.max_col, 7);

        let roi = AABB::around(79.0, 99.0, 4, 100, 80).unwrap();
        assert_eq!(roi.max_row, 99);
        assert_eq!(roi.max_col, 79);
        assert_eq!(roi.width(), 5);
    }

    #[test]
    fn test_around_rejects_outside() {
        assert!(AABB::around(-1.0, 3.0, 4, 10, 10).is_none());
        assert!(AABB::around(3.0, 10.0, 4, 10, 10).is_none());
        assert!(AABB::around(f64::NAN, 3.0, 4, 10, 10).is_none());
    }

    #[test]
    fn test_extract_and_clip() {
        let frame = Array2::from_shape_fn((10, 12), |(r, c)| (r * 100 + c) as u16);
        let roi = AABB::from_coords(8, 10, 20, 20).clip_to(10, 12).unwrap();
        assert_eq!(roi.max_row, 9);
        assert_eq!(roi.max_col, 11);
        let sub = roi.extract_from_frame(&frame.view());
        assert_eq!(sub.dim(), (2, 2));
        assert_eq!(sub[[0, 0]], 810);
        assert!(AABB::from_coords(10, 0, 12, 3).clip_to(10, 12).is_none());
    }
}
