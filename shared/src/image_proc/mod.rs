//! Image processing helpers for guide frames.

pub mod aabb;
pub mod centroid;

pub use aabb::AABB;
pub use centroid::{centroid_in_window, compute_centroid_from_mask, CentroidResult};
