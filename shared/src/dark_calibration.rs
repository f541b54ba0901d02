//! Dark-frame subtraction and defect-pixel repair.
//!
//! Frames coming off the guide camera are cleaned before star detection:
//! a master dark matching the exposure is subtracted, then pixels listed in
//! the [`DefectMap`] are replaced by the median of their good neighbours.

use crate::camera_interface::{Frame, FrameMetadata};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Dark calibration collaborator invoked by the capture pipeline.
pub trait DarkCalibration: Send + Sync {
    /// Subtract a matching dark from `image`.
    fn subtract_dark(&self, image: &mut Array2<u16>, metadata: &FrameMetadata);

    /// Replace every defective pixel with an estimate from its neighbours.
    fn remove_defects(&self, image: &mut Array2<u16>, defect_map: &DefectMap);

    /// Defect map to apply after dark subtraction, if any.
    fn defect_map(&self) -> Option<&DefectMap>;

    /// Run the full correction on a frame: dark first, then defects.
    fn apply(&self, frame: &mut Frame) {
        self.subtract_dark(&mut frame.image, &frame.metadata);
        if let Some(map) = self.defect_map() {
            self.remove_defects(&mut frame.image, map);
        }
    }
}

/// Defective pixel list for a specific sensor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefectMap {
    /// Sensor or camera identifier the map was built for
    pub sensor: String,

    /// Defective pixel coordinates (x, y)
    pub pixels: Vec<(usize, usize)>,
}

impl DefectMap {
    pub fn new(sensor: impl Into<String>) -> Self {
        Self {
            sensor: sensor.into(),
            pixels: Vec::new(),
        }
    }

    pub fn add_pixel(&mut self, x: usize, y: usize) {
        self.pixels.push((x, y));
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    pub fn as_coordinate_set(&self) -> HashSet<(usize, usize)> {
        self.pixels.iter().copied().collect()
    }

    /// Build a map of hot pixels from a master dark: every pixel more than
    /// `threshold_sigma` standard deviations above the frame mean.
    pub fn from_master_dark(
        sensor: impl Into<String>,
        dark: &Array2<u16>,
        threshold_sigma: f64,
    ) -> Self {
        let mut map = Self::new(sensor);
        let n = dark.len() as f64;
        if n < 2.0 {
            return map;
        }
        let mean = dark.iter().map(|&v| v as f64).sum::<f64>() / n;
        let variance = dark.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / (n - 1.0);
        let threshold = mean + threshold_sigma * variance.sqrt();
        for ((y, x), &value) in dark.indexed_iter() {
            if value as f64 > threshold {
                map.add_pixel(x, y);
            }
        }
        map
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), std::io::Error> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, std::io::Error> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

/// Master darks keyed by exposure, plus an optional defect map.
#[derive(Debug, Clone, Default)]
pub struct DarkLibrary {
    darks: Vec<(Duration, Array2<u16>)>,
    defect_map: Option<DefectMap>,
}

impl DarkLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Average a stack of dark frames into a master dark for `exposure`.
    pub fn add_dark_stack(&mut self, exposure: Duration, frames: &[Array2<u16>]) {
        let Some(first) = frames.first() else {
            return;
        };
        let mut sum = Array2::<f64>::zeros(first.dim());
        for frame in frames.iter().filter(|f| f.dim() == first.dim()) {
            sum.zip_mut_with(frame, |acc, &v| *acc += v as f64);
        }
        let n = frames.iter().filter(|f| f.dim() == first.dim()).count() as f64;
        let master = sum.mapv(|v| (v / n).round() as u16);
        self.darks.retain(|(e, _)| *e != exposure);
        self.darks.push((exposure, master));
        log::info!(
            "Added master dark for {:?} from {} frames",
            exposure,
            frames.len()
        );
    }

    pub fn set_defect_map(&mut self, map: DefectMap) {
        self.defect_map = Some(map);
    }

    pub fn num_darks(&self) -> usize {
        self.darks.len()
    }

    /// Dark whose exposure is closest to `exposure`.
    pub fn closest_dark(&self, exposure: Duration) -> Option<&Array2<u16>> {
        self.darks
            .iter()
            .min_by_key(|(e, _)| e.as_millis().abs_diff(exposure.as_millis()))
            .map(|(_, dark)| dark)
    }
}

impl DarkCalibration for DarkLibrary {
    fn subtract_dark(&self, image: &mut Array2<u16>, metadata: &FrameMetadata) {
        let Some(dark) = self.closest_dark(metadata.exposure) else {
            return;
        };
        if dark.dim() != image.dim() {
            log::warn!(
                "Dark size {:?} does not match frame {:?}; skipping subtraction",
                dark.dim(),
                image.dim()
            );
            return;
        }
        match &metadata.subframe {
            Some(roi) => {
                for row in roi.min_row..=roi.max_row.min(image.nrows() - 1) {
                    for col in roi.min_col..=roi.max_col.min(image.ncols() - 1) {
                        image[[row, col]] = image[[row, col]].saturating_sub(dark[[row, col]]);
                    }
                }
            }
            None => image.zip_mut_with(dark, |v, &d| *v = v.saturating_sub(d)),
        }
    }

    fn remove_defects(&self, image: &mut Array2<u16>, defect_map: &DefectMap) {
        let defects = defect_map.as_coordinate_set();
        let (height, width) = image.dim();
        for &(x, y) in &defect_map.pixels {
            if x >= width || y >= height {
                continue;
            }
            let mut neighbours: Vec<u16> = Vec::with_capacity(8);
            for ny in y.saturating_sub(1)..=(y + 1).min(height - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(width - 1) {
                    if (nx, ny) != (x, y) && !defects.contains(&(nx, ny)) {
                        neighbours.push(image[[ny, nx]]);
                    }
                }
            }
            if neighbours.is_empty() {
                continue;
            }
            neighbours.sort_unstable();
            image[[y, x]] = neighbours[neighbours.len() / 2];
        }
    }

    fn defect_map(&self) -> Option<&DefectMap> {
        self.defect_map.as_ref()
    }
}
