//! Session context: the set of devices a guiding session drives.

use shared::camera_interface::Camera;
use shared::dark_calibration::DarkCalibration;
use shared::mount_interface::{Mount, StepGuider};
use std::sync::Arc;

/// Devices for one guiding session.
///
/// Handed to the guider at construction and cloned into each worker lane.
/// The control thread never calls device methods through it directly.
#[derive(Clone)]
pub struct Equipment {
    pub camera: Arc<dyn Camera>,
    pub mount: Arc<dyn Mount>,
    pub step_guider: Option<Arc<dyn StepGuider>>,
    pub dark_calibration: Option<Arc<dyn DarkCalibration>>,
}

impl Equipment {
    pub fn new(camera: Arc<dyn Camera>, mount: Arc<dyn Mount>) -> Self {
        Self {
            camera,
            mount,
            step_guider: None,
            dark_calibration: None,
        }
    }

    pub fn with_step_guider(mut self, step_guider: Arc<dyn StepGuider>) -> Self {
        self.step_guider = Some(step_guider);
        self
    }

    pub fn with_dark_calibration(mut self, dark: Arc<dyn DarkCalibration>) -> Self {
        self.dark_calibration = Some(dark);
        self
    }

    pub fn has_step_guider(&self) -> bool {
        self.step_guider.is_some()
    }

    /// One-line description for logs and settings summaries.
    pub fn describe(&self) -> String {
        let mut parts = vec![
            format!("camera={}", self.camera.name()),
            format!("mount={}", self.mount.name()),
        ];
        if let Some(ao) = &self.step_guider {
            parts.push(format!("ao={}", ao.name()));
        }
        if self.dark_calibration.is_some() {
            parts.push("darks=on".to_string());
        }
        parts.join(", ")
    }
}
