use serde::{Deserialize, Serialize};
use std::fmt;

/// Guider states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuiderState {
    /// Equipment not connected
    Uninitialized,
    /// Connected, waiting for a guide star
    Selecting,
    /// Star selected and lock position set
    Selected,
    /// Calibrating the mount
    CalibratingPrimary,
    /// Calibrating the AO unit
    CalibratingSecondary,
    /// Calibration finished, ready to guide
    Calibrated,
    /// Closed-loop guiding
    Guiding,
    /// Worker lanes shut down
    Stopped,
}

impl GuiderState {
    /// States in which a lock position must exist.
    pub fn has_lock(self) -> bool {
        matches!(
            self,
            GuiderState::Selected
                | GuiderState::CalibratingPrimary
                | GuiderState::CalibratingSecondary
                | GuiderState::Calibrated
                | GuiderState::Guiding
        )
    }

    pub fn is_calibrating(self) -> bool {
        matches!(
            self,
            GuiderState::CalibratingPrimary | GuiderState::CalibratingSecondary
        )
    }

    pub fn is_connected(self) -> bool {
        !matches!(self, GuiderState::Uninitialized | GuiderState::Stopped)
    }
}

impl fmt::Display for GuiderState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            GuiderState::Uninitialized => "uninitialized",
            GuiderState::Selecting => "selecting",
            GuiderState::Selected => "selected",
            GuiderState::CalibratingPrimary => "calibrating mount",
            GuiderState::CalibratingSecondary => "calibrating AO",
            GuiderState::Calibrated => "calibrated",
            GuiderState::Guiding => "guiding",
            GuiderState::Stopped => "stopped",
        };
        write!(f, "{name}")
    }
}
