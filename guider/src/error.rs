use serde::Serialize;
use shared::mount_interface::GuideAxis;
use std::fmt;
use thiserror::Error;

/// Errors produced by the guiding core.
///
/// Device failures are turned into these values at the worker-lane boundary;
/// the state machines inspect them and decide on a transition.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GuideError {
    /// A capture or move exceeded its watchdog ceiling.
    #[error("{operation} timed out after {elapsed_ms} ms")]
    HardwareTimeout {
        /// What was running when the watchdog expired.
        operation: String,
        /// Elapsed time when the timeout was declared.
        elapsed_ms: u64,
    },

    /// A device reported a failure.
    #[error("hardware error: {0}")]
    HardwareError(String),

    /// The guide star could not be measured.
    #[error("guide star lost")]
    StarLost,

    /// The star did not move far enough along an axis during calibration.
    #[error("calibration failed: star moved only {distance:.1} px along {axis:?} (need {required:.1})")]
    CalibrationTooShort {
        /// Axis being calibrated.
        axis: GuideAxis,
        /// Distance covered.
        distance: f64,
        /// Minimum acceptable distance.
        required: f64,
    },

    /// Calibration finished but produced unusable results.
    #[error("calibration invalid: {0}")]
    CalibrationInvalid(String),

    /// Guiding requested without valid calibration data.
    #[error("guiding requires a valid calibration")]
    NotCalibrated,

    /// The mount was slewing while a correction was requested.
    #[error("mount is slewing")]
    SlewDetected,

    /// The operation was cancelled by a shutdown request.
    #[error("terminate requested")]
    TerminateRequested,

    /// Operation is not allowed in the current guider state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        /// Requested operation.
        operation: &'static str,
        /// Name of the state the guider was in.
        state: String,
    },

    /// Configuration validation failure.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Equipment is not connected.
    #[error("equipment not connected")]
    NotConnected,
}

/// Stable machine-readable reason codes for logs and callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ReasonCode {
    HardwareTimeout,
    HardwareError,
    StarLost,
    CalibrationTooShort,
    CalibrationInvalid,
    NotCalibrated,
    SlewDetected,
    TerminateRequested,
    InvalidState,
    InvalidConfig,
    NotConnected,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::HardwareTimeout => "HARDWARE_TIMEOUT",
            ReasonCode::HardwareError => "HARDWARE_ERROR",
            ReasonCode::StarLost => "STAR_LOST",
            ReasonCode::CalibrationTooShort => "CALIBRATION_TOO_SHORT",
            ReasonCode::CalibrationInvalid => "CALIBRATION_INVALID",
            ReasonCode::NotCalibrated => "NOT_CALIBRATED",
            ReasonCode::SlewDetected => "SLEW_DETECTED",
            ReasonCode::TerminateRequested => "TERMINATE_REQUESTED",
            ReasonCode::InvalidState => "INVALID_STATE",
            ReasonCode::InvalidConfig => "INVALID_CONFIG",
            ReasonCode::NotConnected => "NOT_CONNECTED",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl GuideError {
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            GuideError::HardwareTimeout { .. } => ReasonCode::HardwareTimeout,
            GuideError::HardwareError(_) => ReasonCode::HardwareError,
            GuideError::StarLost => ReasonCode::StarLost,
            GuideError::CalibrationTooShort { .. } => ReasonCode::CalibrationTooShort,
            GuideError::CalibrationInvalid(_) => ReasonCode::CalibrationInvalid,
            GuideError::NotCalibrated => ReasonCode::NotCalibrated,
            GuideError::SlewDetected => ReasonCode::SlewDetected,
            GuideError::TerminateRequested => ReasonCode::TerminateRequested,
            GuideError::InvalidState { .. } => ReasonCode::InvalidState,
            GuideError::InvalidConfig(_) => ReasonCode::InvalidConfig,
            GuideError::NotConnected => ReasonCode::NotConnected,
        }
    }

    /// True for watchdog and device failures.
    pub fn is_hardware(&self) -> bool {
        matches!(
            self,
            GuideError::HardwareTimeout { .. } | GuideError::HardwareError(_)
        )
    }
}

pub type GuideResult<T> = Result<T, GuideError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_and_codes() {
        let err = GuideError::HardwareTimeout {
            operation: "guide pulse West 500 ms".to_string(),
            elapsed_ms: 5512,
        };
        assert_eq!(err.to_string(), "guide pulse West 500 ms timed out after 5512 ms");
        assert_eq!(err.reason_code().as_str(), "HARDWARE_TIMEOUT");
        assert!(err.is_hardware());

        let err = GuideError::CalibrationTooShort {
            axis: GuideAxis::Axis1,
            distance: 3.14159,
            required: 8.0,
        };
        assert!(err.to_string().contains("3.1 px along Axis1"));
        assert!(!err.is_hardware());
        assert_eq!(err.reason_code(), ReasonCode::CalibrationTooShort);
    }
}
