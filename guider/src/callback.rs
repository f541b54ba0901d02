use crate::calibration::{CalibrationData, CalibrationIssue};
use crate::error::{GuideError, ReasonCode};
use crate::state::GuiderState;
use crate::worker::MoveTarget;
use shared::mount_interface::GuideDirection;
use std::sync::Arc;

/// Correction issued on one axis during a guide step
#[derive(Debug, Clone, PartialEq)]
pub struct AxisCorrection {
    /// Offset fed to the algorithm, pixels along the device axis
    pub offset: f64,
    /// Algorithm output in pixels
    pub correction: f64,
    /// Direction of the move, if one was issued
    pub direction: Option<GuideDirection>,
    /// Pulse milliseconds or AO steps commanded
    pub amount: u32,
    /// The move was cut short by a duration cap or travel limit
    pub limited: bool,
}

/// Record of a single guide frame
#[derive(Debug, Clone, PartialEq)]
pub struct GuideStep {
    pub frame_number: u64,
    /// Star position in frame coordinates
    pub star: (f64, f64),
    /// Star minus lock position, camera pixels
    pub camera_offset: (f64, f64),
    /// Offset along the device axes, pixels
    pub mount_offset: (f64, f64),
    /// Device that received the correction
    pub target: MoveTarget,
    pub axis1: AxisCorrection,
    pub axis2: AxisCorrection,
    /// AO position after the step, when an AO unit is in use
    pub ao_position: Option<(i32, i32)>,
    /// Star signal to noise ratio
    pub snr: f64,
}

impl GuideStep {
    /// True when neither axis issued a move.
    pub fn is_idle(&self) -> bool {
        self.axis1.amount == 0 && self.axis2.amount == 0
    }
}

/// Events emitted to registered callbacks
#[derive(Debug, Clone)]
pub enum GuiderEvent {
    StateChanged {
        from: GuiderState,
        to: GuiderState,
    },
    StarSelected {
        x: f64,
        y: f64,
        snr: f64,
    },
    GuideStep(GuideStep),
    StarLost {
        frame_number: u64,
        last_position: (f64, f64),
    },
    CalibrationComplete {
        target: MoveTarget,
        data: CalibrationData,
    },
    CalibrationFailed {
        target: MoveTarget,
        error: GuideError,
    },
    Advisory(CalibrationIssue),
    Dithered {
        dx: f64,
        dy: f64,
    },
    Error {
        reason: ReasonCode,
        message: String,
    },
}

/// Callback ID for registration/deregistration
pub type CallbackId = u64;

/// Callback function type
pub type GuiderCallback = Arc<dyn Fn(&GuiderEvent) + Send + Sync>;
