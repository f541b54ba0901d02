//! Requests handed to worker lanes and the results they produce.

use crate::error::{GuideError, GuideResult};
use crossbeam_channel::Receiver;
use shared::camera_interface::{CameraCapabilities, Frame};
use shared::image_proc::AABB;
use shared::mount_interface::{GuideDirection, MountCapabilities};
use std::fmt;

/// Which worker lane executes a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LaneId {
    /// Camera exposures and primary mount moves, serialized
    Primary,
    /// Secondary actuator moves
    Secondary,
}

impl fmt::Display for LaneId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LaneId::Primary => write!(f, "primary"),
            LaneId::Secondary => write!(f, "secondary"),
        }
    }
}

/// Device a move is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MoveTarget {
    Mount,
    StepGuider,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExposureRequest {
    pub duration_ms: u64,
    pub subframe: Option<AABB>,
}

impl ExposureRequest {
    pub fn new(duration_ms: u64) -> Self {
        Self {
            duration_ms,
            subframe: None,
        }
    }

    pub fn with_subframe(mut self, subframe: AABB) -> Self {
        self.subframe = Some(subframe);
        self
    }
}

/// A single-axis move. `amount` is milliseconds of pulse for the mount and
/// steps for the AO unit.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveRequest {
    pub target: MoveTarget,
    pub direction: GuideDirection,
    pub amount: u32,
    pub is_calibration_move: bool,
}

impl MoveRequest {
    pub fn mount(direction: GuideDirection, duration_ms: u32) -> Self {
        Self {
            target: MoveTarget::Mount,
            direction,
            amount: duration_ms,
            is_calibration_move: false,
        }
    }

    pub fn step_guider(direction: GuideDirection, steps: u32) -> Self {
        Self {
            target: MoveTarget::StepGuider,
            direction,
            amount: steps,
            is_calibration_move: false,
        }
    }

    pub fn calibration(mut self) -> Self {
        self.is_calibration_move = true;
        self
    }

    pub(crate) fn describe(&self) -> String {
        match self.target {
            MoveTarget::Mount => format!("guide pulse {} {} ms", self.direction, self.amount),
            MoveTarget::StepGuider => format!("AO step {} x{}", self.direction, self.amount),
        }
    }
}

/// Successful move completion.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveReport {
    pub target: MoveTarget,
    pub direction: GuideDirection,
    pub amount_moved: u32,
    /// The AO unit stopped at its travel limit
    pub limit_reached: bool,
    /// Lane that executed the move
    pub lane: LaneId,
    /// AO position `(x, y)` after the move, for AO targets
    pub ao_position: Option<(i32, i32)>,
}

pub type ExposureOutcome = GuideResult<Frame>;
pub type MoveOutcome = GuideResult<MoveReport>;

/// Equipment facts gathered on the primary lane at connect time.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectReport {
    /// Sensor size `(height, width)`
    pub frame_size: (usize, usize),
    pub camera: CameraCapabilities,
    pub mount: MountCapabilities,
    pub step_guider: Option<MountCapabilities>,
    /// AO travel limits `(x, y)` in steps
    pub ao_max_position: Option<(u32, u32)>,
    /// Mount declination in radians when known
    pub declination: Option<f64>,
}

/// Completion handle for an asynchronously submitted request.
///
/// The worker posts exactly one result. If the lane shuts down before
/// running the request, waiting yields [`GuideError::TerminateRequested`].
pub struct Pending<T> {
    rx: Receiver<GuideResult<T>>,
}

impl<T> Pending<T> {
    pub(crate) fn new(rx: Receiver<GuideResult<T>>) -> Self {
        Self { rx }
    }

    /// Block until the worker posts the result.
    pub fn wait(self) -> GuideResult<T> {
        self.rx
            .recv()
            .unwrap_or(Err(GuideError::TerminateRequested))
    }
}
