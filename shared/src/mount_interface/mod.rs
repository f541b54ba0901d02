//! Mount and step-guider (adaptive optics) abstractions.
//!
//! Both device roles are driven with timed or counted moves along two axes.
//! Axis 1 is RA for a mount and X for an AO unit; axis 2 is Dec / Y. A
//! positive step count or pulse in the West / North direction is the "plus"
//! direction of each axis.

pub mod mock;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Guide pulse or step direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuideDirection {
    North,
    South,
    East,
    West,
}

/// Device axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuideAxis {
    /// RA for a mount, X for an AO unit
    Axis1,
    /// Dec for a mount, Y for an AO unit
    Axis2,
}

impl GuideDirection {
    pub fn opposite(self) -> Self {
        match self {
            GuideDirection::North => GuideDirection::South,
            GuideDirection::South => GuideDirection::North,
            GuideDirection::East => GuideDirection::West,
            GuideDirection::West => GuideDirection::East,
        }
    }

    pub fn axis(self) -> GuideAxis {
        match self {
            GuideDirection::East | GuideDirection::West => GuideAxis::Axis1,
            GuideDirection::North | GuideDirection::South => GuideAxis::Axis2,
        }
    }

    /// +1 for the plus direction of the axis (West, North), -1 otherwise.
    pub fn sign(self) -> i32 {
        match self {
            GuideDirection::West | GuideDirection::North => 1,
            GuideDirection::East | GuideDirection::South => -1,
        }
    }

    /// Plus or minus direction along an axis.
    pub fn along(axis: GuideAxis, positive: bool) -> Self {
        match (axis, positive) {
            (GuideAxis::Axis1, true) => GuideDirection::West,
            (GuideAxis::Axis1, false) => GuideDirection::East,
            (GuideAxis::Axis2, true) => GuideDirection::North,
            (GuideAxis::Axis2, false) => GuideDirection::South,
        }
    }
}

impl fmt::Display for GuideDirection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            GuideDirection::North => "North",
            GuideDirection::South => "South",
            GuideDirection::East => "East",
            GuideDirection::West => "West",
        };
        write!(f, "{name}")
    }
}

/// Outcome of a mount guide pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveResult {
    Ok,
    Error,
    /// The mount refused the pulse because it is slewing
    ErrorSlewing,
}

/// Outcome of an AO step command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Ok,
    /// The unit hit its travel limit; it moved as far as it could
    LimitReached,
    Error,
}

/// Errors reported by mount and AO drivers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MountError {
    /// Device is not connected.
    #[error("device not connected")]
    NotConnected,

    /// Communication with the device failed.
    #[error("communication failure: {0}")]
    Communication(String),

    /// The device does not support the requested operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

pub type MountResult<T> = Result<T, MountError>;

/// Capability flags a mount or AO driver advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MountCapabilities {
    /// Mount accepts timed pulse-guide commands
    pub can_pulse_guide: bool,
    /// Driver may only be called from the primary worker lane
    pub synchronous_only: bool,
}

/// Trait for a primary mount driver
pub trait Mount: Send + Sync {
    fn name(&self) -> &str;

    fn connect(&self) -> MountResult<()>;

    fn disconnect(&self) -> MountResult<()>;

    fn is_connected(&self) -> bool;

    fn capabilities(&self) -> MountCapabilities;

    /// Start a guide pulse. Returns once the pulse has been accepted; use
    /// [`Mount::is_guiding`] to learn when it has finished.
    fn guide(&self, direction: GuideDirection, duration: Duration) -> MoveResult;

    /// True while a guide pulse is still running
    fn is_guiding(&self) -> MountResult<bool>;

    /// True while the mount is slewing
    fn slewing(&self) -> MountResult<bool>;

    /// Stop any running pulse
    fn stop_guiding(&self) -> MountResult<()>;

    /// Current pointing declination in radians, when the driver knows it
    fn declination(&self) -> Option<f64> {
        None
    }
}

/// Trait for a secondary step actuator (AO / stepguider)
///
/// Positions are counted in steps from center; West and North steps move
/// the position in the positive direction.
pub trait StepGuider: Send + Sync {
    fn name(&self) -> &str;

    fn connect(&self) -> MountResult<()>;

    fn disconnect(&self) -> MountResult<()>;

    fn is_connected(&self) -> bool;

    fn capabilities(&self) -> MountCapabilities;

    /// Move `count` steps. On [`StepResult::LimitReached`] the unit stops at its limit.
    fn step(&self, direction: GuideDirection, count: u32) -> StepResult;

    /// True while the last step command is still settling
    fn is_moving(&self) -> MountResult<bool> {
        Ok(false)
    }

    /// Travel limit in steps from center (positive) along an axis
    fn max_position(&self, axis: GuideAxis) -> u32;

    /// Current position in steps from center
    fn position(&self, axis: GuideAxis) -> i32;

    /// Return to center
    fn center(&self) -> StepResult;
}
