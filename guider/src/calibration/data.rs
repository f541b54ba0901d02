//! Calibration results and the camera/mount coordinate transform.

use crate::error::{GuideError, GuideResult};
use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_PI_2, FRAC_PI_3, PI};
use std::fmt;

/// RA rates from calibrations taken further from the equator than this are
/// not rescaled for a new declination.
pub const DEC_COMPENSATION_LIMIT: f64 = FRAC_PI_3;

/// Unit of the calibration rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoveUnits {
    /// Pulse-guide milliseconds (mount)
    Milliseconds,
    /// Actuator steps (AO unit)
    Steps,
}

impl fmt::Display for MoveUnits {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MoveUnits::Milliseconds => write!(f, "ms"),
            MoveUnits::Steps => write!(f, "steps"),
        }
    }
}

/// Wrap an angle into (-pi, pi].
pub fn normalize_angle(angle: f64) -> f64 {
    let mut a = angle % (2.0 * PI);
    if a <= -PI {
        a += 2.0 * PI;
    } else if a > PI {
        a -= 2.0 * PI;
    }
    a
}

/// Deviation of two axis angles from perpendicular, in radians.
pub fn orthogonality_error(ra_angle: f64, dec_angle: f64) -> f64 {
    (FRAC_PI_2 - normalize_angle(dec_angle - ra_angle).abs()).abs()
}

/// Measured direction and rate of each device axis in camera pixels.
///
/// For a mount, axis 1 is RA and axis 2 is Dec. For an AO unit the same
/// fields hold X and Y. Angles are the camera direction the star moves for a
/// plus-direction (West / North) command. Rates are pixels per unit of
/// `units`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationData {
    pub ra_angle: f64,
    pub dec_angle: f64,
    pub ra_rate: f64,
    pub dec_rate: f64,
    /// Declination at calibration time in radians, when the mount reports it
    pub declination: Option<f64>,
    pub valid: bool,
    /// Size of each calibration move
    pub step_size: u32,
    pub units: MoveUnits,
    pub ra_steps: u32,
    pub dec_steps: u32,
    /// Star travel on each plus leg (pixels)
    pub ra_distance: f64,
    pub dec_distance: f64,
    /// Star travel on each return leg (pixels)
    pub ra_return_distance: f64,
    pub dec_return_distance: f64,
    pub orthogonality_error: f64,
}

impl CalibrationData {
    /// Placeholder for "never calibrated".
    pub fn invalid(units: MoveUnits) -> Self {
        Self {
            ra_angle: 0.0,
            dec_angle: FRAC_PI_2,
            ra_rate: 0.0,
            dec_rate: 0.0,
            declination: None,
            valid: false,
            step_size: 0,
            units,
            ra_steps: 0,
            dec_steps: 0,
            ra_distance: 0.0,
            dec_distance: 0.0,
            ra_return_distance: 0.0,
            dec_return_distance: 0.0,
            orthogonality_error: 0.0,
        }
    }

    /// Columns are the camera-space unit vectors of axis 1 and axis 2.
    fn axis_matrix(&self) -> Matrix2<f64> {
        Matrix2::new(
            self.ra_angle.cos(),
            self.dec_angle.cos(),
            self.ra_angle.sin(),
            self.dec_angle.sin(),
        )
    }

    /// Express a camera-space offset as pixels along each device axis.
    pub fn camera_to_mount(&self, dx: f64, dy: f64) -> GuideResult<(f64, f64)> {
        let inverse = self.axis_matrix().try_inverse().ok_or_else(|| {
            GuideError::CalibrationInvalid(format!(
                "axes are parallel (ra {:.3} rad, dec {:.3} rad)",
                self.ra_angle, self.dec_angle
            ))
        })?;
        let m = inverse * Vector2::new(dx, dy);
        Ok((m.x, m.y))
    }

    /// Camera-space offset produced by the given travel along each axis.
    pub fn mount_to_camera(&self, axis1: f64, axis2: f64) -> (f64, f64) {
        let c = self.axis_matrix() * Vector2::new(axis1, axis2);
        (c.x, c.y)
    }

    /// Whether [`Self::ra_rate_at`] can rescale this calibration.
    pub fn supports_dec_compensation(&self) -> bool {
        match self.declination {
            Some(dec) => dec.abs() <= DEC_COMPENSATION_LIMIT,
            None => false,
        }
    }

    /// RA rate with the mount pointing at `declination` (radians). Sky motion
    /// per RA pulse shrinks with cos(dec), so the calibrated rate is scaled
    /// by cos(dec) / cos(calibration dec). The calibrated rate is returned
    /// unchanged when either declination is unknown or the calibration was
    /// taken beyond [`DEC_COMPENSATION_LIMIT`].
    pub fn ra_rate_at(&self, declination: Option<f64>) -> f64 {
        match (self.declination, declination) {
            (Some(cal_dec), Some(dec)) if cal_dec != dec && self.supports_dec_compensation() => {
                self.ra_rate / cal_dec.cos() * dec.cos()
            }
            _ => self.ra_rate,
        }
    }

    /// Largest rate divided by smallest, or infinity when a rate is zero.
    pub fn aspect_ratio(&self) -> f64 {
        let (lo, hi) = if self.ra_rate < self.dec_rate {
            (self.ra_rate, self.dec_rate)
        } else {
            (self.dec_rate, self.ra_rate)
        };
        if lo <= 0.0 {
            f64::INFINITY
        } else {
            hi / lo
        }
    }

}

impl fmt::Display for CalibrationData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "angles {:.1}/{:.1} deg, rates {:.4}/{:.4} px/{}, orthogonality error {:.1} deg",
            self.ra_angle.to_degrees(),
            self.dec_angle.to_degrees(),
            self.ra_rate,
            self.dec_rate,
            self.units,
            self.orthogonality_error.to_degrees()
        )
    }
}
