//! Mount calibration sequence.
//!
//! Pulses West until the star has moved `calibration_distance`, returns East
//! past the start, clears Dec backlash with North pulses, then measures North
//! and returns South. A final nudge brings the star back near its Dec start.

use super::config::CalibrationConfig;
use super::data::{normalize_angle, orthogonality_error, CalibrationData, MoveUnits};
use super::fit::{fit_axis, AxisFit, LegSample};
use super::{CalibrationAction, CalibrationSample, CalibrationState};
use crate::error::GuideError;
use nalgebra::Vector2;
use shared::mount_interface::{GuideAxis, GuideDirection};
use std::f64::consts::FRAC_PI_2;

/// Plus leg in progress.
#[derive(Debug, Clone)]
pub struct Leg {
    start: Vector2<f64>,
    samples: Vec<LegSample>,
    steps: u32,
}

/// Plus leg that has finished.
#[derive(Debug, Clone)]
pub struct MeasuredAxis {
    fit: AxisFit,
    steps: u32,
    distance: f64,
    start: Vector2<f64>,
    end: Vector2<f64>,
    return_distance: f64,
}

enum LegProgress {
    Continue(Leg),
    Done(MeasuredAxis),
    Failed(GuideError),
}

impl Leg {
    fn new(start: Vector2<f64>) -> Self {
        Self {
            start,
            samples: vec![LegSample {
                units: 0.0,
                position: start,
            }],
            steps: 0,
        }
    }

    fn record(
        mut self,
        pos: Vector2<f64>,
        axis: GuideAxis,
        config: &CalibrationConfig,
    ) -> LegProgress {
        self.steps += 1;
        self.samples.push(LegSample {
            units: (self.steps * config.calibration_step_ms) as f64,
            position: pos,
        });
        let distance = (pos - self.start).norm();
        log::debug!(
            "{axis:?} calibration step {}: star at ({:.2}, {:.2}), {distance:.2} px from start",
            self.steps,
            pos.x,
            pos.y
        );

        if distance >= config.calibration_distance {
            return self.finish(pos, distance);
        }
        if self.steps >= config.max_steps {
            if distance < config.min_distance {
                return LegProgress::Failed(GuideError::CalibrationTooShort {
                    axis,
                    distance,
                    required: config.min_distance,
                });
            }
            log::warn!(
                "{axis:?} calibration used all {} steps but the star moved only {distance:.1} px",
                self.steps
            );
            return self.finish(pos, distance);
        }
        LegProgress::Continue(self)
    }

    fn finish(self, end: Vector2<f64>, distance: f64) -> LegProgress {
        match fit_axis(&self.samples) {
            Ok(fit) => LegProgress::Done(MeasuredAxis {
                fit,
                steps: self.steps,
                distance,
                start: self.start,
                end,
                return_distance: 0.0,
            }),
            Err(e) => LegProgress::Failed(e),
        }
    }
}

/// Tagged calibration state carrying what has been measured so far.
#[derive(Debug, Clone, Default)]
pub enum MountCalibration {
    #[default]
    Cleared,
    GotoPlusAxis1(Leg),
    GotoMinusAxis1 {
        axis1: MeasuredAxis,
        remaining: u32,
    },
    ClearBacklash {
        axis1: MeasuredAxis,
        last: Vector2<f64>,
        expected: f64,
        consecutive: u32,
        steps: u32,
    },
    GotoPlusAxis2 {
        axis1: MeasuredAxis,
        leg: Leg,
    },
    GotoMinusAxis2 {
        axis1: MeasuredAxis,
        axis2: MeasuredAxis,
        remaining: u32,
    },
    NudgeAxis2 {
        axis1: MeasuredAxis,
        axis2: MeasuredAxis,
        nudges: u32,
    },
    Complete,
}

impl MountCalibration {
    pub fn state(&self) -> CalibrationState {
        match self {
            MountCalibration::Cleared => CalibrationState::Cleared,
            MountCalibration::GotoPlusAxis1(_) => CalibrationState::GotoPlusAxis1,
            MountCalibration::GotoMinusAxis1 { .. } => CalibrationState::GotoMinusAxis1,
            MountCalibration::ClearBacklash { .. } => CalibrationState::ClearBacklash,
            MountCalibration::GotoPlusAxis2 { .. } => CalibrationState::GotoPlusAxis2,
            MountCalibration::GotoMinusAxis2 { .. } => CalibrationState::GotoMinusAxis2,
            MountCalibration::NudgeAxis2 { .. } => CalibrationState::NudgeAxis2,
            MountCalibration::Complete => CalibrationState::Complete,
        }
    }
}

fn pulse(direction: GuideDirection, config: &CalibrationConfig) -> CalibrationAction {
    CalibrationAction::Move {
        direction,
        amount: config.calibration_step_ms,
    }
}

/// Advance the mount calibration by one observed star position.
///
/// The first call (from `Cleared`) records the start position. Every later
/// call reports where the star is after the previously requested move.
pub fn transition(
    state: MountCalibration,
    sample: &CalibrationSample,
    config: &CalibrationConfig,
) -> (MountCalibration, CalibrationAction) {
    use MountCalibration::*;
    let pos = sample.position();

    match state {
        Cleared => {
            log::info!(
                "Mount calibration starting, star at ({:.2}, {:.2}), {} ms steps",
                pos.x,
                pos.y,
                config.calibration_step_ms
            );
            (GotoPlusAxis1(Leg::new(pos)), pulse(GuideDirection::West, config))
        }
        GotoPlusAxis1(leg) => match leg.record(pos, GuideAxis::Axis1, config) {
            LegProgress::Continue(leg) => {
                (GotoPlusAxis1(leg), pulse(GuideDirection::West, config))
            }
            LegProgress::Done(axis1) => {
                log::info!(
                    "RA measured: {} steps, {:.1} px, angle {:.1} deg",
                    axis1.steps,
                    axis1.distance,
                    axis1.fit.angle.to_degrees()
                );
                let remaining = axis1.steps + config.return_overshoot_steps;
                (
                    GotoMinusAxis1 { axis1, remaining },
                    pulse(GuideDirection::East, config),
                )
            }
            LegProgress::Failed(e) => (Cleared, CalibrationAction::Failed(e)),
        },
        GotoMinusAxis1 {
            mut axis1,
            remaining,
        } => {
            let remaining = remaining.saturating_sub(1);
            if remaining > 0 {
                return (
                    GotoMinusAxis1 { axis1, remaining },
                    pulse(GuideDirection::East, config),
                );
            }
            axis1.return_distance = (pos - axis1.end).norm();
            if config.assume_orthogonal {
                return finish(axis1, None, config);
            }
            let expected = axis1.fit.rate * config.calibration_step_ms as f64;
            (
                ClearBacklash {
                    axis1,
                    last: pos,
                    expected,
                    consecutive: 0,
                    steps: 0,
                },
                pulse(GuideDirection::North, config),
            )
        }
        ClearBacklash {
            axis1,
            last,
            expected,
            consecutive,
            steps,
        } => {
            let steps = steps + 1;
            let moved = (pos - last).norm();
            let consecutive = if moved >= config.backlash_threshold * expected {
                consecutive + 1
            } else {
                0
            };
            if consecutive >= config.backlash_consecutive {
                log::debug!("Dec backlash cleared after {steps} pulses");
            } else if steps >= config.max_backlash_steps {
                log::warn!(
                    "Dec backlash not cleared after {steps} pulses, measuring Dec anyway"
                );
            } else {
                return (
                    ClearBacklash {
                        axis1,
                        last: pos,
                        expected,
                        consecutive,
                        steps,
                    },
                    pulse(GuideDirection::North, config),
                );
            }
            (
                GotoPlusAxis2 {
                    axis1,
                    leg: Leg::new(pos),
                },
                pulse(GuideDirection::North, config),
            )
        }
        GotoPlusAxis2 { axis1, leg } => match leg.record(pos, GuideAxis::Axis2, config) {
            LegProgress::Continue(leg) => (
                GotoPlusAxis2 { axis1, leg },
                pulse(GuideDirection::North, config),
            ),
            LegProgress::Done(axis2) => {
                log::info!(
                    "Dec measured: {} steps, {:.1} px, angle {:.1} deg",
                    axis2.steps,
                    axis2.distance,
                    axis2.fit.angle.to_degrees()
                );
                let remaining = axis2.steps;
                (
                    GotoMinusAxis2 {
                        axis1,
                        axis2,
                        remaining,
                    },
                    pulse(GuideDirection::South, config),
                )
            }
            LegProgress::Failed(e) => (Cleared, CalibrationAction::Failed(e)),
        },
        GotoMinusAxis2 {
            axis1,
            mut axis2,
            remaining,
        } => {
            let remaining = remaining.saturating_sub(1);
            if remaining > 0 {
                return (
                    GotoMinusAxis2 {
                        axis1,
                        axis2,
                        remaining,
                    },
                    pulse(GuideDirection::South, config),
                );
            }
            axis2.return_distance = (pos - axis2.end).norm();
            nudge_or_finish(axis1, axis2, pos, 0, config)
        }
        NudgeAxis2 {
            axis1,
            axis2,
            nudges,
        } => nudge_or_finish(axis1, axis2, pos, nudges, config),
        Complete => (
            Complete,
            CalibrationAction::Failed(GuideError::CalibrationInvalid(
                "calibration already complete".to_string(),
            )),
        ),
    }
}

fn nudge_or_finish(
    axis1: MeasuredAxis,
    axis2: MeasuredAxis,
    pos: Vector2<f64>,
    nudges: u32,
    config: &CalibrationConfig,
) -> (MountCalibration, CalibrationAction) {
    let unit = Vector2::new(axis2.fit.angle.cos(), axis2.fit.angle.sin());
    let offset = (pos - axis2.start).dot(&unit);
    if offset.abs() <= config.nudge_tolerance || nudges >= config.max_nudges {
        return finish(axis1, Some(axis2), config);
    }
    let limit = axis2.steps * config.calibration_step_ms;
    let amount = ((offset.abs() / axis2.fit.rate).round() as u32).clamp(1, limit.max(1));
    let direction = if offset > 0.0 {
        GuideDirection::South
    } else {
        GuideDirection::North
    };
    log::debug!(
        "Dec nudge {} of {}: {offset:.2} px, {direction} {amount} ms",
        nudges + 1,
        config.max_nudges
    );
    (
        MountCalibration::NudgeAxis2 {
            axis1,
            axis2,
            nudges: nudges + 1,
        },
        CalibrationAction::Move { direction, amount },
    )
}

fn finish(
    axis1: MeasuredAxis,
    axis2: Option<MeasuredAxis>,
    config: &CalibrationConfig,
) -> (MountCalibration, CalibrationAction) {
    let ra_angle = normalize_angle(axis1.fit.angle);
    let (dec_angle, dec_rate, dec_steps, dec_distance, dec_return_distance) = match &axis2 {
        Some(m) => (
            normalize_angle(m.fit.angle),
            m.fit.rate,
            m.steps,
            m.distance,
            m.return_distance,
        ),
        None => (
            normalize_angle(ra_angle + FRAC_PI_2),
            axis1.fit.rate,
            0,
            0.0,
            0.0,
        ),
    };
    let data = CalibrationData {
        ra_angle,
        dec_angle,
        ra_rate: axis1.fit.rate,
        dec_rate,
        declination: None,
        valid: true,
        step_size: config.calibration_step_ms,
        units: MoveUnits::Milliseconds,
        ra_steps: axis1.steps,
        dec_steps,
        ra_distance: axis1.distance,
        dec_distance,
        ra_return_distance: axis1.return_distance,
        dec_return_distance,
        orthogonality_error: orthogonality_error(ra_angle, dec_angle),
    };
    log::info!("Mount calibration complete: {data}");
    (MountCalibration::Complete, CalibrationAction::Done(data))
}
