//! AO (step guider) calibration sequence.
//!
//! The unit starts centred. After averaging a few frames the unit sweeps
//! West then back East, North then back South, measuring star travel per
//! step, and finally recentres using its own step bookkeeping.

use super::config::StepGuiderCalibrationConfig;
use super::data::{normalize_angle, orthogonality_error, CalibrationData, MoveUnits};
use super::fit::{fit_axis, AxisFit, LegSample};
use super::{CalibrationAction, CalibrationSample, CalibrationState};
use crate::error::GuideError;
use nalgebra::Vector2;
use shared::mount_interface::{GuideAxis, GuideDirection};

#[derive(Debug, Clone)]
pub struct SweepLeg {
    start: Vector2<f64>,
    samples: Vec<LegSample>,
    steps: u32,
    target: u32,
}

#[derive(Debug, Clone)]
pub struct SweptAxis {
    fit: AxisFit,
    steps: u32,
    distance: f64,
    end: Vector2<f64>,
    return_distance: f64,
}

impl SweepLeg {
    fn new(start: Vector2<f64>, target: u32) -> Self {
        Self {
            start,
            samples: vec![LegSample {
                units: 0.0,
                position: start,
            }],
            steps: 0,
            target: target.max(1),
        }
    }

    fn record(&mut self, pos: Vector2<f64>, moved: u32) {
        self.steps += moved;
        self.samples.push(LegSample {
            units: self.steps as f64,
            position: pos,
        });
    }

    fn next_amount(&self, config: &StepGuiderCalibrationConfig) -> u32 {
        config
            .steps_per_iteration
            .min(self.target.saturating_sub(self.steps))
    }
}

#[derive(Debug, Clone, Default)]
pub enum SweepPhase {
    #[default]
    Cleared,
    AverageStart {
        sum: Vector2<f64>,
        count: u32,
    },
    GotoPlusAxis1(SweepLeg),
    GotoMinusAxis1 {
        axis1: SweptAxis,
        remaining: u32,
    },
    GotoPlusAxis2 {
        axis1: SweptAxis,
        leg: SweepLeg,
    },
    GotoMinusAxis2 {
        axis1: SweptAxis,
        axis2: SweptAxis,
        remaining: u32,
    },
    Recenter {
        axis1: SweptAxis,
        axis2: SweptAxis,
    },
    Complete,
}

/// Sweep phase plus the bookkeeping that spans phases.
#[derive(Debug, Clone, Default)]
pub struct StepGuiderCalibration {
    phase: SweepPhase,
    /// Net steps from centre per axis, positive West / North
    net: [i64; 2],
    step_errors: u32,
    last_move: Option<(GuideDirection, u32)>,
}

impl StepGuiderCalibration {
    pub fn state(&self) -> CalibrationState {
        match self.phase {
            SweepPhase::Cleared => CalibrationState::Cleared,
            SweepPhase::AverageStart { .. } => CalibrationState::AverageStart,
            SweepPhase::GotoPlusAxis1(_) => CalibrationState::GotoPlusAxis1,
            SweepPhase::GotoMinusAxis1 { .. } => CalibrationState::GotoMinusAxis1,
            SweepPhase::GotoPlusAxis2 { .. } => CalibrationState::GotoPlusAxis2,
            SweepPhase::GotoMinusAxis2 { .. } => CalibrationState::GotoMinusAxis2,
            SweepPhase::Recenter { .. } => CalibrationState::Recenter,
            SweepPhase::Complete => CalibrationState::Complete,
        }
    }

    pub fn step_errors(&self) -> u32 {
        self.step_errors
    }

    /// Net steps from centre, (axis 1, axis 2).
    pub fn offset_from_center(&self) -> (i64, i64) {
        (self.net[0], self.net[1])
    }

    fn request(&mut self, direction: GuideDirection, amount: u32) -> CalibrationAction {
        self.last_move = Some((direction, amount));
        CalibrationAction::Move { direction, amount }
    }

    fn fail(mut self, error: GuideError) -> (Self, CalibrationAction) {
        self.phase = SweepPhase::Cleared;
        self.last_move = None;
        (self, CalibrationAction::Failed(error))
    }
}

fn axis_index(axis: GuideAxis) -> usize {
    match axis {
        GuideAxis::Axis1 => 0,
        GuideAxis::Axis2 => 1,
    }
}

fn finish_leg(leg: SweepLeg, end: Vector2<f64>) -> Result<SweptAxis, GuideError> {
    let fit = fit_axis(&leg.samples)?;
    Ok(SweptAxis {
        fit,
        steps: leg.steps,
        distance: (end - leg.start).norm(),
        end,
        return_distance: 0.0,
    })
}

/// Advance the AO calibration by one observed star position.
///
/// `max_position` is the travel limit from centre on each axis.
pub fn transition(
    mut cal: StepGuiderCalibration,
    sample: &CalibrationSample,
    config: &StepGuiderCalibrationConfig,
    max_position: (u32, u32),
) -> (StepGuiderCalibration, CalibrationAction) {
    let pos = sample.position();

    let mut moved = 0;
    if let Some((direction, commanded)) = cal.last_move.take() {
        moved = sample.moved.unwrap_or(commanded).min(commanded);
        cal.net[axis_index(direction.axis())] += direction.sign() as i64 * moved as i64;
        if moved == 0 && commanded > 0 {
            cal.step_errors += 1;
            log::warn!(
                "AO did not move on {direction} {commanded} ({} step errors)",
                cal.step_errors
            );
            let step_errors = cal.step_errors;
            if step_errors > config.max_step_errors {
                return cal.fail(GuideError::CalibrationInvalid(format!(
                    "AO stalled, {step_errors} step errors"
                )));
            }
        }
    }

    let target = |max: u32| ((config.travel_fraction * max as f64) as u32).max(1);

    let phase = std::mem::take(&mut cal.phase);
    let action = match phase {
        SweepPhase::Cleared => {
            log::info!(
                "AO calibration starting, averaging {} frames at centre",
                config.start_samples
            );
            cal.phase = SweepPhase::AverageStart { sum: pos, count: 1 };
            if config.start_samples > 1 {
                return (cal, CalibrationAction::Sample);
            }
            return transition_from_start(cal, pos, config, target(max_position.0));
        }
        SweepPhase::AverageStart { sum, count } => {
            let sum = sum + pos;
            let count = count + 1;
            if count < config.start_samples {
                cal.phase = SweepPhase::AverageStart { sum, count };
                CalibrationAction::Sample
            } else {
                return transition_from_start(
                    cal,
                    sum / count as f64,
                    config,
                    target(max_position.0),
                );
            }
        }
        SweepPhase::GotoPlusAxis1(mut leg) => {
            leg.record(pos, moved);
            if leg.steps >= leg.target {
                let axis1 = match finish_leg(leg, pos) {
                    Ok(axis) => axis,
                    Err(e) => return cal.fail(e),
                };
                log::info!(
                    "AO X measured: {} steps, {:.1} px",
                    axis1.steps,
                    axis1.distance
                );
                let remaining = axis1.steps;
                let amount = config.steps_per_iteration.min(remaining);
                cal.phase = SweepPhase::GotoMinusAxis1 { axis1, remaining };
                cal.request(GuideDirection::East, amount)
            } else {
                let amount = leg.next_amount(config);
                cal.phase = SweepPhase::GotoPlusAxis1(leg);
                cal.request(GuideDirection::West, amount)
            }
        }
        SweepPhase::GotoMinusAxis1 {
            mut axis1,
            remaining,
        } => {
            let remaining = remaining.saturating_sub(moved);
            if remaining > 0 {
                let amount = config.steps_per_iteration.min(remaining);
                cal.phase = SweepPhase::GotoMinusAxis1 { axis1, remaining };
                cal.request(GuideDirection::East, amount)
            } else {
                axis1.return_distance = (pos - axis1.end).norm();
                let leg = SweepLeg::new(pos, target(max_position.1));
                let amount = leg.next_amount(config);
                cal.phase = SweepPhase::GotoPlusAxis2 { axis1, leg };
                cal.request(GuideDirection::North, amount)
            }
        }
        SweepPhase::GotoPlusAxis2 { axis1, mut leg } => {
            leg.record(pos, moved);
            if leg.steps >= leg.target {
                let axis2 = match finish_leg(leg, pos) {
                    Ok(axis) => axis,
                    Err(e) => return cal.fail(e),
                };
                log::info!(
                    "AO Y measured: {} steps, {:.1} px",
                    axis2.steps,
                    axis2.distance
                );
                let remaining = axis2.steps;
                let amount = config.steps_per_iteration.min(remaining);
                cal.phase = SweepPhase::GotoMinusAxis2 {
                    axis1,
                    axis2,
                    remaining,
                };
                cal.request(GuideDirection::South, amount)
            } else {
                let amount = leg.next_amount(config);
                cal.phase = SweepPhase::GotoPlusAxis2 { axis1, leg };
                cal.request(GuideDirection::North, amount)
            }
        }
        SweepPhase::GotoMinusAxis2 {
            axis1,
            mut axis2,
            remaining,
        } => {
            let remaining = remaining.saturating_sub(moved);
            if remaining > 0 {
                let amount = config.steps_per_iteration.min(remaining);
                cal.phase = SweepPhase::GotoMinusAxis2 {
                    axis1,
                    axis2,
                    remaining,
                };
                cal.request(GuideDirection::South, amount)
            } else {
                axis2.return_distance = (pos - axis2.end).norm();
                return recenter_or_finish(cal, axis1, axis2, config);
            }
        }
        SweepPhase::Recenter { axis1, axis2 } => {
            return recenter_or_finish(cal, axis1, axis2, config);
        }
        SweepPhase::Complete => {
            return cal.fail(GuideError::CalibrationInvalid(
                "calibration already complete".to_string(),
            ));
        }
    };
    (cal, action)
}

fn transition_from_start(
    mut cal: StepGuiderCalibration,
    start: Vector2<f64>,
    config: &StepGuiderCalibrationConfig,
    target: u32,
) -> (StepGuiderCalibration, CalibrationAction) {
    log::debug!("AO calibration start at ({:.2}, {:.2})", start.x, start.y);
    let leg = SweepLeg::new(start, target);
    let amount = leg.next_amount(config);
    cal.phase = SweepPhase::GotoPlusAxis1(leg);
    let action = cal.request(GuideDirection::West, amount);
    (cal, action)
}

/// Report a failed step. The last move is retried until the error budget
/// is spent.
pub fn step_failed(
    mut cal: StepGuiderCalibration,
    config: &StepGuiderCalibrationConfig,
) -> (StepGuiderCalibration, CalibrationAction) {
    cal.step_errors += 1;
    log::warn!("AO calibration step failed ({} errors)", cal.step_errors);
    if cal.step_errors > config.max_step_errors {
        let errors = cal.step_errors;
        return cal.fail(GuideError::CalibrationInvalid(format!(
            "too many AO step errors ({errors})"
        )));
    }
    match cal.last_move {
        Some((direction, amount)) => (cal, CalibrationAction::Move { direction, amount }),
        None => (cal, CalibrationAction::Sample),
    }
}

fn recenter_or_finish(
    mut cal: StepGuiderCalibration,
    axis1: SweptAxis,
    axis2: SweptAxis,
    config: &StepGuiderCalibrationConfig,
) -> (StepGuiderCalibration, CalibrationAction) {
    for (index, axis) in [(0, GuideAxis::Axis1), (1, GuideAxis::Axis2)] {
        let net = cal.net[index];
        if net != 0 {
            let direction = GuideDirection::along(axis, net < 0);
            let amount = net.unsigned_abs().min(u32::MAX as u64) as u32;
            log::debug!("AO recentring {direction} {amount} steps");
            cal.phase = SweepPhase::Recenter { axis1, axis2 };
            let action = cal.request(direction, amount);
            return (cal, action);
        }
    }

    let ra_angle = normalize_angle(axis1.fit.angle);
    let dec_angle = normalize_angle(axis2.fit.angle);
    let data = CalibrationData {
        ra_angle,
        dec_angle,
        ra_rate: axis1.fit.rate,
        dec_rate: axis2.fit.rate,
        declination: None,
        valid: true,
        step_size: config.steps_per_iteration,
        units: MoveUnits::Steps,
        ra_steps: axis1.steps,
        dec_steps: axis2.steps,
        ra_distance: axis1.distance,
        dec_distance: axis2.distance,
        ra_return_distance: axis1.return_distance,
        dec_return_distance: axis2.return_distance,
        orthogonality_error: orthogonality_error(ra_angle, dec_angle),
    };
    log::info!("AO calibration complete: {data}");
    cal.phase = SweepPhase::Complete;
    (cal, CalibrationAction::Done(data))
}
