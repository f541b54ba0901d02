//! Request execution against the devices, run inside a worker lane.
//!
//! Every wait is a poll loop bounded by a [`Watchdog`] and checked against
//! the request's [`CancellationToken`]. Device failures are converted to
//! [`GuideError`] values here and never cross the lane boundary any other way.

use super::cancel::CancellationToken;
use super::request::{
    ConnectReport, ExposureOutcome, ExposureRequest, LaneId, MoveOutcome, MoveReport,
    MoveRequest, MoveTarget,
};
use crate::config::WorkerConfig;
use crate::equipment::Equipment;
use crate::error::{GuideError, GuideResult};
use crate::watchdog::Watchdog;
use shared::mount_interface::{GuideAxis, GuideDirection, MoveResult, StepGuider, StepResult};
use std::time::Duration;

fn poll_sleep(token: &CancellationToken, watchdog: &Watchdog, config: &WorkerConfig) {
    let interval = Duration::from_millis(config.poll_interval_ms);
    let wait = interval
        .min(watchdog.remaining())
        .max(Duration::from_millis(1));
    token.sleep(wait, interval);
}

pub(crate) fn run_exposure(
    equipment: &Equipment,
    request: &ExposureRequest,
    config: &WorkerConfig,
    token: &CancellationToken,
) -> ExposureOutcome {
    let camera = &equipment.camera;
    if token.is_interrupted() {
        return Err(GuideError::TerminateRequested);
    }
    camera
        .start_exposure(Duration::from_millis(request.duration_ms), request.subframe)
        .map_err(|e| GuideError::HardwareError(format!("{}: {e}", camera.name())))?;

    let watchdog = Watchdog::capture(request.duration_ms, config.download_allowance_ms);
    loop {
        if token.is_interrupted() {
            log::info!("Exposure interrupted, aborting");
            let _ = camera.abort_exposure();
            return Err(GuideError::TerminateRequested);
        }
        match camera.poll_exposure() {
            Ok(Some(mut frame)) => {
                if let Some(dark) = &equipment.dark_calibration {
                    dark.apply(&mut frame);
                }
                return Ok(frame);
            }
            Ok(None) => {}
            Err(e) => {
                let _ = camera.abort_exposure();
                return Err(GuideError::HardwareError(format!("{}: {e}", camera.name())));
            }
        }
        if watchdog.expired() {
            log::warn!(
                "Camera {} did not finish a {} ms exposure within {:?}; aborting",
                camera.name(),
                request.duration_ms,
                watchdog.ceiling()
            );
            let _ = camera.abort_exposure();
            return Err(GuideError::HardwareTimeout {
                operation: format!("exposure {} ms", request.duration_ms),
                elapsed_ms: watchdog.elapsed_ms(),
            });
        }
        poll_sleep(token, &watchdog, config);
    }
}

pub(crate) fn run_move(
    equipment: &Equipment,
    request: &MoveRequest,
    lane: LaneId,
    config: &WorkerConfig,
    token: &CancellationToken,
) -> MoveOutcome {
    if token.is_interrupted() {
        return Err(GuideError::TerminateRequested);
    }
    match request.target {
        MoveTarget::Mount => run_mount_move(equipment, request, lane, config, token),
        MoveTarget::StepGuider => run_step(equipment, request, lane, config, token),
    }
}

fn run_mount_move(
    equipment: &Equipment,
    request: &MoveRequest,
    lane: LaneId,
    config: &WorkerConfig,
    token: &CancellationToken,
) -> MoveOutcome {
    let mount = &equipment.mount;
    if !mount.capabilities().can_pulse_guide {
        return Err(GuideError::HardwareError(format!(
            "{} cannot pulse guide",
            mount.name()
        )));
    }
    let report = MoveReport {
        target: MoveTarget::Mount,
        direction: request.direction,
        amount_moved: request.amount,
        limit_reached: false,
        lane,
        ao_position: None,
    };
    if request.amount == 0 {
        return Ok(report);
    }
    if matches!(mount.slewing(), Ok(true)) {
        return Err(GuideError::SlewDetected);
    }

    let duration = Duration::from_millis(request.amount as u64);
    match mount.guide(request.direction, duration) {
        MoveResult::Ok => {}
        MoveResult::ErrorSlewing => return Err(GuideError::SlewDetected),
        MoveResult::Error => {
            return Err(GuideError::HardwareError(format!(
                "{} rejected {}",
                mount.name(),
                request.describe()
            )))
        }
    }

    let watchdog = Watchdog::for_move(request.amount as u64, config.settle_allowance_ms);
    let mut consecutive_failures = 0;
    loop {
        if token.is_interrupted() {
            log::info!("{} interrupted, stopping mount", request.describe());
            let _ = mount.stop_guiding();
            return Err(GuideError::TerminateRequested);
        }
        match mount.is_guiding() {
            Ok(false) => return Ok(report),
            Ok(true) => consecutive_failures = 0,
            Err(e) => {
                consecutive_failures += 1;
                log::warn!(
                    "is_guiding poll failed ({consecutive_failures}/{}): {e}",
                    config.max_poll_failures
                );
                if consecutive_failures >= config.max_poll_failures {
                    let _ = mount.stop_guiding();
                    return Err(GuideError::HardwareError(format!(
                        "{}: {e}",
                        mount.name()
                    )));
                }
            }
        }
        if watchdog.expired() {
            log::warn!(
                "{} still moving after {:?}; stopping",
                request.describe(),
                watchdog.ceiling()
            );
            let _ = mount.stop_guiding();
            return Err(GuideError::HardwareTimeout {
                operation: request.describe(),
                elapsed_ms: watchdog.elapsed_ms(),
            });
        }
        poll_sleep(token, &watchdog, config);
    }
}

fn ao_position(ao: &dyn StepGuider) -> (i32, i32) {
    (ao.position(GuideAxis::Axis1), ao.position(GuideAxis::Axis2))
}

fn step_guider(equipment: &Equipment) -> GuideResult<&dyn StepGuider> {
    equipment
        .step_guider
        .as_deref()
        .ok_or_else(|| GuideError::HardwareError("no AO unit connected".to_string()))
}

fn run_step(
    equipment: &Equipment,
    request: &MoveRequest,
    lane: LaneId,
    config: &WorkerConfig,
    token: &CancellationToken,
) -> MoveOutcome {
    let ao = step_guider(equipment)?;
    let before = ao.position(request.direction.axis());
    let result = if request.amount == 0 {
        StepResult::Ok
    } else {
        ao.step(request.direction, request.amount)
    };
    if result == StepResult::Error {
        return Err(GuideError::HardwareError(format!(
            "{} failed {}",
            ao.name(),
            request.describe()
        )));
    }
    wait_for_ao(ao, request, config, token)?;

    let after = ao.position(request.direction.axis());
    Ok(MoveReport {
        target: MoveTarget::StepGuider,
        direction: request.direction,
        amount_moved: after.abs_diff(before),
        limit_reached: result == StepResult::LimitReached,
        lane,
        ao_position: Some(ao_position(ao)),
    })
}

fn wait_for_ao(
    ao: &dyn StepGuider,
    request: &MoveRequest,
    config: &WorkerConfig,
    token: &CancellationToken,
) -> GuideResult<()> {
    let watchdog = Watchdog::for_move(0, config.settle_allowance_ms);
    let mut consecutive_failures = 0;
    loop {
        if token.is_interrupted() {
            return Err(GuideError::TerminateRequested);
        }
        match ao.is_moving() {
            Ok(false) => return Ok(()),
            Ok(true) => consecutive_failures = 0,
            Err(e) => {
                consecutive_failures += 1;
                if consecutive_failures >= config.max_poll_failures {
                    return Err(GuideError::HardwareError(format!("{}: {e}", ao.name())));
                }
            }
        }
        if watchdog.expired() {
            return Err(GuideError::HardwareTimeout {
                operation: request.describe(),
                elapsed_ms: watchdog.elapsed_ms(),
            });
        }
        poll_sleep(token, &watchdog, config);
    }
}

pub(crate) fn run_center(
    equipment: &Equipment,
    lane: LaneId,
    config: &WorkerConfig,
    token: &CancellationToken,
) -> MoveOutcome {
    let ao = step_guider(equipment)?;
    if ao.center() == StepResult::Error {
        return Err(GuideError::HardwareError(format!("{} failed to center", ao.name())));
    }
    let request = MoveRequest::step_guider(GuideDirection::North, 0);
    wait_for_ao(ao, &request, config, token)?;
    Ok(MoveReport {
        target: MoveTarget::StepGuider,
        direction: request.direction,
        amount_moved: 0,
        limit_reached: false,
        lane,
        ao_position: Some(ao_position(ao)),
    })
}

pub(crate) fn run_connect(equipment: &Equipment) -> GuideResult<ConnectReport> {
    equipment
        .camera
        .connect()
        .map_err(|e| GuideError::HardwareError(format!("{}: {e}", equipment.camera.name())))?;
    equipment
        .mount
        .connect()
        .map_err(|e| GuideError::HardwareError(format!("{}: {e}", equipment.mount.name())))?;
    let mut ao_max_position = None;
    let mut ao_caps = None;
    if let Some(ao) = &equipment.step_guider {
        ao.connect()
            .map_err(|e| GuideError::HardwareError(format!("{}: {e}", ao.name())))?;
        ao_max_position = Some((
            ao.max_position(GuideAxis::Axis1),
            ao.max_position(GuideAxis::Axis2),
        ));
        ao_caps = Some(ao.capabilities());
    }
    Ok(ConnectReport {
        frame_size: equipment.camera.frame_size(),
        camera: equipment.camera.capabilities(),
        mount: equipment.mount.capabilities(),
        step_guider: ao_caps,
        ao_max_position,
        declination: equipment.mount.declination(),
    })
}

pub(crate) fn run_declination(equipment: &Equipment) -> GuideResult<Option<f64>> {
    if !equipment.mount.is_connected() {
        return Err(GuideError::NotConnected);
    }
    Ok(equipment.mount.declination())
}

pub(crate) fn run_disconnect(equipment: &Equipment) -> GuideResult<()> {
    let mut failures = Vec::new();
    let _ = equipment.camera.abort_exposure();
    if let Err(e) = equipment.camera.disconnect() {
        failures.push(format!("{}: {e}", equipment.camera.name()));
    }
    if let Err(e) = equipment.mount.disconnect() {
        failures.push(format!("{}: {e}", equipment.mount.name()));
    }
    if let Some(ao) = &equipment.step_guider {
        if let Err(e) = ao.disconnect() {
            failures.push(format!("{}: {e}", ao.name()));
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(GuideError::HardwareError(failures.join("; ")))
    }
}
