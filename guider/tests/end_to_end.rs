mod common;

use approx::assert_relative_eq;
use common::{star_frame, Sky, SkyCamera, SkyMount};
use guider::calibration::{CalibrationData, MoveUnits};
use guider::{
    FrameOutcome, GuideError, Guider, GuiderConfig, GuiderEvent, GuiderState, WorkerConfig,
};
use shared::camera_interface::mock::MockCamera;
use shared::mount_interface::mock::MockMount;
use shared::mount_interface::GuideDirection;
use std::f64::consts::FRAC_PI_2;
use std::sync::{Arc, Mutex};

fn fast_config() -> GuiderConfig {
    GuiderConfig {
        exposure_ms: 10,
        worker: WorkerConfig {
            poll_interval_ms: 5,
            ..WorkerConfig::default()
        },
        dither_seed: Some(7),
        ..GuiderConfig::default()
    }
}

fn square_calibration(rate: f64) -> CalibrationData {
    CalibrationData {
        ra_angle: 0.0,
        dec_angle: FRAC_PI_2,
        ra_rate: rate,
        dec_rate: rate,
        valid: true,
        step_size: 750,
        ra_steps: 10,
        dec_steps: 10,
        ..CalibrationData::invalid(MoveUnits::Milliseconds)
    }
}

fn record_events(guider: &Guider) -> Arc<Mutex<Vec<GuiderEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    guider.register_callback(move |event| sink.lock().unwrap().push(event.clone()));
    events
}

#[test]
fn test_star_lost_drops_lock_without_moving() {
    let _ = env_logger::builder().is_test(true).try_init();

    let frames = vec![
        star_frame(128, 128, Some((64.0, 64.0)), 20_000.0, 1),
        star_frame(128, 128, Some((65.5, 64.0)), 20_000.0, 2),
        star_frame(128, 128, None, 0.0, 3),
    ];
    let camera = Arc::new(MockCamera::new(frames).with_time_scale(0.0));
    let mount = Arc::new(MockMount::new());
    let equipment = guider::Equipment::new(camera, mount.clone());
    let mut guider = Guider::new(equipment, fast_config()).unwrap();
    let events = record_events(&guider);

    guider.connect().unwrap();
    guider.set_lock_position(64.0, 64.0).unwrap();
    guider.set_calibration(square_calibration(0.01)).unwrap();
    guider.start_guiding().unwrap();
    assert_eq!(guider.state(), GuiderState::Guiding);

    let FrameOutcome::Guided(first) = guider.process_frame().unwrap() else {
        panic!("expected a guide step");
    };
    assert!(first.camera_offset.0.abs() < 0.2);
    assert!(first.camera_offset.1.abs() < 0.2);

    let FrameOutcome::Guided(second) = guider.process_frame().unwrap() else {
        panic!("expected a guide step");
    };
    assert_relative_eq!(second.camera_offset.0, 1.5, epsilon = 0.2);
    assert_eq!(second.axis1.direction, Some(GuideDirection::East));
    assert!(second.axis1.amount > 0);
    let pulses_before_loss = mount.pulses().len();
    assert!(pulses_before_loss >= 1);
    assert_eq!(
        mount.pulses().last().map(|p| p.direction),
        Some(GuideDirection::East)
    );

    let result = guider.process_frame();
    assert!(matches!(result, Err(GuideError::StarLost)));
    assert_eq!(guider.state(), GuiderState::Selecting);
    assert!(guider.lock_position().is_none());
    assert_eq!(mount.pulses().len(), pulses_before_loss);
    assert_eq!(guider.history().len(), 2);

    let events = events.lock().unwrap();
    assert!(events
        .iter()
        .any(|e| matches!(e, GuiderEvent::StarLost { frame_number: 3, .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        GuiderEvent::StateChanged {
            from: GuiderState::Guiding,
            to: GuiderState::Selecting
        }
    )));
}

#[test]
fn test_calibrate_then_guide_out_offset() {
    let _ = env_logger::builder().is_test(true).try_init();

    let rate = 0.005;
    let sky = Sky::new(60.0, 60.0, rate);
    let camera = Arc::new(SkyCamera::new(sky.clone(), 160, 160));
    let mount = Arc::new(SkyMount::new(sky.clone()));
    let equipment = guider::Equipment::new(camera, mount.clone());
    let mut guider = Guider::new(equipment, fast_config()).unwrap();
    let events = record_events(&guider);

    guider.connect().unwrap();
    let star = guider.auto_select_star(None).unwrap();
    assert_relative_eq!(star.x, 60.0, epsilon = 0.3);
    assert_relative_eq!(star.y, 60.0, epsilon = 0.3);
    assert_eq!(guider.state(), GuiderState::Selected);

    guider.run_calibration().unwrap();
    assert_eq!(guider.state(), GuiderState::Calibrated);
    let cal = guider.calibration().cloned().unwrap();
    assert!(cal.valid);
    assert_relative_eq!(cal.ra_angle, 0.0, epsilon = 0.05);
    assert_relative_eq!(cal.dec_angle, FRAC_PI_2, epsilon = 0.05);
    assert_relative_eq!(cal.ra_rate, rate, max_relative = 0.1);
    assert_relative_eq!(cal.dec_rate, rate, max_relative = 0.1);
    assert!(events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, GuiderEvent::CalibrationComplete { .. })));

    // RA returns with one overshoot step. Dec keeps the backlash clearing pulses.
    let (x, y) = sky.position();
    assert!((x - 60.0).abs() < 8.0, "star left at x = {x}");
    assert!((y - 60.0).abs() < 20.0, "star left at y = {y}");

    guider.set_lock_position(x, y).unwrap();
    guider.start_guiding().unwrap();
    sky.shift(3.0, -2.0);
    for _ in 0..15 {
        guider.process_frame().unwrap();
    }
    let last = guider.history().back().cloned().unwrap();
    assert!(
        last.camera_offset.0.abs() < 0.5 && last.camera_offset.1.abs() < 0.5,
        "offset not removed: {:?}",
        last.camera_offset
    );
    let stats = guider.guide_stats();
    assert_eq!(stats.samples, 15);
    assert!(stats.ra_peak >= 2.5);
}

#[test]
fn test_dither_moves_star_to_new_lock() {
    let _ = env_logger::builder().is_test(true).try_init();

    let sky = Sky::new(80.0, 80.0, 0.01);
    let camera = Arc::new(SkyCamera::new(sky.clone(), 160, 160));
    let mount = Arc::new(SkyMount::new(sky.clone()));
    let equipment = guider::Equipment::new(camera, mount);
    let mut guider = Guider::new(equipment, fast_config()).unwrap();

    guider.connect().unwrap();
    guider.auto_select_star(None).unwrap();
    guider.set_calibration(square_calibration(0.01)).unwrap();
    guider.start_guiding().unwrap();

    let (dx, dy) = guider.dither(4.0).unwrap();
    let (lock_x, lock_y) = guider.lock_position().unwrap();
    for _ in 0..20 {
        guider.process_frame().unwrap();
    }
    let (x, y) = sky.position();
    assert!(
        (x - lock_x).abs() < 0.5 && (y - lock_y).abs() < 0.5,
        "star at ({x:.2}, {y:.2}) after dither of ({dx:.2}, {dy:.2})"
    );
}

#[test]
fn test_slew_stops_guiding() {
    let _ = env_logger::builder().is_test(true).try_init();

    let frames = vec![star_frame(128, 128, Some((70.0, 64.0)), 20_000.0, 9)];
    let camera = Arc::new(MockCamera::new(frames).with_time_scale(0.0));
    let mount = Arc::new(MockMount::new());
    let equipment = guider::Equipment::new(camera, mount.clone());
    let mut guider = Guider::new(equipment, fast_config()).unwrap();

    guider.connect().unwrap();
    guider.set_lock_position(64.0, 64.0).unwrap();
    guider.set_calibration(square_calibration(0.01)).unwrap();
    guider.start_guiding().unwrap();
    mount.set_slewing(true);

    assert!(matches!(
        guider.process_frame(),
        Err(GuideError::SlewDetected)
    ));
    assert_eq!(guider.state(), GuiderState::Selected);
    assert!(guider.lock_position().is_some());
}

#[test]
fn test_mount_error_keeps_guiding() {
    let _ = env_logger::builder().is_test(true).try_init();

    let frames = vec![star_frame(128, 128, Some((70.0, 64.0)), 20_000.0, 11)];
    let camera = Arc::new(MockCamera::new(frames).with_time_scale(0.0));
    let mount = Arc::new(MockMount::new().with_time_scale(1.0));
    let equipment = guider::Equipment::new(camera, mount.clone());
    let mut guider = Guider::new(equipment, fast_config()).unwrap();

    guider.connect().unwrap();
    guider.set_lock_position(64.0, 64.0).unwrap();
    guider.set_calibration(square_calibration(0.01)).unwrap();
    guider.start_guiding().unwrap();
    mount.fail_polls(10);

    assert!(matches!(
        guider.process_frame(),
        Err(GuideError::HardwareError(_))
    ));
    assert_eq!(guider.state(), GuiderState::Guiding);
    assert_eq!(
        guider.last_error().map(|e| e.reason_code()),
        Some(guider::ReasonCode::HardwareError)
    );
}
