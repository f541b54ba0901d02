mod common;

use approx::assert_relative_eq;
use common::star_frame;
use guider::algorithms::{AlgorithmConfig, AlgorithmKind};
use guider::backlash::BacklashConfig;
use guider::calibration::{CalibrationData, MoveUnits};
use guider::{Guider, GuiderConfig, WorkerConfig};
use shared::camera_interface::mock::MockCamera;
use shared::mount_interface::mock::MockMount;
use shared::mount_interface::{GuideAxis, GuideDirection};
use std::f64::consts::FRAC_PI_2;
use std::sync::Arc;

fn identity_config() -> GuiderConfig {
    GuiderConfig {
        exposure_ms: 10,
        worker: WorkerConfig {
            poll_interval_ms: 5,
            ..WorkerConfig::default()
        },
        ra_algorithm: AlgorithmConfig::default_for(AlgorithmKind::Identity),
        dec_algorithm: AlgorithmConfig::default_for(AlgorithmKind::Identity),
        ..GuiderConfig::default()
    }
}

fn calibration_at(declination: Option<f64>) -> CalibrationData {
    CalibrationData {
        ra_angle: 0.0,
        dec_angle: FRAC_PI_2,
        ra_rate: 0.01,
        dec_rate: 0.01,
        declination,
        valid: true,
        step_size: 750,
        ..CalibrationData::invalid(MoveUnits::Milliseconds)
    }
}

fn pulses_on(mount: &MockMount, axis: GuideAxis) -> Vec<(GuideDirection, u64)> {
    mount
        .pulses()
        .iter()
        .filter(|p| p.direction.axis() == axis)
        .map(|p| (p.direction, p.duration.as_millis() as u64))
        .collect()
}

/// Guide a single frame and return the RA pulse it produced.
fn guide_once(guider: &mut Guider, mount: &MockMount) -> u64 {
    let before = pulses_on(mount, GuideAxis::Axis1).len();
    guider.start_guiding().unwrap();
    guider.process_frame().unwrap();
    guider.stop_guiding().unwrap();
    let pulses = pulses_on(mount, GuideAxis::Axis1);
    assert_eq!(pulses.len(), before + 1);
    let (direction, ms) = pulses[before];
    assert_eq!(direction, GuideDirection::East);
    ms
}

fn offset_star_guider(mount: Arc<MockMount>, config: GuiderConfig) -> Guider {
    let frame = star_frame(128, 128, Some((70.0, 64.0)), 20_000.0, 5);
    let camera = Arc::new(MockCamera::new_repeating(frame).with_time_scale(0.0));
    let equipment = guider::Equipment::new(camera, mount);
    let mut guider = Guider::new(equipment, config).unwrap();
    guider.connect().unwrap();
    guider.set_lock_position(64.0, 64.0).unwrap();
    guider
}

#[test]
fn test_ra_pulse_grows_with_declination() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mount = Arc::new(MockMount::new().with_declination(0.0));
    let mut guider = offset_star_guider(mount.clone(), identity_config());
    guider.set_calibration(calibration_at(Some(0.0))).unwrap();

    let at_equator = guide_once(&mut guider, &mount);
    assert_relative_eq!(at_equator as f64, 600.0, max_relative = 0.05);

    mount.set_declination(Some(1.0));
    let at_one_radian = guide_once(&mut guider, &mount);
    assert_eq!(guider.guiding_declination(), Some(1.0));
    assert_relative_eq!(
        at_one_radian as f64,
        at_equator as f64 / 1.0f64.cos(),
        max_relative = 0.01
    );
}

#[test]
fn test_declination_ignored_when_disabled_or_near_pole() {
    let _ = env_logger::builder().is_test(true).try_init();

    let config = GuiderConfig {
        dec_compensation: false,
        ..identity_config()
    };
    let mount = Arc::new(MockMount::new().with_declination(0.0));
    let mut guider = offset_star_guider(mount.clone(), config);
    guider.set_calibration(calibration_at(Some(0.0))).unwrap();
    let first = guide_once(&mut guider, &mount);
    mount.set_declination(Some(1.0));
    assert_eq!(guide_once(&mut guider, &mount), first);

    // Calibrated at 70 degrees: the rate is not rescaled.
    let mount = Arc::new(MockMount::new().with_declination(1.22));
    let mut guider = offset_star_guider(mount.clone(), identity_config());
    guider.set_calibration(calibration_at(Some(1.22))).unwrap();
    let first = guide_once(&mut guider, &mount);
    mount.set_declination(Some(0.3));
    assert_eq!(guide_once(&mut guider, &mount), first);
}

#[test]
fn test_dec_reversal_gets_backlash_pulse() {
    let _ = env_logger::builder().is_test(true).try_init();

    let frames = vec![
        star_frame(128, 128, Some((64.0, 70.0)), 20_000.0, 1),
        star_frame(128, 128, Some((64.0, 58.0)), 20_000.0, 2),
        star_frame(128, 128, Some((64.0, 70.0)), 20_000.0, 3),
    ];
    let camera = Arc::new(MockCamera::new(frames).with_time_scale(0.0));
    let mount = Arc::new(MockMount::new());
    let equipment = guider::Equipment::new(camera, mount.clone());
    let config = GuiderConfig {
        backlash: BacklashConfig {
            enabled: true,
            pulse_ms: 200,
            ..BacklashConfig::default()
        },
        ..identity_config()
    };
    let mut guider = Guider::new(equipment, config).unwrap();
    guider.connect().unwrap();
    guider.set_lock_position(64.0, 64.0).unwrap();
    guider.set_calibration(calibration_at(None)).unwrap();
    guider.start_guiding().unwrap();

    for _ in 0..3 {
        guider.process_frame().unwrap();
    }

    let dec: Vec<GuideDirection> = pulses_on(&mount, GuideAxis::Axis2)
        .iter()
        .map(|(direction, _)| *direction)
        .collect();
    assert_eq!(
        dec,
        vec![
            GuideDirection::South,
            GuideDirection::North,
            GuideDirection::South
        ]
    );
    let amounts: Vec<u64> = pulses_on(&mount, GuideAxis::Axis2)
        .iter()
        .map(|(_, ms)| *ms)
        .collect();
    // No reversal yet, then 600 + 200 ms.
    assert!((amounts[0] as i64 - 600).abs() <= 10, "{amounts:?}");
    assert!((amounts[1] as i64 - 800).abs() <= 10, "{amounts:?}");
    // The 6 px overshoot after the compensated pulse shrinks it to 160 ms.
    assert_eq!(guider.backlash_pulse_ms(), 160);
    assert!((amounts[2] as i64 - 760).abs() <= 10, "{amounts:?}");
}
