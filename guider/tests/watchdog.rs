use guider::watchdog::Watchdog;
use std::thread;
use std::time::Duration;

#[test]
fn test_expires_only_after_ceiling() {
    let watchdog = Watchdog::new(100, 500);
    thread::sleep(Duration::from_millis(150));
    assert!(!watchdog.expired(), "past nominal but inside the ceiling");

    thread::sleep(Duration::from_millis(380));
    assert!(watchdog.expired());
    assert!(watchdog.elapsed_ms() >= 500);
    assert_eq!(watchdog.remaining(), Duration::ZERO);

    thread::sleep(Duration::from_millis(20));
    assert!(watchdog.expired(), "expiry never reverts");
}

#[test]
fn test_capture_and_move_allowances() {
    let capture = Watchdog::capture(2000, 15_000);
    assert_eq!(capture.nominal(), Duration::from_millis(2000));
    assert_eq!(capture.ceiling(), Duration::from_millis(17_000));

    let pulse = Watchdog::for_move(750, 5000);
    assert_eq!(pulse.ceiling(), Duration::from_millis(5750));
    assert!(!pulse.expired());
}
