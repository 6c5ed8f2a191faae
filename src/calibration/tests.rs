//! Calibration scenario tests: stillness emission, rejection, watchdog
//! recovery, and the stability gates, driven with synthetic 100 Hz sensor
//! data.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::gyro_cal::{GyroCal, GyroCalParams};

const MS: u64 = 1_000_000;
const SEC: u64 = 1_000_000_000;
const SAMPLE_PERIOD: u64 = 10 * MS; // 100 Hz

/// First sample timestamp. Nonzero so the watchdog arms on the first sample.
const T0: u64 = 10 * MS;

/// One recorded emission: bias, bias temperature, calibration timestamp.
type Emission = ([f32; 3], f32, u64);

fn scenario_params() -> GyroCalParams {
    GyroCalParams {
        window_time_duration_nanos: 500 * MS,
        min_still_duration_nanos: 2 * SEC,
        max_still_duration_nanos: 10 * SEC,
        ..GyroCalParams::default()
    }
}

/// Feed still gyro + accel samples at 100 Hz and poll for emissions.
/// Returns the timestamp after the last sample.
fn feed_still(
    cal: &mut GyroCal,
    rng: &mut StdRng,
    start_nanos: u64,
    duration_nanos: u64,
    gyro_mean: [f32; 3],
    temperature_celsius: f32,
    emissions: &mut Vec<Emission>,
) -> u64 {
    let end = start_nanos + duration_nanos;
    let mut t = start_nanos;
    while t <= end {
        let gyro = [
            gyro_mean[0] + rng.gen_range(-1.0e-5..1.0e-5),
            gyro_mean[1] + rng.gen_range(-1.0e-5..1.0e-5),
            gyro_mean[2] + rng.gen_range(-1.0e-5..1.0e-5),
        ];
        cal.update_gyro(t, gyro, temperature_celsius);
        let accel = [
            rng.gen_range(-1.0e-3..1.0e-3),
            rng.gen_range(-1.0e-3..1.0e-3),
            9.81 + rng.gen_range(-1.0e-3..1.0e-3),
        ];
        cal.update_accel(t, accel);
        poll(cal, emissions);
        t += SAMPLE_PERIOD;
    }
    t
}

/// Feed violently alternating gyro samples (clear motion) for `duration`.
fn feed_motion(
    cal: &mut GyroCal,
    start_nanos: u64,
    duration_nanos: u64,
    emissions: &mut Vec<Emission>,
) -> u64 {
    let end = start_nanos + duration_nanos;
    let mut t = start_nanos;
    let mut sign = 1.0f32;
    while t <= end {
        cal.update_gyro(t, [0.5 * sign, 0.5 * sign, 0.5 * sign], 25.0);
        cal.update_accel(t, [0.0, 0.0, 9.81]);
        poll(cal, emissions);
        sign = -sign;
        t += SAMPLE_PERIOD;
    }
    t
}

fn poll(cal: &mut GyroCal, emissions: &mut Vec<Emission>) {
    if cal.new_bias_available() {
        let (bias, temperature) = cal.get_bias();
        emissions.push((bias, temperature, cal.calibration_time_nanos()));
    }
}

/// Scenario: ten-plus seconds of genuine stillness forces exactly one
/// emission (via the max-duration path) with the injected gyro mean as the
/// bias estimate.
#[test]
fn test_stillness_emits_bias() {
    let params = scenario_params();
    let mut cal = GyroCal::new(&params);
    let mut rng = StdRng::seed_from_u64(42);
    let mut emissions = Vec::new();

    feed_still(
        &mut cal,
        &mut rng,
        T0,
        10_600 * MS,
        [0.001, 0.001, 0.001],
        25.0,
        &mut emissions,
    );

    assert_eq!(emissions.len(), 1, "expected exactly one emission");
    let (bias, temperature, calibration_time) = emissions[0];
    for axis in 0..3 {
        assert!(
            (bias[axis] - 0.001).abs() < 1.0e-4,
            "axis {} bias {} too far from injected mean",
            axis,
            bias[axis]
        );
        assert!(bias[axis].abs() < super::MAX_GYRO_BIAS);
    }
    assert!((temperature - 25.0).abs() < 1.0e-3);

    // Emission envelope: at least the minimum duration, at most the maximum
    // plus the window that detected the overshoot.
    let elapsed = calibration_time - cal.start_still_time_nanos();
    assert!(elapsed >= params.min_still_duration_nanos);
    assert!(elapsed <= params.max_still_duration_nanos + params.window_time_duration_nanos);

    let confidence = cal.stillness_confidence();
    assert!((0.0..=1.0).contains(&confidence));

    // Read-and-clear: the flag was consumed by the poll above.
    assert!(!cal.new_bias_available());
    assert!(!cal.new_bias_available());
}

/// Scenario: a mean far outside the credible bias range is rejected; the
/// prior calibration survives untouched.
#[test]
fn test_excessive_bias_is_rejected() {
    let params = scenario_params();
    let mut cal = GyroCal::new(&params);
    let mut rng = StdRng::seed_from_u64(43);
    let mut emissions = Vec::new();

    feed_still(
        &mut cal,
        &mut rng,
        T0,
        10_600 * MS,
        [0.15, 0.0, 0.0],
        25.0,
        &mut emissions,
    );

    assert!(emissions.is_empty());
    assert!(!cal.new_bias_available());
    let (bias, _) = cal.get_bias();
    assert_eq!(bias, [0.0, 0.0, 0.0]);
}

/// Scenario: a gap of more than twice the window duration trips the
/// watchdog; no emission spans the gap and the next stillness period starts
/// strictly after it.
#[test]
fn test_watchdog_recovery() {
    let params = scenario_params();
    let mut cal = GyroCal::new(&params);
    let mut rng = StdRng::seed_from_u64(44);
    let mut emissions = Vec::new();

    // 300 ms of data, then silence for 2 x window + 1 ms.
    let gap_start = feed_still(
        &mut cal,
        &mut rng,
        T0,
        300 * MS,
        [0.001, 0.001, 0.001],
        25.0,
        &mut emissions,
    );
    let gap_end = gap_start + 2 * params.window_time_duration_nanos + MS;

    // Six seconds of stillness after the gap, ended by motion.
    let resumed = feed_still(
        &mut cal,
        &mut rng,
        gap_end,
        6 * SEC,
        [0.001, 0.001, 0.001],
        25.0,
        &mut emissions,
    );
    feed_motion(&mut cal, resumed, 700 * MS, &mut emissions);

    assert!(cal.watchdog_timed_out());
    assert_eq!(emissions.len(), 1);
    assert!(
        cal.start_still_time_nanos() > gap_end,
        "stillness period {} must start after the gap ending at {}",
        cal.start_still_time_nanos(),
        gap_end
    );
    let (bias, _, _) = emissions[0];
    for axis in 0..3 {
        assert!((bias[axis] - 0.001).abs() < 1.0e-4);
    }
}

/// A still period ended by motion before the minimum duration produces
/// nothing.
#[test]
fn test_too_short_stillness_does_not_emit() {
    let params = scenario_params();
    let mut cal = GyroCal::new(&params);
    let mut rng = StdRng::seed_from_u64(45);
    let mut emissions = Vec::new();

    let end = feed_still(
        &mut cal,
        &mut rng,
        T0,
        1_500 * MS,
        [0.001, 0.001, 0.001],
        25.0,
        &mut emissions,
    );
    feed_motion(&mut cal, end, 700 * MS, &mut emissions);
    assert!(emissions.is_empty());
}

/// A still period ended by motion after the minimum duration emits from the
/// snapshotted window means.
#[test]
fn test_motion_end_emits_from_snapshot() {
    let params = scenario_params();
    let mut cal = GyroCal::new(&params);
    let mut rng = StdRng::seed_from_u64(46);
    let mut emissions = Vec::new();

    let end = feed_still(
        &mut cal,
        &mut rng,
        T0,
        4 * SEC,
        [0.002, -0.001, 0.0005],
        25.0,
        &mut emissions,
    );
    feed_motion(&mut cal, end, 700 * MS, &mut emissions);

    assert_eq!(emissions.len(), 1);
    let (bias, _, calibration_time) = emissions[0];
    assert!((bias[0] - 0.002).abs() < 1.0e-4);
    assert!((bias[1] + 0.001).abs() < 1.0e-4);
    assert!((bias[2] - 0.0005).abs() < 1.0e-4);

    let elapsed = calibration_time - cal.start_still_time_nanos();
    assert!(elapsed >= params.min_still_duration_nanos);
}

/// Temperature drifting past the limit keeps tearing the period down before
/// it reaches the minimum duration: no emission.
#[test]
fn test_temperature_gate_blocks_emission() {
    let params = scenario_params();
    let mut cal = GyroCal::new(&params);
    let mut rng = StdRng::seed_from_u64(47);
    let mut emissions = Vec::new();

    let end = T0 + 5 * SEC;
    let mut t = T0;
    while t <= end {
        // 1.2 C/s ramp: the 1.5 C budget is spent before the 2 s minimum.
        let temperature = 25.0 + ((t - T0) as f32 * 1.2e-9);
        let gyro = [
            0.001 + rng.gen_range(-1.0e-5..1.0e-5),
            0.001 + rng.gen_range(-1.0e-5..1.0e-5),
            0.001 + rng.gen_range(-1.0e-5..1.0e-5),
        ];
        cal.update_gyro(t, gyro, temperature);
        cal.update_accel(t, [0.0, 0.0, 9.81]);
        poll(&mut cal, &mut emissions);
        t += SAMPLE_PERIOD;
    }

    assert!(emissions.is_empty());
}

/// A drifting gyro mean (invisible to the variance detectors) trips the
/// mean-stability gate instead.
#[test]
fn test_mean_stability_gate_blocks_emission() {
    let params = scenario_params();
    let mut cal = GyroCal::new(&params);
    let mut rng = StdRng::seed_from_u64(48);
    let mut emissions = Vec::new();

    let end = T0 + 5 * SEC;
    let mut t = T0;
    while t <= end {
        // Slow ramp: 0.002 rad/s per second.
        let drift = (t - T0) as f32 * 2.0e-12;
        let gyro = [
            drift + rng.gen_range(-1.0e-5..1.0e-5),
            rng.gen_range(-1.0e-5..1.0e-5),
            rng.gen_range(-1.0e-5..1.0e-5),
        ];
        cal.update_gyro(t, gyro, 25.0);
        cal.update_accel(t, [0.0, 0.0, 9.81]);
        poll(&mut cal, &mut emissions);
        t += SAMPLE_PERIOD;
    }

    assert!(emissions.is_empty());
}

/// A magnetometer that goes quiet would block the gate forever; the watchdog
/// drops it from the decision and calibration proceeds without it.
#[test]
fn test_mag_dropout_disables_mag_participation() {
    let params = scenario_params();
    let mut cal = GyroCal::new(&params);
    let mut rng = StdRng::seed_from_u64(49);
    let mut emissions = Vec::new();

    // A few mag samples right after the start, then silence from the mag.
    let mut t = T0;
    for _ in 0..3 {
        cal.update_gyro(t, [0.001, 0.001, 0.001], 25.0);
        cal.update_accel(t, [0.0, 0.0, 9.81]);
        cal.update_mag(t, [20.0, -5.0, 42.0]);
        t += SAMPLE_PERIOD;
    }
    assert!(cal.using_mag_sensor());

    // Gyro/accel keep flowing; windows cannot complete while the mag is
    // required, so the watchdog eventually fires and drops it.
    let end = feed_still(
        &mut cal,
        &mut rng,
        t,
        4 * SEC,
        [0.001, 0.001, 0.001],
        25.0,
        &mut emissions,
    );
    assert!(cal.watchdog_timed_out());
    assert!(!cal.using_mag_sensor());

    feed_motion(&mut cal, end, 700 * MS, &mut emissions);
    assert_eq!(emissions.len(), 1);
}

#[test]
fn test_set_get_bias_roundtrip() {
    let mut cal = GyroCal::new(&GyroCalParams::default());
    cal.set_bias([0.01, -0.02, 0.003], 123_456_789);
    let (bias, _) = cal.get_bias();
    assert_eq!(bias, [0.01, -0.02, 0.003]);
    assert_eq!(cal.calibration_time_nanos(), 123_456_789);
    // Recalling a bias is not an online emission.
    assert!(!cal.new_bias_available());
}

#[test]
fn test_remove_bias_subtracts_when_enabled() {
    let mut cal = GyroCal::new(&GyroCalParams::default());
    cal.set_bias([0.01, -0.02, 0.003], 1);
    let out = cal.remove_bias([0.1, 0.1, 0.1]);
    assert!((out[0] - 0.09).abs() < 1.0e-6);
    assert!((out[1] - 0.12).abs() < 1.0e-6);
    assert!((out[2] - 0.097).abs() < 1.0e-6);
}

/// With calibration disabled, measurements pass through unchanged.
#[test]
fn test_remove_bias_disabled_is_identity() {
    let params = GyroCalParams {
        gyro_calibration_enable: false,
        ..GyroCalParams::default()
    };
    let mut cal = GyroCal::new(&params);
    cal.set_bias([0.01, -0.02, 0.003], 1);
    assert_eq!(cal.remove_bias([0.1, 0.1, 0.1]), [0.1, 0.1, 0.1]);
}
