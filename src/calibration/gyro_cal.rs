//! Online gyroscope-bias calibration.
//!
//! The estimator watches accelerometer, gyroscope, and (optionally)
//! magnetometer samples through per-sensor stillness detectors. After every
//! sample a device-stillness check combines the detector confidences with a
//! window-mean stability gate and a temperature gate; a sufficiently long
//! run of accepted windows ends in a new bias estimate taken from the
//! gyroscope's accumulated window mean.
//!
//! Units: rad/s (gyro), m/s^2 (accel), uT (mag), nanoseconds, Celsius.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::calibration::debug::{DebugReporter, DebugSnapshot};
use crate::calibration::stillness::StillnessDetector;
use crate::calibration::trackers::{TemperatureTracker, TrackerCommand, WindowMeanTracker};

/// Largest credible bias correction. Estimates with any axis at or beyond
/// this magnitude are rejected outright.
pub const MAX_GYRO_BIAS: f32 = 0.1; // [rad/s]

/// Unit conversion for diagnostics.
const RAD_TO_MILLI_DEGREES: f32 = 1.0e3 * 180.0 / std::f32::consts::PI;

// =============================================================================
// PARAMETERS
// =============================================================================

/// Tuning parameters for [`GyroCal`]. The defaults suit a phone-class IMU;
/// load device-specific values from configuration where available.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GyroCalParams {
    /// Shortest stillness period that may produce a calibration.
    pub min_still_duration_nanos: u64,
    /// Stillness period length that forces an emission and a fresh period.
    pub max_still_duration_nanos: u64,
    /// Duration of one stillness processing window.
    pub window_time_duration_nanos: u64,
    /// Bias recalled from storage, applied until the first online estimate.
    pub initial_bias: [f32; 3],
    /// Timestamp of the recalled bias.
    pub calibration_time_nanos: u64,
    pub gyro_var_threshold: f32,
    pub gyro_confidence_delta: f32,
    pub accel_var_threshold: f32,
    pub accel_confidence_delta: f32,
    pub mag_var_threshold: f32,
    pub mag_confidence_delta: f32,
    /// Combined confidence required to call the device still.
    pub stillness_threshold: f32,
    /// Allowed drift of the gyro window means within one stillness period.
    pub stillness_mean_delta_limit: f32,
    /// Allowed temperature range within one stillness period.
    pub temperature_delta_limit_celsius: f32,
    /// Whether [`GyroCal::remove_bias`] subtracts the estimate.
    pub gyro_calibration_enable: bool,
    /// Enables the throttled diagnostic reporter.
    pub debug_enabled: bool,
}

impl Default for GyroCalParams {
    fn default() -> Self {
        GyroCalParams {
            min_still_duration_nanos: 5_000_000_000,
            max_still_duration_nanos: 6_000_000_000,
            window_time_duration_nanos: 1_500_000_000,
            initial_bias: [0.0; 3],
            calibration_time_nanos: 0,
            gyro_var_threshold: 5.0e-5,
            gyro_confidence_delta: 1.0e-5,
            accel_var_threshold: 8.0e-3,
            accel_confidence_delta: 1.6e-3,
            mag_var_threshold: 1.4,
            mag_confidence_delta: 0.25,
            stillness_threshold: 0.95,
            stillness_mean_delta_limit: 9.0e-4,
            temperature_delta_limit_celsius: 1.5,
            gyro_calibration_enable: true,
            debug_enabled: false,
        }
    }
}

// =============================================================================
// CALIBRATION STATE
// =============================================================================

/// The calibration state machine. One instance per gyroscope; nothing here
/// is shared or hidden in statics, so independent calibrators can coexist.
pub struct GyroCal {
    // Tuned durations and gates.
    min_still_duration_nanos: u64,
    max_still_duration_nanos: u64,
    window_time_duration_nanos: u64,
    gyro_watchdog_timeout_duration_nanos: u64,
    stillness_threshold: f32,
    gyro_calibration_enable: bool,

    // Per-sensor stillness detectors.
    gyro_stillness_detect: StillnessDetector,
    accel_stillness_detect: StillnessDetector,
    mag_stillness_detect: StillnessDetector,

    // Stillness-period trackers.
    temperature_tracker: TemperatureTracker,
    mean_tracker: WindowMeanTracker,

    // Most recent calibration.
    bias: [f32; 3],
    bias_temperature_celsius: f32,
    calibration_time_nanos: u64,
    stillness_confidence: f32,
    new_gyro_cal_available: bool,

    // Gate state.
    prev_still: bool,
    start_still_time_nanos: u64,
    /// Zero means data collection is not armed; the first gyro sample after
    /// init or a watchdog reset re-arms it.
    stillness_win_endtime_nanos: u64,
    /// Zero means the watchdog is disarmed.
    gyro_watchdog_start_nanos: u64,
    gyro_watchdog_timeout: bool,
    using_mag_sensor: bool,

    debug: Option<DebugReporter>,
}

impl GyroCal {
    pub fn new(params: &GyroCalParams) -> Self {
        if params.gyro_calibration_enable {
            debug!("online gyroscope calibration enabled");
        } else {
            debug!("online gyroscope calibration disabled");
        }
        GyroCal {
            min_still_duration_nanos: params.min_still_duration_nanos,
            max_still_duration_nanos: params.max_still_duration_nanos,
            window_time_duration_nanos: params.window_time_duration_nanos,
            gyro_watchdog_timeout_duration_nanos: 2 * params.window_time_duration_nanos,
            stillness_threshold: params.stillness_threshold,
            gyro_calibration_enable: params.gyro_calibration_enable,
            gyro_stillness_detect: StillnessDetector::new(
                params.gyro_var_threshold,
                params.gyro_confidence_delta,
            ),
            accel_stillness_detect: StillnessDetector::new(
                params.accel_var_threshold,
                params.accel_confidence_delta,
            ),
            mag_stillness_detect: StillnessDetector::new(
                params.mag_var_threshold,
                params.mag_confidence_delta,
            ),
            temperature_tracker: TemperatureTracker::new(params.temperature_delta_limit_celsius),
            mean_tracker: WindowMeanTracker::new(params.stillness_mean_delta_limit),
            bias: params.initial_bias,
            bias_temperature_celsius: 0.0,
            calibration_time_nanos: params.calibration_time_nanos,
            stillness_confidence: 0.0,
            new_gyro_cal_available: false,
            prev_still: false,
            start_still_time_nanos: 0,
            stillness_win_endtime_nanos: 0,
            gyro_watchdog_start_nanos: 0,
            gyro_watchdog_timeout: false,
            using_mag_sensor: false,
            debug: params.debug_enabled.then(DebugReporter::new),
        }
    }

    // =========================================================================
    // PUBLIC API
    // =========================================================================

    /// The current bias and the mean temperature it was computed at.
    pub fn get_bias(&self) -> ([f32; 3], f32) {
        (self.bias, self.bias_temperature_celsius)
    }

    /// Recall a bias calibration (e.g. from persistent storage).
    pub fn set_bias(&mut self, bias: [f32; 3], calibration_time_nanos: u64) {
        self.bias = bias;
        self.calibration_time_nanos = calibration_time_nanos;
        debug!(
            "recalled bias [mdps]: {:.6}, {:.6}, {:.6}",
            bias[0] * RAD_TO_MILLI_DEGREES,
            bias[1] * RAD_TO_MILLI_DEGREES,
            bias[2] * RAD_TO_MILLI_DEGREES
        );
    }

    /// True once per emission: reading the flag clears it.
    pub fn new_bias_available(&mut self) -> bool {
        let available = self.gyro_calibration_enable && self.new_gyro_cal_available;
        self.new_gyro_cal_available = false;
        available
    }

    /// Subtract the bias from a gyro measurement. When calibration is
    /// disabled the input passes through unchanged.
    pub fn remove_bias(&self, sample: [f32; 3]) -> [f32; 3] {
        if self.gyro_calibration_enable {
            [
                sample[0] - self.bias[0],
                sample[1] - self.bias[1],
                sample[2] - self.bias[2],
            ]
        } else {
            sample
        }
    }

    /// Feed one gyroscope sample [rad/s] with the sensor temperature.
    pub fn update_gyro(
        &mut self,
        sample_time_nanos: u64,
        sample: [f32; 3],
        temperature_celsius: f32,
    ) {
        // First sample after init or a watchdog reset: arm the collection
        // window and the watchdog.
        if self.stillness_win_endtime_nanos == 0 {
            self.stillness_win_endtime_nanos =
                sample_time_nanos + self.window_time_duration_nanos;
            self.gyro_watchdog_start_nanos = sample_time_nanos;
        }

        self.temperature_tracker
            .command(TrackerCommand::Update, temperature_celsius);

        if let Some(reporter) = &mut self.debug {
            reporter.sampling_rate_update(sample_time_nanos);
        }

        self.gyro_stillness_detect.update(
            self.stillness_win_endtime_nanos,
            sample_time_nanos,
            sample,
        );
        self.device_stillness_check(sample_time_nanos);
    }

    /// Feed one accelerometer sample [m/s^2].
    pub fn update_accel(&mut self, sample_time_nanos: u64, sample: [f32; 3]) {
        self.accel_stillness_detect.update(
            self.stillness_win_endtime_nanos,
            sample_time_nanos,
            sample,
        );
        self.device_stillness_check(sample_time_nanos);
    }

    /// Feed one magnetometer sample [uT]. The first sample opts the
    /// magnetometer into the stillness decision.
    pub fn update_mag(&mut self, sample_time_nanos: u64, sample: [f32; 3]) {
        self.mag_stillness_detect.update(
            self.stillness_win_endtime_nanos,
            sample_time_nanos,
            sample,
        );
        self.using_mag_sensor = true;
        self.device_stillness_check(sample_time_nanos);
    }

    /// Run the throttled diagnostic reporter, if enabled.
    pub fn debug_print(&mut self, timestamp_nanos: u64) {
        if let Some(reporter) = &mut self.debug {
            reporter.print(timestamp_nanos);
        }
    }

    // Introspection used by hosts and tests.

    pub fn calibration_time_nanos(&self) -> u64 {
        self.calibration_time_nanos
    }

    pub fn start_still_time_nanos(&self) -> u64 {
        self.start_still_time_nanos
    }

    /// Combined stillness confidence of the emitting period, in [0, 1].
    pub fn stillness_confidence(&self) -> f32 {
        self.stillness_confidence
    }

    /// Sticky flag: a watchdog timeout occurred at some point.
    pub fn watchdog_timed_out(&self) -> bool {
        self.gyro_watchdog_timeout
    }

    pub fn using_mag_sensor(&self) -> bool {
        self.using_mag_sensor
    }

    // =========================================================================
    // STILLNESS GATE
    // =========================================================================

    /// Combine all detector states into a device-stillness decision and run
    /// the period state machine. Called after every sensor sample.
    fn device_stillness_check(&mut self, sample_time_nanos: u64) {
        self.check_watchdog(sample_time_nanos);

        // Wait until every participating sensor closed its window.
        if (self.using_mag_sensor && !self.mag_stillness_detect.stillness_window_ready)
            || !self.accel_stillness_detect.stillness_window_ready
            || !self.gyro_stillness_detect.stillness_window_ready
        {
            return;
        }

        // Set the next window end-time for the stillness detectors.
        self.stillness_win_endtime_nanos =
            sample_time_nanos + self.window_time_duration_nanos;

        self.accel_stillness_detect.compute_confidence();
        self.gyro_stillness_detect.compute_confidence();
        if self.using_mag_sensor {
            self.mag_stillness_detect.compute_confidence();
        } else {
            // No magnetometer in play: it must not veto stillness.
            self.mag_stillness_detect.stillness_confidence = 1.0;
        }

        let gyro_mean = self.gyro_stillness_detect.win_mean();
        self.mean_tracker.command(TrackerCommand::Update, &gyro_mean);

        let conf_not_rot = self.gyro_stillness_detect.stillness_confidence
            * self.mag_stillness_detect.stillness_confidence;
        let conf_not_accel = self.accel_stillness_detect.stillness_confidence;
        let conf_still = conf_not_rot * conf_not_accel;

        let mean_not_stable = self.mean_tracker.command(TrackerCommand::Evaluate, &[0.0; 3]);
        let min_max_temp_exceeded = self.temperature_tracker.command(TrackerCommand::Evaluate, 0.0);
        if mean_not_stable {
            debug!("gyro window means drifted beyond the stillness limit");
        }
        if min_max_temp_exceeded {
            debug!("temperature varied beyond the stillness limit");
        }

        let device_is_still = conf_still > self.stillness_threshold
            && !mean_not_stable
            && !min_max_temp_exceeded;

        if device_is_still {
            if !self.prev_still {
                // A new stillness period begins at the start of the window
                // that just closed.
                self.start_still_time_nanos = self.gyro_stillness_detect.window_start_time;
            }

            let stillness_duration_exceeded = self
                .gyro_stillness_detect
                .last_sample_time
                .saturating_sub(self.start_still_time_nanos)
                > self.max_still_duration_nanos;

            self.mean_tracker.command(TrackerCommand::Store, &[0.0; 3]);
            self.temperature_tracker.command(TrackerCommand::Store, 0.0);

            if stillness_duration_exceeded {
                // Period ran too long: calibrate with what we have and force
                // a fresh period.
                let calibration_time = self.gyro_stillness_detect.last_sample_time;
                self.reset_detectors(true);
                self.mean_tracker.command(TrackerCommand::Reset, &[0.0; 3]);
                self.temperature_tracker.command(TrackerCommand::Reset, 0.0);
                self.compute_gyro_cal(calibration_time);
                if let Some(reporter) = &mut self.debug {
                    reporter.sampling_rate_reset();
                }
                self.prev_still = false;
            } else {
                // Extend the period; the detectors keep their accumulators.
                self.reset_detectors(false);
                self.prev_still = true;
            }
        } else {
            // Motion detected. Calibrate from the snapshotted means if the
            // period that just ended lasted long enough.
            let stillness_duration_too_short = self
                .gyro_stillness_detect
                .window_start_time
                .saturating_sub(self.start_still_time_nanos)
                < self.min_still_duration_nanos;

            if self.prev_still && !stillness_duration_too_short {
                self.compute_gyro_cal(self.gyro_stillness_detect.window_start_time);
            }

            self.reset_detectors(true);
            self.temperature_tracker.command(TrackerCommand::Reset, 0.0);
            self.mean_tracker.command(TrackerCommand::Reset, &[0.0; 3]);
            if let Some(reporter) = &mut self.debug {
                reporter.sampling_rate_reset();
            }
            self.prev_still = false;
        }

        // Data was processed; push the watchdog out.
        self.gyro_watchdog_start_nanos = sample_time_nanos;
    }

    /// 2x window duration without gyro samples resets everything to a known
    /// state; the next gyro sample re-arms collection.
    fn check_watchdog(&mut self, sample_time_nanos: u64) {
        if self.gyro_watchdog_start_nanos == 0 {
            return;
        }
        let timed_out = sample_time_nanos
            > self.gyro_watchdog_timeout_duration_nanos + self.gyro_watchdog_start_nanos;
        if !timed_out {
            return;
        }

        let mag_window_ready = self.mag_stillness_detect.stillness_window_ready;

        self.reset_detectors(true);
        self.temperature_tracker.command(TrackerCommand::Reset, 0.0);
        self.mean_tracker.command(TrackerCommand::Reset, &[0.0; 3]);
        self.stillness_win_endtime_nanos = 0;

        self.accel_stillness_detect.prev_stillness_confidence = 0.0;
        self.gyro_stillness_detect.prev_stillness_confidence = 0.0;
        self.mag_stillness_detect.prev_stillness_confidence = 0.0;
        self.stillness_confidence = 0.0;
        self.prev_still = false;

        // A magnetometer that stopped producing windows must not block the
        // gate forever.
        if self.using_mag_sensor && !mag_window_ready {
            self.using_mag_sensor = false;
            debug!("magnetometer went quiet; continuing without it");
        }

        self.gyro_watchdog_timeout = true;
        self.gyro_watchdog_start_nanos = 0;
        if let Some(reporter) = &mut self.debug {
            reporter.sampling_rate_reset();
            reporter.record_watchdog(sample_time_nanos);
        }
    }

    fn reset_detectors(&mut self, reset_stats: bool) {
        self.accel_stillness_detect.reset(reset_stats);
        self.gyro_stillness_detect.reset(reset_stats);
        self.mag_stillness_detect.reset(reset_stats);
    }

    // =========================================================================
    // BIAS COMPUTER
    // =========================================================================

    /// Accept or reject the period's accumulated gyro mean as the new bias.
    fn compute_gyro_cal(&mut self, calibration_time_nanos: u64) {
        let mean = self.gyro_stillness_detect.prev_mean();
        if mean.iter().any(|m| m.abs() >= MAX_GYRO_BIAS) {
            debug!(
                "rejected bias estimate [mdps]: {:.6}, {:.6}, {:.6} at {}",
                mean[0] * RAD_TO_MILLI_DEGREES,
                mean[1] * RAD_TO_MILLI_DEGREES,
                mean[2] * RAD_TO_MILLI_DEGREES,
                calibration_time_nanos
            );
            // Out of range: keep the previous calibration.
            return;
        }

        self.bias = mean;
        self.bias_temperature_celsius = self.temperature_tracker.stored_mean();
        self.calibration_time_nanos = calibration_time_nanos;
        self.stillness_confidence = self.gyro_stillness_detect.prev_stillness_confidence
            * self.accel_stillness_detect.prev_stillness_confidence
            * self.mag_stillness_detect.prev_stillness_confidence;
        self.new_gyro_cal_available = true;

        if self.debug.is_some() {
            let snapshot = self.debug_snapshot();
            if let Some(reporter) = &mut self.debug {
                reporter.record_calibration(snapshot);
            }
        }
    }

    fn debug_snapshot(&self) -> DebugSnapshot {
        let (winmean_min, winmean_max) = self.mean_tracker.stored_extrema();
        DebugSnapshot {
            calibration: self.bias,
            accel_stillness_conf: self.accel_stillness_detect.prev_stillness_confidence,
            gyro_stillness_conf: self.gyro_stillness_detect.prev_stillness_confidence,
            mag_stillness_conf: self.mag_stillness_detect.prev_stillness_confidence,
            using_mag_sensor: self.using_mag_sensor,
            start_still_time_nanos: self.start_still_time_nanos,
            end_still_time_nanos: self.calibration_time_nanos,
            accel_mean: self.accel_stillness_detect.prev_mean(),
            gyro_mean: self.gyro_stillness_detect.prev_mean(),
            mag_mean: self.mag_stillness_detect.prev_mean(),
            accel_var: self.accel_stillness_detect.win_var(),
            gyro_var: self.gyro_stillness_detect.win_var(),
            mag_var: self.mag_stillness_detect.win_var(),
            temperature_mean_celsius: self.temperature_tracker.stored_mean(),
            temperature_min_max_celsius: self.temperature_tracker.stored_min_max(),
            gyro_winmean_min: winmean_min,
            gyro_winmean_max: winmean_max,
        }
    }
}
