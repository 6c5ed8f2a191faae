//! Throttled diagnostic reporting for the calibration engine.
//!
//! A state machine walks through the report sections with a 300 ms wait
//! between lines so slow log transports are not flooded. The snapshot buffer
//! is only rewritten while the machine is idle; a report in flight always
//! prints one consistent calibration.

use log::debug;

/// Wait between report lines.
const WAIT_TIME_NANOS: u64 = 300_000_000;

const REPORT_TAG: &str = "[GYRO_CAL:REPORT]";

/// Unit conversion for report lines.
const RAD_TO_MILLI_DEGREES: f32 = 1.0e3 * 180.0 / std::f32::consts::PI;

/// Everything a report prints, captured at emission time.
#[derive(Clone, Debug, Default)]
pub struct DebugSnapshot {
    pub calibration: [f32; 3],
    pub accel_stillness_conf: f32,
    pub gyro_stillness_conf: f32,
    pub mag_stillness_conf: f32,
    pub using_mag_sensor: bool,
    pub start_still_time_nanos: u64,
    pub end_still_time_nanos: u64,
    pub accel_mean: [f32; 3],
    pub gyro_mean: [f32; 3],
    pub mag_mean: [f32; 3],
    pub accel_var: [f32; 3],
    pub gyro_var: [f32; 3],
    pub mag_var: [f32; 3],
    pub temperature_mean_celsius: f32,
    pub temperature_min_max_celsius: [f32; 2],
    pub gyro_winmean_min: [f32; 3],
    pub gyro_winmean_max: [f32; 3],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReportState {
    Idle,
    Wait,
    PrintOffset,
    PrintStillnessData,
    PrintSampleRateAndTemperature,
    PrintGyroMinMaxStillnessMean,
    PrintAccelStats,
    PrintGyroStats,
    PrintMagStats,
}

/// Mean gyro sampling-rate estimator, part of the report.
#[derive(Clone, Debug, Default)]
struct SamplingRateEstimator {
    last_timestamp_nanos: u64,
    time_delta_accumulator: u64,
    num_samples: u64,
}

impl SamplingRateEstimator {
    fn update(&mut self, timestamp_nanos: u64) {
        // A non-monotonic timestamp restarts the estimate.
        if timestamp_nanos <= self.last_timestamp_nanos || self.last_timestamp_nanos == 0 {
            self.last_timestamp_nanos = timestamp_nanos;
            return;
        }
        self.num_samples += 1;
        self.time_delta_accumulator += timestamp_nanos - self.last_timestamp_nanos;
        self.last_timestamp_nanos = timestamp_nanos;
    }

    /// Mean rate in Hz, or -1 when there were too few samples. Resets.
    fn take_mean_hz(&mut self) -> f32 {
        let mean = if self.num_samples > 1 && self.time_delta_accumulator > 0 {
            self.num_samples as f32 / (self.time_delta_accumulator as f32 * 1.0e-9)
        } else {
            -1.0
        };
        self.reset();
        mean
    }

    fn reset(&mut self) {
        *self = SamplingRateEstimator::default();
    }
}

/// The reporter: trigger flag, snapshot buffer, counters, and the FSM.
pub struct DebugReporter {
    state: ReportState,
    next_state: ReportState,
    wait_timer_nanos: u64,
    print_trigger: bool,
    snapshot: DebugSnapshot,
    mean_sampling_rate_hz: f32,
    calibration_count: u64,
    watchdog_count: u64,
    sampling_rate: SamplingRateEstimator,
}

impl DebugReporter {
    pub fn new() -> Self {
        DebugReporter {
            state: ReportState::Idle,
            next_state: ReportState::Idle,
            wait_timer_nanos: 0,
            print_trigger: false,
            snapshot: DebugSnapshot::default(),
            mean_sampling_rate_hz: -1.0,
            calibration_count: 0,
            watchdog_count: 0,
            sampling_rate: SamplingRateEstimator::default(),
        }
    }

    pub fn sampling_rate_update(&mut self, timestamp_nanos: u64) {
        self.sampling_rate.update(timestamp_nanos);
    }

    pub fn sampling_rate_reset(&mut self) {
        self.sampling_rate.reset();
    }

    pub fn record_watchdog(&mut self, timestamp_nanos: u64) {
        self.watchdog_count += 1;
        debug!(
            "[GYRO_CAL:WATCHDOG] total#, timestamp [nsec]: {}, {}",
            self.watchdog_count, timestamp_nanos
        );
    }

    /// Buffer a freshly emitted calibration and trigger a report. Skipped
    /// while a report is printing so its data stays consistent.
    pub fn record_calibration(&mut self, snapshot: DebugSnapshot) {
        self.calibration_count += 1;
        if self.state != ReportState::Idle {
            return;
        }
        self.snapshot = snapshot;
        self.mean_sampling_rate_hz = self.sampling_rate.take_mean_hz();
        self.print_trigger = true;
    }

    /// Drive the report FSM; call periodically with a current timestamp.
    pub fn print(&mut self, timestamp_nanos: u64) {
        match self.state {
            ReportState::Idle => {
                if self.print_trigger {
                    debug!("{} calibration #{}", REPORT_TAG, self.calibration_count);
                    self.print_trigger = false;
                    self.state = ReportState::PrintOffset;
                }
            }
            ReportState::Wait => {
                if timestamp_nanos >= WAIT_TIME_NANOS + self.wait_timer_nanos {
                    self.state = self.next_state;
                }
            }
            ReportState::PrintOffset => {
                let s = &self.snapshot;
                debug!(
                    "{} cal#|offset|temp|time [mdps|C|nsec]: {}, {:.6}, {:.6}, {:.6}, {:.3}, {}",
                    REPORT_TAG,
                    self.calibration_count,
                    s.calibration[0] * RAD_TO_MILLI_DEGREES,
                    s.calibration[1] * RAD_TO_MILLI_DEGREES,
                    s.calibration[2] * RAD_TO_MILLI_DEGREES,
                    s.temperature_mean_celsius,
                    s.end_still_time_nanos
                );
                self.step(timestamp_nanos, ReportState::PrintStillnessData);
            }
            ReportState::PrintStillnessData => {
                let s = &self.snapshot;
                let mag_conf = if s.using_mag_sensor { s.mag_stillness_conf } else { -1.0 };
                debug!(
                    "{} cal#|start|end|confidence [nsec]: {}, {}, {}, {:.3}, {:.3}, {:.3}",
                    REPORT_TAG,
                    self.calibration_count,
                    s.start_still_time_nanos,
                    s.end_still_time_nanos,
                    s.gyro_stillness_conf,
                    s.accel_stillness_conf,
                    mag_conf
                );
                self.step(timestamp_nanos, ReportState::PrintSampleRateAndTemperature);
            }
            ReportState::PrintSampleRateAndTemperature => {
                let s = &self.snapshot;
                debug!(
                    "{} cal#|mean|min|max|delta|rate [C|Hz]: {}, {:.3}, {:.3}, {:.3}, {:.4}, {:.3}",
                    REPORT_TAG,
                    self.calibration_count,
                    s.temperature_mean_celsius,
                    s.temperature_min_max_celsius[0],
                    s.temperature_min_max_celsius[1],
                    s.temperature_min_max_celsius[1] - s.temperature_min_max_celsius[0],
                    self.mean_sampling_rate_hz
                );
                self.step(timestamp_nanos, ReportState::PrintGyroMinMaxStillnessMean);
            }
            ReportState::PrintGyroMinMaxStillnessMean => {
                let s = &self.snapshot;
                debug!(
                    "{} cal#|gyro peak stillness variation [mdps]: {}, {:.6}, {:.6}, {:.6}",
                    REPORT_TAG,
                    self.calibration_count,
                    (s.gyro_winmean_max[0] - s.gyro_winmean_min[0]) * RAD_TO_MILLI_DEGREES,
                    (s.gyro_winmean_max[1] - s.gyro_winmean_min[1]) * RAD_TO_MILLI_DEGREES,
                    (s.gyro_winmean_max[2] - s.gyro_winmean_min[2]) * RAD_TO_MILLI_DEGREES
                );
                self.step(timestamp_nanos, ReportState::PrintAccelStats);
            }
            ReportState::PrintAccelStats => {
                let s = &self.snapshot;
                debug!(
                    "{} cal#|accel mean|var: {}, {:.6}, {:.6}, {:.6}, {:.8}, {:.8}, {:.8}",
                    REPORT_TAG,
                    self.calibration_count,
                    s.accel_mean[0],
                    s.accel_mean[1],
                    s.accel_mean[2],
                    s.accel_var[0],
                    s.accel_var[1],
                    s.accel_var[2]
                );
                self.step(timestamp_nanos, ReportState::PrintGyroStats);
            }
            ReportState::PrintGyroStats => {
                let s = &self.snapshot;
                debug!(
                    "{} cal#|gyro mean|var [mdps]: {}, {:.6}, {:.6}, {:.6}, {:.8}, {:.8}, {:.8}",
                    REPORT_TAG,
                    self.calibration_count,
                    s.gyro_mean[0] * RAD_TO_MILLI_DEGREES,
                    s.gyro_mean[1] * RAD_TO_MILLI_DEGREES,
                    s.gyro_mean[2] * RAD_TO_MILLI_DEGREES,
                    s.gyro_var[0],
                    s.gyro_var[1],
                    s.gyro_var[2]
                );
                self.step(timestamp_nanos, ReportState::PrintMagStats);
            }
            ReportState::PrintMagStats => {
                let s = &self.snapshot;
                if s.using_mag_sensor {
                    debug!(
                        "{} cal#|mag mean|var [uT]: {}, {:.6}, {:.6}, {:.6}, {:.8}, {:.8}, {:.8}",
                        REPORT_TAG,
                        self.calibration_count,
                        s.mag_mean[0],
                        s.mag_mean[1],
                        s.mag_mean[2],
                        s.mag_var[0],
                        s.mag_var[1],
                        s.mag_var[2]
                    );
                } else {
                    debug!(
                        "{} cal#|mag mean|var [uT]: {}, 0, 0, 0, -1.0, -1.0, -1.0",
                        REPORT_TAG, self.calibration_count
                    );
                }
                self.step(timestamp_nanos, ReportState::Idle);
            }
        }
    }

    fn step(&mut self, timestamp_nanos: u64, next: ReportState) {
        self.wait_timer_nanos = timestamp_nanos;
        self.next_state = next;
        self.state = ReportState::Wait;
    }
}
