//! Stillness-period trackers: temperature statistics and gyroscope
//! window-mean extrema.
//!
//! Both are command-driven so that one call site owns the whole
//! reset/update/store/evaluate cycle, and both keep a stored snapshot next
//! to the working data: the snapshot is what the bias computer reads when a
//! stillness period ends on sudden motion.

/// Commands accepted by the trackers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackerCommand {
    /// Clear the working data.
    Reset,
    /// Fold the new observation into the working data.
    Update,
    /// Snapshot the working data for later recall.
    Store,
    /// Evaluate the gate; `true` means the gate tripped.
    Evaluate,
}

// =============================================================================
// TEMPERATURE
// =============================================================================

/// Running mean and min/max of the temperature over a stillness period.
#[derive(Clone, Debug)]
pub struct TemperatureTracker {
    delta_limit_celsius: f32,

    accumulator: f32,
    num_points: usize,
    min_celsius: f32,
    max_celsius: f32,

    /// Last raw reading, used to skip duplicate samples.
    last_celsius: f32,

    stored_mean: f32,
    stored_min_max: [f32; 2],
}

impl TemperatureTracker {
    pub fn new(delta_limit_celsius: f32) -> Self {
        let mut tracker = TemperatureTracker {
            delta_limit_celsius,
            accumulator: 0.0,
            num_points: 0,
            min_celsius: 0.0,
            max_celsius: 0.0,
            last_celsius: 0.0,
            stored_mean: 0.0,
            stored_min_max: [0.0; 2],
        };
        tracker.command(TrackerCommand::Reset, 0.0);
        tracker
    }

    /// Dispatch one command. `temperature_celsius` is only meaningful for
    /// [`TrackerCommand::Update`]. Returns `true` only when an Evaluate
    /// finds the min/max range beyond the configured limit.
    pub fn command(&mut self, command: TrackerCommand, temperature_celsius: f32) -> bool {
        match command {
            TrackerCommand::Reset => {
                self.num_points = 0;
                self.accumulator = 0.0;
                self.min_celsius = f32::MAX;
                self.max_celsius = f32::MIN;
            }
            TrackerCommand::Update => {
                // Duplicate readings carry no information; only a change
                // larger than the smallest positive float counts.
                if (temperature_celsius - self.last_celsius).abs() > f32::MIN_POSITIVE {
                    self.accumulator += temperature_celsius;
                    self.num_points += 1;
                    self.min_celsius = self.min_celsius.min(temperature_celsius);
                    self.max_celsius = self.max_celsius.max(temperature_celsius);
                }
                self.last_celsius = temperature_celsius;
            }
            TrackerCommand::Store => {
                if self.num_points > 0 {
                    self.stored_min_max = [self.min_celsius, self.max_celsius];
                    self.stored_mean = self.accumulator / self.num_points as f32;
                }
            }
            TrackerCommand::Evaluate => {
                if self.num_points > 0 {
                    return (self.max_celsius - self.min_celsius) > self.delta_limit_celsius;
                }
            }
        }
        false
    }

    /// Mean temperature snapshotted by the last Store.
    pub fn stored_mean(&self) -> f32 {
        self.stored_mean
    }

    /// Min/max snapshotted by the last Store.
    pub fn stored_min_max(&self) -> [f32; 2] {
        self.stored_min_max
    }
}

// =============================================================================
// GYRO WINDOW MEANS
// =============================================================================

/// Per-axis extrema of successive gyroscope window means; the gate trips
/// when any axis drifts more than the configured limit within one stillness
/// period.
#[derive(Clone, Debug)]
pub struct WindowMeanTracker {
    mean_delta_limit: f32,

    winmean_min: [f32; 3],
    winmean_max: [f32; 3],

    stored_min: [f32; 3],
    stored_max: [f32; 3],
}

impl WindowMeanTracker {
    pub fn new(mean_delta_limit: f32) -> Self {
        let mut tracker = WindowMeanTracker {
            mean_delta_limit,
            winmean_min: [0.0; 3],
            winmean_max: [0.0; 3],
            stored_min: [0.0; 3],
            stored_max: [0.0; 3],
        };
        tracker.command(TrackerCommand::Reset, &[0.0; 3]);
        tracker
    }

    /// Dispatch one command. `window_mean` is only meaningful for
    /// [`TrackerCommand::Update`]. Returns `true` only when an Evaluate
    /// finds an axis range beyond the configured limit.
    pub fn command(&mut self, command: TrackerCommand, window_mean: &[f32; 3]) -> bool {
        match command {
            TrackerCommand::Reset => {
                self.winmean_min = [f32::MAX; 3];
                self.winmean_max = [f32::MIN; 3];
            }
            TrackerCommand::Update => {
                for i in 0..3 {
                    self.winmean_min[i] = self.winmean_min[i].min(window_mean[i]);
                    self.winmean_max[i] = self.winmean_max[i].max(window_mean[i]);
                }
            }
            TrackerCommand::Store => {
                self.stored_min = self.winmean_min;
                self.stored_max = self.winmean_max;
            }
            TrackerCommand::Evaluate => {
                let mut tripped = false;
                for i in 0..3 {
                    tripped |= (self.winmean_max[i] - self.winmean_min[i]) > self.mean_delta_limit;
                }
                return tripped;
            }
        }
        false
    }

    /// Extrema snapshotted by the last Store, as `(min, max)`.
    pub fn stored_extrema(&self) -> ([f32; 3], [f32; 3]) {
        (self.stored_min, self.stored_max)
    }
}
