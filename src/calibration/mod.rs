pub mod debug;
pub mod gyro_cal;
pub mod stillness;
pub mod trackers;

#[cfg(test)]
mod tests;

pub use gyro_cal::{GyroCal, GyroCalParams, MAX_GYRO_BIAS};
pub use stillness::StillnessDetector;
pub use trackers::{TemperatureTracker, TrackerCommand, WindowMeanTracker};
