//! Per-sensor stillness detector: windowed mean/variance with a confidence
//! score derived from the variance.
//!
//! Samples accumulate with the method of the assumed mean (first sample of a
//! capture run) to keep the variance numerically stable without per-sample
//! divisions. A window "closes" when a sample at or past the window end-time
//! arrives; the gate reads the ready flag, computes confidences, and resets
//! the detector. Resets may preserve the accumulators, which is how the
//! statistics of one stillness period span many windows: the reported mean
//! then covers the entire period so far.

/// Windowed stillness statistics for one triaxial sensor.
#[derive(Clone, Debug, Default)]
pub struct StillnessDetector {
    var_threshold: f32,
    confidence_delta: f32,

    /// Confidence of the current window, in [0, 1].
    pub stillness_confidence: f32,
    /// Confidence snapshotted at the last reset.
    pub prev_stillness_confidence: f32,

    /// Set when the current window has closed and stats are consumable.
    pub stillness_window_ready: bool,
    /// First sample timestamp of the current capture window.
    pub window_start_time: u64,
    /// Timestamp of the most recent accumulated sample.
    pub last_sample_time: u64,

    start_new_window: bool,
    num_acc_samples: u32,
    assumed_mean: [f32; 3],
    acc_mean: [f32; 3],
    acc_var: [f32; 3],

    win_mean: [f32; 3],
    win_var: [f32; 3],
    prev_mean: [f32; 3],
}

impl StillnessDetector {
    /// `var_threshold` centres the confidence ramp; `confidence_delta` is its
    /// half-width. A non-positive delta degenerates to a hard threshold.
    pub fn new(var_threshold: f32, confidence_delta: f32) -> Self {
        StillnessDetector {
            var_threshold,
            confidence_delta,
            start_new_window: true,
            ..StillnessDetector::default()
        }
    }

    /// Accumulate one sample. Samples are dropped while `win_endtime == 0`
    /// (data collection not armed); a sample at or past the end-time closes
    /// the window.
    pub fn update(&mut self, win_endtime: u64, sample_time: u64, sample: [f32; 3]) {
        if win_endtime == 0 {
            return;
        }
        if self.start_new_window {
            self.window_start_time = sample_time;
            self.start_new_window = false;
            if self.num_acc_samples == 0 {
                self.assumed_mean = sample;
            }
        }
        self.num_acc_samples += 1;
        for i in 0..3 {
            let delta = sample[i] - self.assumed_mean[i];
            self.acc_mean[i] += delta;
            self.acc_var[i] += delta * delta;
        }
        self.last_sample_time = sample_time;
        if sample_time >= win_endtime {
            self.stillness_window_ready = true;
        }
    }

    /// Finalize the accumulated mean/variance and derive the confidence.
    pub fn compute_confidence(&mut self) -> f32 {
        if self.num_acc_samples > 1 {
            let n = self.num_acc_samples as f32;
            for i in 0..3 {
                self.win_mean[i] = self.assumed_mean[i] + self.acc_mean[i] / n;
                let var = (self.acc_var[i] - self.acc_mean[i] * self.acc_mean[i] / n) / (n - 1.0);
                self.win_var[i] = var.max(0.0);
            }
            self.stillness_confidence = self.axis_confidence(0)
                * self.axis_confidence(1)
                * self.axis_confidence(2);
        } else {
            // A window with at most one sample carries no variance signal.
            self.stillness_confidence = 0.0;
        }
        self.stillness_confidence
    }

    /// Close out the current window. With `reset_stats` the accumulators are
    /// cleared; without it they carry into the next window, extending the
    /// current stillness period. Either way the confidence and mean are
    /// snapshotted into the `prev_*` fields first.
    pub fn reset(&mut self, reset_stats: bool) {
        self.stillness_window_ready = false;
        self.start_new_window = true;
        self.prev_stillness_confidence = self.stillness_confidence;

        if self.num_acc_samples > 0 {
            let inv = 1.0 / self.num_acc_samples as f32;
            for i in 0..3 {
                self.prev_mean[i] = self.assumed_mean[i] + self.acc_mean[i] * inv;
            }
        }

        if reset_stats {
            self.num_acc_samples = 0;
            self.acc_mean = [0.0; 3];
            self.acc_var = [0.0; 3];
            self.assumed_mean = [0.0; 3];
        }
    }

    /// Mean of the last computed window (covers the whole stillness period
    /// while resets preserve stats).
    pub fn win_mean(&self) -> [f32; 3] {
        self.win_mean
    }

    pub fn win_var(&self) -> [f32; 3] {
        self.win_var
    }

    /// Mean snapshotted at the last reset; what the bias computer consumes.
    pub fn prev_mean(&self) -> [f32; 3] {
        self.prev_mean
    }

    fn axis_confidence(&self, axis: usize) -> f32 {
        let var = self.win_var[axis];
        let upper = self.var_threshold + self.confidence_delta;
        let lower = self.var_threshold - self.confidence_delta;
        if self.confidence_delta <= 0.0 {
            return if var <= self.var_threshold { 1.0 } else { 0.0 };
        }
        if var >= upper {
            0.0
        } else if var <= lower {
            1.0
        } else {
            (upper - var) / (2.0 * self.confidence_delta)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW_NS: u64 = 500_000_000;

    fn feed(det: &mut StillnessDetector, start: u64, count: u32, value: [f32; 3]) {
        for i in 0..count {
            det.update(start + WINDOW_NS, start + u64::from(i) * 10_000_000, value);
        }
    }

    #[test]
    fn test_window_closes_at_endtime() {
        let mut det = StillnessDetector::new(1e-4, 1e-5);
        det.update(WINDOW_NS, 10_000_000, [0.1, 0.2, 0.3]);
        assert!(!det.stillness_window_ready);
        det.update(WINDOW_NS, WINDOW_NS, [0.1, 0.2, 0.3]);
        assert!(det.stillness_window_ready);
        assert_eq!(det.window_start_time, 10_000_000);
        assert_eq!(det.last_sample_time, WINDOW_NS);
    }

    #[test]
    fn test_samples_dropped_until_armed() {
        let mut det = StillnessDetector::new(1e-4, 1e-5);
        det.update(0, 1_000, [1.0, 1.0, 1.0]);
        assert_eq!(det.num_acc_samples, 0);
        assert!(!det.stillness_window_ready);
    }

    #[test]
    fn test_constant_signal_full_confidence() {
        let mut det = StillnessDetector::new(1e-4, 1e-5);
        feed(&mut det, 0, 51, [0.001, 0.002, 0.003]);
        assert!(det.stillness_window_ready);
        let conf = det.compute_confidence();
        assert!((conf - 1.0).abs() < 1e-6);
        let mean = det.win_mean();
        assert!((mean[0] - 0.001).abs() < 1e-6);
        assert!((mean[1] - 0.002).abs() < 1e-6);
        assert!((mean[2] - 0.003).abs() < 1e-6);
    }

    #[test]
    fn test_noisy_signal_zero_confidence() {
        let mut det = StillnessDetector::new(1e-6, 1e-7);
        // Alternate two far-apart values: variance ~ 0.25 on each axis.
        for i in 0..51u64 {
            let v = if i % 2 == 0 { 0.5 } else { -0.5 };
            det.update(WINDOW_NS, i * 10_000_000, [v, v, v]);
        }
        assert_eq!(det.compute_confidence(), 0.0);
    }

    #[test]
    fn test_confidence_ramp_is_linear_between_bounds() {
        let mut det = StillnessDetector::new(1.0, 0.5);
        // Inject variance exactly at the threshold on one axis, constants on
        // the others: per-axis confidence should be 0.5.
        det.win_var = [1.0, 0.0, 0.0];
        assert!((det.axis_confidence(0) - 0.5).abs() < 1e-6);
        assert_eq!(det.axis_confidence(1), 1.0);
    }

    #[test]
    fn test_preserving_reset_extends_period_stats() {
        let mut det = StillnessDetector::new(1e-4, 1e-5);
        feed(&mut det, 0, 51, [0.002, 0.0, 0.0]);
        det.compute_confidence();
        det.reset(false);
        assert!(!det.stillness_window_ready);

        // Second window continues the same accumulators.
        let n_before = det.num_acc_samples;
        feed(&mut det, WINDOW_NS + 10_000_000, 51, [0.002, 0.0, 0.0]);
        assert!(det.num_acc_samples > n_before);
        det.compute_confidence();
        det.reset(false);
        assert!((det.prev_mean()[0] - 0.002).abs() < 1e-6);

        // A stats reset clears the accumulators but keeps the snapshot.
        det.reset(true);
        assert_eq!(det.num_acc_samples, 0);
        assert!((det.prev_mean()[0] - 0.002).abs() < 1e-6);
    }
}
