//! Per-node RSSI conditioning: median pre-filter, scalar Kalman filter, and
//! the rolling signal-quality score that weights everything downstream.
//!
//! Raw RSSI off the radios is noisy and multipath-ridden. Each incoming
//! sample passes through a 5-deep median window before the Kalman update, and
//! the filter's measurement noise is re-estimated from the rolling sample
//! variance so bursty environments widen the gate instead of whipping the
//! estimate around.

use std::collections::VecDeque;

const RAW_WINDOW: usize = 5;
const HISTORY: usize = 10;
const PROCESS_NOISE: f32 = 0.5;
const INITIAL_COVARIANCE: f32 = 10.0;
const INITIAL_MEASUREMENT_NOISE: f32 = 4.0;
const MIN_MEASUREMENT_NOISE: f32 = 2.0;

// ── Scalar Kalman filter ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct KalmanFilter {
    estimate: f32,
    error_covariance: f32,
    process_noise: f32,
    measurement_noise: f32,
    initialized: bool,
}

impl Default for KalmanFilter {
    fn default() -> Self {
        Self {
            estimate: 0.0,
            error_covariance: INITIAL_COVARIANCE,
            process_noise: PROCESS_NOISE,
            measurement_noise: INITIAL_MEASUREMENT_NOISE,
            initialized: false,
        }
    }
}

impl KalmanFilter {
    /// One predict/update step. The first measurement initializes the filter
    /// and is returned unchanged.
    pub fn update(&mut self, measurement: f32) -> f32 {
        if !self.initialized {
            self.estimate = measurement;
            self.error_covariance = INITIAL_COVARIANCE;
            self.initialized = true;
            return measurement;
        }
        let predict_cov = self.error_covariance + self.process_noise;
        let gain = predict_cov / (predict_cov + self.measurement_noise);
        self.estimate += gain * (measurement - self.estimate);
        self.error_covariance = (1.0 - gain) * predict_cov;
        self.estimate
    }

    pub fn set_measurement_noise(&mut self, noise: f32) {
        self.measurement_noise = noise.max(MIN_MEASUREMENT_NOISE);
    }

    pub fn estimate(&self) -> f32 {
        self.estimate
    }
}

// ── RSSI filter chain ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct RssiFilter {
    raw_window: VecDeque<i8>,
    history: VecDeque<i8>,
    kalman: KalmanFilter,
    filtered: f32,
}

impl RssiFilter {
    /// Feed one raw sample through median pre-filter and Kalman update.
    /// Returns the new filtered estimate.
    pub fn push(&mut self, rssi: i8) -> f32 {
        self.raw_window.push_back(rssi);
        if self.raw_window.len() > RAW_WINDOW {
            self.raw_window.pop_front();
        }

        let measurement = if self.raw_window.len() >= RAW_WINDOW {
            let mut sorted: Vec<i8> = self.raw_window.iter().copied().collect();
            sorted.sort_unstable();
            sorted[sorted.len() / 2] as f32
        } else {
            rssi as f32
        };

        if self.history.len() > RAW_WINDOW {
            self.kalman.set_measurement_noise(self.variance());
        }
        self.filtered = self.kalman.update(measurement);

        self.history.push_back(rssi);
        if self.history.len() > HISTORY {
            self.history.pop_front();
        }

        self.filtered
    }

    pub fn filtered(&self) -> f32 {
        self.filtered
    }

    fn mean(&self) -> f32 {
        if self.history.is_empty() {
            return 0.0;
        }
        self.history.iter().map(|&r| r as f32).sum::<f32>() / self.history.len() as f32
    }

    fn variance(&self) -> f32 {
        if self.history.is_empty() {
            return 0.0;
        }
        let mean = self.mean();
        self.history
            .iter()
            .map(|&r| {
                let d = r as f32 - mean;
                d * d
            })
            .sum::<f32>()
            / self.history.len() as f32
    }

    /// Rolling signal-quality score in [0, 1].
    ///
    /// With fewer than 3 samples only the hit count informs the score
    /// (0.3–0.5). Otherwise: 40% history stability, 30% filtered strength,
    /// 30% hit count, saturating at 15 hits.
    pub fn signal_quality(&self, hit_count: u32) -> f32 {
        let hit_factor = (hit_count as f32 / 15.0).min(1.0);
        if self.history.len() < 3 {
            return 0.3 + hit_factor * 0.2;
        }
        let stability = 1.0 / (1.0 + self.variance().sqrt());
        let strength = ((self.filtered + 100.0) / 100.0).clamp(0.0, 1.0);
        (stability * 0.4 + strength * 0.3 + hit_factor * 0.3).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_sample_passes_through() {
        let mut f = RssiFilter::default();
        assert_eq!(f.push(-70), -70.0);
    }

    #[test]
    fn median_suppresses_outlier() {
        let mut f = RssiFilter::default();
        for _ in 0..4 {
            f.push(-60);
        }
        // Fifth sample is a spike; median of the window stays at -60, so the
        // Kalman measurement never sees the outlier directly.
        let est = f.push(-20);
        assert!(est < -55.0, "estimate {est} tracked the spike");
    }

    #[test]
    fn quality_bounds_hold() {
        let mut f = RssiFilter::default();
        for i in 0..20 {
            f.push(-50 - (i % 7) as i8 * 3);
            let q = f.signal_quality(i as u32);
            assert!((0.0..=1.0).contains(&q), "quality {q} out of range");
        }
    }

    #[test]
    fn few_samples_quality_uses_hits() {
        let mut f = RssiFilter::default();
        f.push(-60);
        assert!((f.signal_quality(0) - 0.3).abs() < 1e-6);
        assert!((f.signal_quality(15) - 0.5).abs() < 1e-6);
        assert!((f.signal_quality(500) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn stable_signal_scores_higher_than_jittery() {
        let mut stable = RssiFilter::default();
        let mut jittery = RssiFilter::default();
        for i in 0..10 {
            stable.push(-55);
            jittery.push(if i % 2 == 0 { -40 } else { -80 });
        }
        assert!(stable.signal_quality(10) > jittery.signal_quality(10));
    }

    #[test]
    fn converges_toward_steady_level() {
        let mut f = RssiFilter::default();
        let mut est = 0.0;
        for _ in 0..30 {
            est = f.push(-64);
        }
        assert!((est - -64.0).abs() < 1.0);
    }
}
