//! Log-distance path-loss model with online re-estimation.
//!
//! Distance from RSSI follows `d = 10^((rssi0 - rssi) / (10 n))`, degraded by
//! signal quality and clamped to the usable [0.1, 200] m band. Wi-Fi and BLE
//! carry independent `(rssi0, n)` parameter sets seeded from the RF
//! environment preset.
//!
//! Whenever GPS-derived ground-truth distances become available (after a
//! successful trilateration, or from a manual known-distance calibration),
//! samples feed a least-squares fit of `rssi = a + b log10(d)` with
//! `a = rssi0`, `b = -10 n`. Fits are clamped to physical bounds and blended
//! into the current parameters with an EMA once calibrated.

use std::collections::VecDeque;

use tokio::time::Instant;
use tracing::{debug, warn};

use meshloc_types::RfEnvironment;

const MIN_SAMPLES: usize = 5;
const MAX_SAMPLES: usize = 50;
const EMA_ALPHA: f32 = 0.3;
const REESTIMATE_EVERY: usize = 10;
const REESTIMATE_AFTER_SECS: u64 = 30;

const N_MIN: f32 = 1.5;
const N_MAX: f32 = 6.0;
const RSSI0_MIN: f32 = -60.0;
const RSSI0_MAX: f32 = -20.0;

pub const DISTANCE_MIN_M: f32 = 0.1;
pub const DISTANCE_MAX_M: f32 = 200.0;

// ── Parameter sets ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct RadioParams {
    pub rssi0: f32,
    pub n: f32,
    pub calibrated: bool,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    rssi: f32,
    distance_m: f32,
}

#[derive(Debug)]
pub struct PathLossModel {
    wifi: RadioParams,
    ble: RadioParams,
    wifi_samples: VecDeque<Sample>,
    ble_samples: VecDeque<Sample>,
    wifi_since_fit: usize,
    ble_since_fit: usize,
    last_fit: Instant,
}

impl PathLossModel {
    pub fn from_environment(env: RfEnvironment) -> Self {
        let p = env.preset();
        Self {
            wifi: RadioParams { rssi0: p.rssi0_wifi, n: p.n_wifi, calibrated: false },
            ble: RadioParams { rssi0: p.rssi0_ble, n: p.n_ble, calibrated: false },
            wifi_samples: VecDeque::new(),
            ble_samples: VecDeque::new(),
            wifi_since_fit: 0,
            ble_since_fit: 0,
            last_fit: Instant::now(),
        }
    }

    /// Re-seed both parameter sets from an environment preset. Clears the
    /// calibrated flags; collected samples are kept.
    pub fn set_environment(&mut self, env: RfEnvironment) {
        let p = env.preset();
        self.wifi = RadioParams { rssi0: p.rssi0_wifi, n: p.n_wifi, calibrated: false };
        self.ble = RadioParams { rssi0: p.rssi0_ble, n: p.n_ble, calibrated: false };
    }

    pub fn params(&self, is_ble: bool) -> RadioParams {
        if is_ble {
            self.ble
        } else {
            self.wifi
        }
    }

    /// True once either radio has an estimated (rather than preset)
    /// parameter set. Drives the calibration term of the uncertainty budget.
    pub fn calibrated(&self) -> bool {
        self.wifi.calibrated || self.ble.calibrated
    }

    /// Estimate distance for a filtered RSSI, widened by poor signal quality
    /// and clamped to the usable band.
    pub fn distance_m(&self, filtered_rssi: f32, quality: f32, is_ble: bool) -> f32 {
        let p = self.params(is_ble);
        let d = 10f32.powf((p.rssi0 - filtered_rssi) / (10.0 * p.n));
        let d = d * (1.0 + 0.5 * (1.0 - quality.clamp(0.0, 1.0)));
        d.clamp(DISTANCE_MIN_M, DISTANCE_MAX_M)
    }

    /// Admit one (rssi, ground-truth distance) tuple and re-fit when due.
    pub fn add_sample(&mut self, rssi: f32, distance_m: f32, is_ble: bool) {
        if !(DISTANCE_MIN_M..=DISTANCE_MAX_M).contains(&distance_m) {
            return;
        }
        let samples = if is_ble { &mut self.ble_samples } else { &mut self.wifi_samples };
        samples.push_back(Sample { rssi, distance_m });
        if samples.len() > MAX_SAMPLES {
            samples.pop_front();
        }
        let since = if is_ble { &mut self.ble_since_fit } else { &mut self.wifi_since_fit };
        *since += 1;

        if *since >= REESTIMATE_EVERY
            || self.last_fit.elapsed().as_secs() >= REESTIMATE_AFTER_SECS
        {
            self.estimate(is_ble);
        }
    }

    /// Manual known-distance calibration: with the emitter at a measured
    /// distance, `rssi0 = mean_rssi + 10 n log10(d)`.
    pub fn apply_known_distance(&mut self, mean_rssi: f32, distance_m: f32, is_ble: bool) {
        if distance_m <= 0.0 {
            return;
        }
        let p = if is_ble { &mut self.ble } else { &mut self.wifi };
        p.rssi0 = (mean_rssi + 10.0 * p.n * distance_m.log10()).clamp(RSSI0_MIN, RSSI0_MAX);
        p.calibrated = true;
        debug!(
            radio = if is_ble { "BLE" } else { "WiFi" },
            rssi0 = p.rssi0,
            "path loss calibrated from known distance"
        );
    }

    /// Least-squares fit of rssi on log10(distance) over the sample ring.
    fn estimate(&mut self, is_ble: bool) {
        let samples = if is_ble { &self.ble_samples } else { &self.wifi_samples };
        if samples.len() < MIN_SAMPLES {
            return;
        }

        let (mut sum_x, mut sum_y, mut sum_xx, mut sum_xy) = (0.0f32, 0.0f32, 0.0f32, 0.0f32);
        let mut count = 0usize;
        for s in samples {
            if s.distance_m > DISTANCE_MIN_M {
                let x = s.distance_m.log10();
                sum_x += x;
                sum_y += s.rssi;
                sum_xx += x * x;
                sum_xy += x * s.rssi;
                count += 1;
            }
        }
        if count < MIN_SAMPLES {
            return;
        }

        let nf = count as f32;
        let denom = nf * sum_xx - sum_x * sum_x;
        if denom.abs() < 1e-4 {
            warn!(
                radio = if is_ble { "BLE" } else { "WiFi" },
                "path loss regression singular, keeping current parameters"
            );
            return;
        }

        let slope = (nf * sum_xy - sum_x * sum_y) / denom;
        let intercept = (sum_y - slope * sum_x) / nf;

        let n_est = (-slope / 10.0).clamp(N_MIN, N_MAX);
        let rssi0_est = intercept.clamp(RSSI0_MIN, RSSI0_MAX);

        let p = if is_ble { &mut self.ble } else { &mut self.wifi };
        if p.calibrated {
            p.n = EMA_ALPHA * n_est + (1.0 - EMA_ALPHA) * p.n;
            p.rssi0 = EMA_ALPHA * rssi0_est + (1.0 - EMA_ALPHA) * p.rssi0;
        } else {
            p.n = n_est;
            p.rssi0 = rssi0_est;
            p.calibrated = true;
        }
        debug!(
            radio = if is_ble { "BLE" } else { "WiFi" },
            rssi0 = p.rssi0,
            n = p.n,
            samples = count,
            "path loss parameters updated"
        );

        let since = if is_ble { &mut self.ble_since_fit } else { &mut self.wifi_since_fit };
        *since = 0;
        self.last_fit = Instant::now();
    }
}
