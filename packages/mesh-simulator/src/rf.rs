//! Log-distance RF propagation model for synthetic scan hits.
//!
//! Inverse of the node's path-loss estimator: given true emitter-to-sensor
//! distance, produce the RSSI a sensor would report, with optional Gaussian
//! shadowing on top.

use rand::Rng;
use rand_distr::{Distribution, Normal};

use meshloc_types::RfEnvironment;

/// RSSI a sensor observes for an emitter at `distance_m`.
pub fn rssi_at(
    distance_m: f64,
    is_ble: bool,
    env: RfEnvironment,
    sigma_db: f64,
    rng: &mut impl Rng,
) -> i8 {
    let preset = env.preset();
    let (rssi0, n) = if is_ble {
        (preset.rssi0_ble as f64, preset.n_ble as f64)
    } else {
        (preset.rssi0_wifi as f64, preset.n_wifi as f64)
    };
    let mut rssi = rssi0 - 10.0 * n * distance_m.max(0.1).log10();
    if sigma_db > 0.0 {
        let shadow = Normal::new(0.0, sigma_db).unwrap();
        rssi += shadow.sample(rng);
    }
    rssi.clamp(-120.0, -20.0).round() as i8
}
