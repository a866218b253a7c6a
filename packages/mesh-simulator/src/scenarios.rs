//! Scenario presets: node geometry, emitter placement, radio behavior.

use serde::Deserialize;

use meshloc_node::geo;
use meshloc_types::{Mac, RfEnvironment};

use crate::world::{Emitter, NodeSpec};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Peers in addition to the coordinator.
    pub peers: usize,
    /// Edge length of the deployment square, meters.
    pub spacing_m: f64,
    pub duration_s: u32,
    /// RF environment preset index (0..4).
    pub env: u8,
    /// Log-normal shadowing sigma in dB.
    pub sigma_db: f64,
    pub origin_lat: f64,
    pub origin_lon: f64,
    pub hdop: f32,
    pub emitter_wifi: bool,
    pub emitter_ble: bool,
    pub target_mac: String,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            peers: 2,
            spacing_m: 50.0,
            duration_s: 15,
            env: 0,
            sigma_db: 1.5,
            origin_lat: 0.0,
            origin_lon: 0.0,
            hdop: 1.0,
            emitter_wifi: true,
            emitter_ble: false,
            target_mac: "DE:AD:BE:EF:00:01".to_string(),
        }
    }
}

impl ScenarioConfig {
    pub fn environment(&self) -> RfEnvironment {
        RfEnvironment::from_u8(self.env)
    }

    pub fn target(&self) -> Mac {
        Mac::parse(&self.target_mac).expect("scenario target MAC")
    }

    /// Coordinator at the origin corner, peers around the square perimeter.
    pub fn node_specs(&self, datetime: Option<chrono::NaiveDateTime>) -> Vec<NodeSpec> {
        let corners = [
            (0.0, 0.0),
            (0.0, self.spacing_m),
            (self.spacing_m, 0.0),
            (self.spacing_m, self.spacing_m),
        ];
        (0..=self.peers)
            .map(|i| {
                let (north, east) = if i < corners.len() {
                    corners[i]
                } else {
                    // Extras along the mid-line.
                    let t = (i - corners.len() + 1) as f64 / self.peers.max(1) as f64;
                    (self.spacing_m * t, self.spacing_m / 2.0)
                };
                let (lat, lon) = geo::from_enu(east, north, self.origin_lat, self.origin_lon);
                NodeSpec {
                    id: format!("N{}", i + 1),
                    lat,
                    lon,
                    hdop: self.hdop,
                    has_gps: true,
                    gps_datetime: datetime,
                }
            })
            .collect()
    }

    /// Emitter at the square center.
    pub fn emitter(&self) -> Emitter {
        let (lat, lon) = geo::from_enu(
            self.spacing_m / 2.0,
            self.spacing_m / 2.0,
            self.origin_lat,
            self.origin_lon,
        );
        Emitter {
            mac: self.target(),
            lat,
            lon,
            wifi: self.emitter_wifi,
            ble: self.emitter_ble,
        }
    }
}
