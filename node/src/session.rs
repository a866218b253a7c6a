//! Session data model: per-peer node reports, ACK tracking, session phase,
//! and the debounce gate between consecutive sessions.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::time::Instant;

use meshloc_types::wire::TargetData;
use meshloc_types::{NodeId, RfEnvironment, TargetRef};

use crate::filter::RssiFilter;
use crate::pathloss::PathLossModel;
use crate::scanner::{GpsFix, TargetAccumulator};
use crate::trilateration::Anchor;

/// Minimum spacing between consecutive session starts, measured from the
/// previous session's terminal transition.
pub const SESSION_DEBOUNCE: Duration = Duration::from_secs(20);

// ── Node reports ──────────────────────────────────────────────────────────────

/// Everything the coordinator knows about one reporting peer.
#[derive(Debug, Clone)]
pub struct NodeReport {
    pub node_id: NodeId,
    /// Latest reported average RSSI (dBm, real domain after first filter step).
    pub rssi_dbm: f32,
    pub hits: u32,
    pub lat: f64,
    pub lon: f64,
    pub hdop: Option<f32>,
    pub has_gps: bool,
    pub is_ble: bool,
    pub detected_at_us: Option<i64>,
    pub filter: RssiFilter,
    pub quality: f32,
    pub distance_m: f32,
    pub last_update: Instant,
    last_applied: Option<TargetData>,
}

impl NodeReport {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            rssi_dbm: 0.0,
            hits: 0,
            lat: 0.0,
            lon: 0.0,
            hdop: None,
            has_gps: false,
            is_ble: false,
            detected_at_us: None,
            filter: RssiFilter::default(),
            quality: 0.0,
            distance_m: 0.0,
            last_update: Instant::now(),
            last_applied: None,
        }
    }

    /// Merge one T_D into the report. A byte-identical duplicate only bumps
    /// `last_update`; everything else is recomputed from the new aggregate.
    pub fn apply(&mut self, data: &TargetData, path_loss: &PathLossModel) {
        self.last_update = Instant::now();
        if self.last_applied.as_ref() == Some(data) {
            return;
        }

        self.rssi_dbm = data.rssi_dbm as f32;
        self.hits = data.hits;
        self.is_ble = data.is_ble;
        if let Some((lat, lon)) = data.lat_lon {
            self.lat = lat;
            self.lon = lon;
            self.has_gps = true;
            self.hdop = data.hdop;
        }
        if data.detected_at_us.is_some() {
            self.detected_at_us = data.detected_at_us;
        }

        self.filter.push(data.rssi_dbm);
        self.quality = self.filter.signal_quality(self.hits);
        self.distance_m = path_loss.distance_m(self.filter.filtered(), self.quality, self.is_ble);
        self.last_applied = Some(data.clone());
    }

    /// Usable as a trilateration anchor only with a GPS position.
    pub fn as_anchor(&self) -> Option<Anchor> {
        self.has_gps.then(|| Anchor {
            node_id: self.node_id.clone(),
            lat: self.lat,
            lon: self.lon,
            distance_m: self.distance_m,
            quality: self.quality,
            hdop: self.hdop,
            is_ble: self.is_ble,
        })
    }
}

// ── ACK tracking ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AckEntry {
    pub first_ack: Instant,
    pub report_received: bool,
    pub last_report: Option<Instant>,
}

// ── Session phases ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Phase {
    Idle,
    Recruiting,
    CycleDispatch,
    Scanning,
    Stopping,
    Draining,
    Fusing,
    Publishing,
    PublishingPartial,
    AbortedInsufficient,
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Coordinator,
    Peer,
}

#[derive(Debug, Clone)]
pub struct FinalResult {
    pub lat: f64,
    pub lon: f64,
    pub confidence: f32,
    pub uncertainty_m: f32,
    pub epoch_us: i64,
    pub coordinator: NodeId,
}

// ── Session state ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct SessionState {
    pub target: TargetRef,
    pub role: Role,
    pub phase: Phase,
    pub env: RfEnvironment,
    pub started: Instant,
    pub duration_s: u32,
    pub ack_table: HashMap<NodeId, AckEntry>,
    pub node_reports: HashMap<NodeId, NodeReport>,
    pub final_result: Option<FinalResult>,
    pub stop_sent: Option<Instant>,
    pub waiting_for_final_reports: bool,
}

impl SessionState {
    pub fn new(target: TargetRef, role: Role, env: RfEnvironment, duration_s: u32) -> Self {
        Self {
            target,
            role,
            phase: Phase::Idle,
            env,
            started: Instant::now(),
            duration_s,
            ack_table: HashMap::new(),
            node_reports: HashMap::new(),
            final_result: None,
            stop_sent: None,
            waiting_for_final_reports: false,
        }
    }

    /// Record a TRI_START_ACK (or a late joiner). Returns true when the peer
    /// is new to the table.
    pub fn ack(&mut self, node: &NodeId) -> bool {
        match self.ack_table.get_mut(node) {
            Some(entry) => {
                entry.first_ack = entry.first_ack.min(Instant::now());
                false
            }
            None => {
                self.ack_table.insert(
                    node.clone(),
                    AckEntry {
                        first_ack: Instant::now(),
                        report_received: false,
                        last_report: None,
                    },
                );
                true
            }
        }
    }

    pub fn mark_reported(&mut self, node: &NodeId) {
        if let Some(entry) = self.ack_table.get_mut(node) {
            entry.report_received = true;
            entry.last_report = Some(Instant::now());
        }
    }

    pub fn reset_report_flags(&mut self) {
        for entry in self.ack_table.values_mut() {
            entry.report_received = false;
            entry.last_report = None;
        }
    }

    pub fn reported_count(&self) -> usize {
        self.ack_table.values().filter(|a| a.report_received).count()
    }

    pub fn all_reported(&self) -> bool {
        self.ack_table.values().all(|a| a.report_received)
    }

    pub fn unreported(&self) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = self
            .ack_table
            .iter()
            .filter(|(_, a)| !a.report_received)
            .map(|(n, _)| n.clone())
            .collect();
        out.sort();
        out
    }
}

// ── Debounce gate ─────────────────────────────────────────────────────────────

/// Two consecutive sessions must be separated by [`SESSION_DEBOUNCE`]. The
/// check is a single monotonic-time comparison.
#[derive(Debug, Default)]
pub struct DebounceGate {
    last_terminal: StdMutex<Option<Instant>>,
}

impl DebounceGate {
    /// Ok when a new session may start; Err carries the remaining wait.
    pub fn check(&self) -> Result<(), Duration> {
        let last = *self.last_terminal.lock().unwrap();
        match last {
            Some(at) => {
                let elapsed = at.elapsed();
                if elapsed < SESSION_DEBOUNCE {
                    Err(SESSION_DEBOUNCE - elapsed)
                } else {
                    Ok(())
                }
            }
            None => Ok(()),
        }
    }

    pub fn mark_terminal(&self) {
        *self.last_terminal.lock().unwrap() = Some(Instant::now());
    }
}

// ── Report construction ───────────────────────────────────────────────────────

/// Build the T_D payload for one radio's running aggregate. None when that
/// radio saw no matching hits.
pub fn build_target_data(
    target: TargetRef,
    accum: &TargetAccumulator,
    is_ble: bool,
    gps: &GpsFix,
    epoch_us: Option<i64>,
) -> Option<TargetData> {
    let (hits, avg) = if is_ble {
        (accum.ble_hits, accum.ble_avg()?)
    } else {
        (accum.wifi_hits, accum.wifi_avg()?)
    };
    Some(TargetData {
        target,
        hits,
        rssi_dbm: avg,
        is_ble,
        lat_lon: gps.valid.then_some((gps.lat, gps.lon)),
        hdop: (gps.valid && gps.hdop > 0.0).then_some(gps.hdop),
        detected_at_us: accum.last_hit_epoch_us.or(epoch_us),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshloc_types::Mac;

    fn target() -> TargetRef {
        TargetRef::Mac(Mac([0xAA, 0xBB, 0xCC, 0x00, 0x11, 0x22]))
    }

    fn t_d(rssi: i8, hits: u32) -> TargetData {
        TargetData {
            target: target(),
            hits,
            rssi_dbm: rssi,
            is_ble: false,
            lat_lon: Some((45.0, 7.0)),
            hdop: Some(1.5),
            detected_at_us: Some(1_000_000),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_t_d_is_idempotent_except_last_update() {
        let pl = PathLossModel::from_environment(RfEnvironment::Indoor);
        let mut report = NodeReport::new(NodeId::new("N2").unwrap());
        let data = t_d(-60, 5);

        report.apply(&data, &pl);
        let filtered = report.filter.filtered();
        let (q, d, hits) = (report.quality, report.distance_m, report.hits);
        let first_update = report.last_update;

        tokio::time::advance(Duration::from_millis(250)).await;
        report.apply(&data, &pl);

        assert_eq!(report.filter.filtered(), filtered);
        assert_eq!(report.quality, q);
        assert_eq!(report.distance_m, d);
        assert_eq!(report.hits, hits);
        assert!(report.last_update > first_update);
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_t_d_updates_everything() {
        let pl = PathLossModel::from_environment(RfEnvironment::Indoor);
        let mut report = NodeReport::new(NodeId::new("N2").unwrap());
        report.apply(&t_d(-60, 5), &pl);
        let d1 = report.distance_m;

        let mut ble = t_d(-85, 9);
        ble.is_ble = true;
        report.apply(&ble, &pl);

        assert_eq!(report.hits, 9);
        assert!(report.is_ble);
        assert_ne!(report.distance_m, d1);
        assert!((0.1..=200.0).contains(&report.distance_m));
        assert!((0.0..=1.0).contains(&report.quality));
    }

    #[tokio::test(start_paused = true)]
    async fn report_without_gps_is_no_anchor() {
        let pl = PathLossModel::from_environment(RfEnvironment::Indoor);
        let mut report = NodeReport::new(NodeId::new("N2").unwrap());
        let mut data = t_d(-60, 5);
        data.lat_lon = None;
        data.hdop = None;
        report.apply(&data, &pl);
        assert!(!report.has_gps);
        assert!(report.as_anchor().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn ack_table_bookkeeping() {
        let mut s = SessionState::new(target(), Role::Coordinator, RfEnvironment::Indoor, 30);
        let n2 = NodeId::new("N2").unwrap();
        let n3 = NodeId::new("N3").unwrap();
        assert!(s.ack(&n2));
        assert!(!s.ack(&n2));
        assert!(s.ack(&n3));
        assert!(!s.all_reported());

        s.mark_reported(&n2);
        assert_eq!(s.reported_count(), 1);
        assert_eq!(s.unreported(), vec![n3.clone()]);

        s.mark_reported(&n3);
        assert!(s.all_reported());
        s.reset_report_flags();
        assert_eq!(s.reported_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_gate_blocks_then_clears() {
        let gate = DebounceGate::default();
        assert!(gate.check().is_ok());
        gate.mark_terminal();
        let remaining = gate.check().unwrap_err();
        assert!(remaining <= SESSION_DEBOUNCE);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(gate.check().is_err());

        tokio::time::advance(Duration::from_secs(16)).await;
        assert!(gate.check().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn target_data_built_per_radio() {
        let mut accum = TargetAccumulator::default();
        let gps = GpsFix { valid: true, lat: 45.0, lon: 7.0, hdop: 1.2, ..Default::default() };
        assert!(build_target_data(target(), &accum, false, &gps, None).is_none());

        accum.wifi_hits = 4;
        accum.wifi_rssi_sum = -240.0;
        let d = build_target_data(target(), &accum, false, &gps, Some(99)).unwrap();
        assert_eq!(d.rssi_dbm, -60);
        assert_eq!(d.hits, 4);
        assert_eq!(d.lat_lon, Some((45.0, 7.0)));
        assert_eq!(d.detected_at_us, Some(99));
        assert!(build_target_data(target(), &accum, true, &gps, None).is_none());
    }
}
