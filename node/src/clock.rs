//! GPS-disciplined mesh clock.
//!
//! Epoch time is derived from the monotonic clock plus a boot-to-epoch offset
//! calibrated from GPS fixes (centisecond precision). Small GPS/RTC gaps feed
//! a drift-rate estimate; gaps over 2 s hard-set the offset and restart drift
//! estimation. Until the first fix, [`MeshClock::epoch_micros`] returns
//! boot-relative microseconds and [`MeshClock::is_disciplined`] stays false.
//!
//! Peer synchronization rides the mesh TIME_SYNC handshake: the responder
//! measures one-way propagation delay from the request's transmit timestamp,
//! and the initiator compensates the reported clock offset with that delay.
//! A peer is synced when epoch seconds agree exactly and the compensated
//! offset is under 1 ms.
//!
//! The clock state is behind a short-timeout lock: callers that cannot
//! acquire it within 50 ms get [`ClockError::Unavailable`] and skip the
//! operation for that tick rather than retrying inline.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{Datelike, NaiveDateTime};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use meshloc_types::NodeId;

const LOCK_TIMEOUT: Duration = Duration::from_millis(50);
const HARD_SET_GAP_S: f64 = 2.0;
const SMALL_GAP_S: f64 = 1.0;
const CONVERGE_AFTER: u32 = 3;
const PEER_SYNC_FRESH_SECS: u64 = 30;
const PEER_SYNCED_MAX_OFFSET_US: i64 = 1000;
/// Propagation delays above this are clock-domain artifacts, not physics.
const PROP_DELAY_SANE_US: u32 = 1_000_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClockError {
    #[error("clock state unavailable")]
    Unavailable,
    #[error("GPS fix carries no usable date/time")]
    NoDateTime,
}

// ── Discipline state ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Discipline {
    drift_rate: f64, // seconds of error per second of runtime
    last_discipline: Option<Instant>,
    discipline_count: u32,
    converged: bool,
    boot_to_epoch_offset_us: i64,
    offset_calibrated: bool,
}

/// Snapshot for diagnostics.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct DisciplineStats {
    pub drift_rate: f64,
    pub discipline_count: u32,
    pub converged: bool,
    pub offset_calibrated: bool,
}

// ── Peer sync state ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SyncRecord {
    pub epoch_s: u64,
    pub offset_us: i64,
    pub synced: bool,
    pub last_check: Instant,
}

#[derive(Debug, Default)]
struct PeerSync {
    records: HashMap<NodeId, SyncRecord>,
    prop_delays_us: HashMap<NodeId, u32>,
}

// ── Mesh clock ────────────────────────────────────────────────────────────────

pub struct MeshClock {
    boot: Instant,
    state: Mutex<Discipline>,
    peers: Mutex<PeerSync>,
}

impl Default for MeshClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MeshClock {
    pub fn new() -> Self {
        Self {
            boot: Instant::now(),
            state: Mutex::new(Discipline::default()),
            peers: Mutex::new(PeerSync::default()),
        }
    }

    /// Microseconds since boot. Timing decisions (slots, debounce, timeouts)
    /// use this domain, never epoch time.
    pub fn monotonic_us(&self) -> i64 {
        self.boot.elapsed().as_micros() as i64
    }

    async fn lock_state(&self) -> Result<tokio::sync::MutexGuard<'_, Discipline>, ClockError> {
        tokio::time::timeout(LOCK_TIMEOUT, self.state.lock())
            .await
            .map_err(|_| ClockError::Unavailable)
    }

    /// Current epoch microseconds, drift-corrected when converged. Before the
    /// first GPS discipline this is boot-relative.
    pub async fn epoch_micros(&self) -> Result<i64, ClockError> {
        let mono = self.monotonic_us();
        let st = self.lock_state().await?;
        let mut us = if st.offset_calibrated {
            mono + st.boot_to_epoch_offset_us
        } else {
            mono
        };
        if st.converged {
            if let Some(last) = st.last_discipline {
                let elapsed_s = last.elapsed().as_secs_f64();
                us -= (st.drift_rate * elapsed_s * 1e6) as i64;
            }
        }
        Ok(us)
    }

    pub async fn is_disciplined(&self) -> bool {
        match self.lock_state().await {
            Ok(st) => st.offset_calibrated,
            Err(_) => false,
        }
    }

    pub async fn discipline_stats(&self) -> Result<DisciplineStats, ClockError> {
        let st = self.lock_state().await?;
        Ok(DisciplineStats {
            drift_rate: st.drift_rate,
            discipline_count: st.discipline_count,
            converged: st.converged,
            offset_calibrated: st.offset_calibrated,
        })
    }

    /// Feed one GPS fix (date/time at centisecond precision) into discipline.
    pub async fn feed_gps(
        &self,
        datetime: NaiveDateTime,
        centiseconds: u8,
    ) -> Result<(), ClockError> {
        let year = datetime.year();
        if !(2020..=2050).contains(&year) {
            return Err(ClockError::NoDateTime);
        }
        let gps_epoch_us =
            datetime.and_utc().timestamp() * 1_000_000 + centiseconds as i64 * 10_000;

        let mono = self.monotonic_us();
        let mut st = self.lock_state().await?;

        let current_us = if st.offset_calibrated {
            mono + st.boot_to_epoch_offset_us
        } else {
            mono
        };
        let gap_s = (gps_epoch_us - current_us) as f64 / 1e6;

        if !st.offset_calibrated {
            st.boot_to_epoch_offset_us = gps_epoch_us - mono;
            st.offset_calibrated = true;
            info!("boot-to-epoch offset calibrated from first GPS fix");
        } else if gap_s.abs() > HARD_SET_GAP_S {
            st.boot_to_epoch_offset_us = gps_epoch_us - mono;
            st.discipline_count = 0;
            st.converged = false;
            st.drift_rate = 0.0;
            info!(gap_s, "large GPS/RTC gap, offset hard-set and drift reset");
        } else if gap_s.abs() <= SMALL_GAP_S {
            st.boot_to_epoch_offset_us = gps_epoch_us - mono;
            if let Some(last) = st.last_discipline {
                let elapsed_s = last.elapsed().as_secs_f64();
                if elapsed_s > 0.0 {
                    st.drift_rate = gap_s / elapsed_s;
                }
            }
            st.discipline_count += 1;
            if st.discipline_count >= CONVERGE_AFTER && !st.converged {
                st.converged = true;
                debug!(drift_rate = st.drift_rate, "clock discipline converged");
            }
        }
        st.last_discipline = Some(Instant::now());
        Ok(())
    }

    // ── Peer synchronization ──────────────────────────────────────────────

    /// Handle an incoming TIME_SYNC_REQ: measure propagation delay from the
    /// sender's transmit timestamp (32-bit monotonic domain, wrap-guarded)
    /// and remember it. Returns the measured delay for the response line.
    pub async fn on_sync_request(
        &self,
        sender: &NodeId,
        tx_micros_lo32: u32,
        rx_monotonic_us: i64,
    ) -> u32 {
        let rx_lo32 = rx_monotonic_us as u32;
        let mut delay = rx_lo32.wrapping_sub(tx_micros_lo32);
        if delay > 100_000 {
            delay = rx_lo32.wrapping_add(u32::MAX - tx_micros_lo32);
        }
        let mut peers = self.peers.lock().await;
        peers.prop_delays_us.insert(sender.clone(), delay);
        debug!(%sender, prop_delay_us = delay, "propagation delay measured");
        delay
    }

    /// Handle an incoming TIME_SYNC_RESP: compensate the peer's reported
    /// clock with the measured propagation delay and record sync status.
    pub async fn record_peer_sync(
        &self,
        sender: &NodeId,
        their_epoch_s: u64,
        their_micros_lo32: u32,
        prop_delay_us: u32,
    ) -> Result<(), ClockError> {
        let my_epoch_us = self.epoch_micros().await?;
        let my_epoch_s = (my_epoch_us / 1_000_000) as u64;
        let my_lo32 = self.monotonic_us() as u32;

        let effective_us = my_lo32
            .wrapping_sub(their_micros_lo32)
            .wrapping_sub(prop_delay_us) as i32 as i64;

        let synced =
            my_epoch_s == their_epoch_s && effective_us.abs() < PEER_SYNCED_MAX_OFFSET_US;

        let mut peers = self.peers.lock().await;
        peers.prop_delays_us.insert(sender.clone(), prop_delay_us);
        peers.records.insert(
            sender.clone(),
            SyncRecord {
                epoch_s: their_epoch_s,
                offset_us: effective_us,
                synced,
                last_check: Instant::now(),
            },
        );
        debug!(%sender, offset_us = effective_us, synced, "peer sync recorded");
        Ok(())
    }

    /// Two-thirds quorum over peers checked within the last 30 s. Vacuously
    /// true when no fresh records exist (a lone node is trivially synced).
    pub async fn is_mesh_synced(&self, max_offset_ms: u64) -> bool {
        let peers = self.peers.lock().await;
        let fresh: Vec<&SyncRecord> = peers
            .records
            .values()
            .filter(|r| r.last_check.elapsed().as_secs() < PEER_SYNC_FRESH_SECS)
            .collect();
        if fresh.is_empty() {
            return true;
        }
        let synced = fresh
            .iter()
            .filter(|r| r.synced && (r.offset_us.unsigned_abs() / 1000) <= max_offset_ms)
            .count();
        synced * 3 >= fresh.len() * 2
    }

    /// Worst observed propagation delay in ms, ignoring wrap artifacts.
    pub async fn max_prop_delay_ms(&self) -> u64 {
        let peers = self.peers.lock().await;
        peers
            .prop_delays_us
            .values()
            .filter(|&&d| d < PROP_DELAY_SANE_US)
            .max()
            .map(|&d| d as u64 / 1000)
            .unwrap_or(0)
    }

    pub async fn sync_records(&self) -> Vec<(NodeId, SyncRecord)> {
        let peers = self.peers.lock().await;
        let mut out: Vec<_> = peers
            .records
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Forget per-peer sync state; called at session start.
    pub async fn clear_peers(&self) {
        let mut peers = self.peers.lock().await;
        peers.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn dt(secs_past_hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 14)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
            + chrono::Duration::seconds(secs_past_hour as i64)
    }

    #[tokio::test(start_paused = true)]
    async fn undisciplined_clock_is_boot_relative() {
        let clock = MeshClock::new();
        assert!(!clock.is_disciplined().await);
        let us = clock.epoch_micros().await.unwrap();
        assert!(us < 10_000_000, "expected boot-relative micros, got {us}");
    }

    #[tokio::test(start_paused = true)]
    async fn first_fix_calibrates_offset() {
        let clock = MeshClock::new();
        clock.feed_gps(dt(0), 25).await.unwrap();
        assert!(clock.is_disciplined().await);
        let us = clock.epoch_micros().await.unwrap();
        let expect = dt(0).and_utc().timestamp() * 1_000_000 + 250_000;
        assert!((us - expect).abs() < 50_000, "epoch {us} vs {expect}");
    }

    #[tokio::test(start_paused = true)]
    async fn epoch_is_monotone_between_fixes() {
        let clock = MeshClock::new();
        clock.feed_gps(dt(0), 0).await.unwrap();
        let mut prev = clock.epoch_micros().await.unwrap();
        for _ in 0..20 {
            tokio::time::advance(Duration::from_millis(137)).await;
            let now = clock.epoch_micros().await.unwrap();
            assert!(now >= prev);
            prev = now;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_small_gaps_converge() {
        let clock = MeshClock::new();
        clock.feed_gps(dt(0), 0).await.unwrap();
        for i in 1..=4u32 {
            tokio::time::advance(Duration::from_secs(10)).await;
            clock.feed_gps(dt(i * 10), 0).await.unwrap();
        }
        let stats = clock.discipline_stats().await.unwrap();
        assert!(stats.converged);
        assert!(stats.discipline_count >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn large_gap_resets_drift_estimation() {
        let clock = MeshClock::new();
        clock.feed_gps(dt(0), 0).await.unwrap();
        for i in 1..=3u32 {
            tokio::time::advance(Duration::from_secs(10)).await;
            clock.feed_gps(dt(i * 10), 0).await.unwrap();
        }
        assert!(clock.discipline_stats().await.unwrap().converged);
        // GPS jumps far ahead of the disciplined clock.
        tokio::time::advance(Duration::from_secs(1)).await;
        clock.feed_gps(dt(600), 0).await.unwrap();
        let stats = clock.discipline_stats().await.unwrap();
        assert!(!stats.converged);
        assert_eq!(stats.discipline_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn bogus_gps_year_rejected() {
        let clock = MeshClock::new();
        let old = NaiveDate::from_ymd_opt(2005, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(clock.feed_gps(old, 0).await, Err(ClockError::NoDateTime));
        assert!(!clock.is_disciplined().await);
    }

    #[tokio::test(start_paused = true)]
    async fn mesh_sync_quorum() {
        let clock = MeshClock::new();
        clock.feed_gps(dt(0), 0).await.unwrap();
        let epoch_s = (clock.epoch_micros().await.unwrap() / 1_000_000) as u64;
        let lo32 = clock.monotonic_us() as u32;

        // Two synced peers, one badly off.
        for id in ["N2", "N3"] {
            clock
                .record_peer_sync(&NodeId::new(id).unwrap(), epoch_s, lo32.wrapping_sub(200), 100)
                .await
                .unwrap();
        }
        clock
            .record_peer_sync(&NodeId::new("N4").unwrap(), epoch_s + 7, lo32, 0)
            .await
            .unwrap();

        assert!(clock.is_mesh_synced(10).await);

        // Knock one good peer out: 1/3 synced, below quorum.
        clock
            .record_peer_sync(&NodeId::new("N2").unwrap(), epoch_s + 9, lo32, 0)
            .await
            .unwrap();
        assert!(!clock.is_mesh_synced(10).await);
    }

    #[tokio::test(start_paused = true)]
    async fn prop_delay_measurement_and_wrap_guard() {
        let clock = MeshClock::new();
        let n2 = NodeId::new("N2").unwrap();
        tokio::time::advance(Duration::from_millis(500)).await;
        let rx = clock.monotonic_us();
        let tx = (rx - 1800) as u32;
        let delay = clock.on_sync_request(&n2, tx, rx).await;
        assert_eq!(delay, 1800);
        assert_eq!(clock.max_prop_delay_ms().await, 1);
    }
}
