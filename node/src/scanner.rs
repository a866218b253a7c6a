//! Radio scanner and GPS input contracts.
//!
//! The actual Wi-Fi sniffer and BLE scanner are external drivers: they push
//! [`ScanHit`]s into a bounded queue which the core polls. [`QueueScanner`]
//! is the queue-backed implementation those drivers (and the simulator and
//! tests) feed. GPS is polled once per housekeeping tick through
//! [`GpsSource`].
//!
//! Identity targets (`T-xxxx`) cannot be matched against raw MACs here; the
//! randomization-correlation engine tags hits it has resolved with the
//! identity token before they enter the queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::NaiveDateTime;

use meshloc_types::{Mac, TargetRef};

// ── Scanner contract ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanMode {
    Wifi,
    Ble,
    #[default]
    Both,
}

/// One radio observation from a driver.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanHit {
    pub mac: Mac,
    pub rssi: i8,
    pub channel: u8,
    /// SSID or BLE advertised name, truncated by the driver (≤32 bytes).
    pub name: Option<String>,
    pub is_ble: bool,
    /// Identity token attached by the correlation engine, when resolved.
    pub identity: Option<[u8; 4]>,
}

pub trait Scanner: Send + Sync {
    fn start(&self, mode: ScanMode, duration_s: u32);
    fn stop(&self);
    fn is_scanning(&self) -> bool;
    /// Non-blocking poll of the hit queue.
    fn try_next_hit(&self) -> Option<ScanHit>;
}

/// Bounded-queue scanner backend. Drivers push, the core polls; hits pushed
/// while stopped, or beyond capacity, are dropped.
pub struct QueueScanner {
    queue: Mutex<VecDeque<ScanHit>>,
    scanning: AtomicBool,
    mode: Mutex<ScanMode>,
    capacity: usize,
}

impl Default for QueueScanner {
    fn default() -> Self {
        Self::with_capacity(256)
    }
}

impl QueueScanner {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            scanning: AtomicBool::new(false),
            mode: Mutex::new(ScanMode::Both),
            capacity,
        }
    }

    /// Driver-side entry point.
    pub fn push(&self, hit: ScanHit) {
        if !self.scanning.load(Ordering::Relaxed) {
            return;
        }
        let accept = {
            let mode = *self.mode.lock().unwrap();
            match mode {
                ScanMode::Wifi => !hit.is_ble,
                ScanMode::Ble => hit.is_ble,
                ScanMode::Both => true,
            }
        };
        if !accept {
            return;
        }
        let mut q = self.queue.lock().unwrap();
        if q.len() < self.capacity {
            q.push_back(hit);
        }
    }
}

impl Scanner for QueueScanner {
    fn start(&self, mode: ScanMode, _duration_s: u32) {
        *self.mode.lock().unwrap() = mode;
        self.queue.lock().unwrap().clear();
        self.scanning.store(true, Ordering::Relaxed);
    }

    fn stop(&self) {
        self.scanning.store(false, Ordering::Relaxed);
    }

    fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::Relaxed)
    }

    fn try_next_hit(&self) -> Option<ScanHit> {
        self.queue.lock().unwrap().pop_front()
    }
}

// ── GPS contract ──────────────────────────────────────────────────────────────

/// Latest GPS reading, polled each housekeeping tick. Coordinates are
/// promoted to f64 at this boundary so all downstream geodesy runs in f64.
#[derive(Debug, Clone, Copy, Default)]
pub struct GpsFix {
    pub valid: bool,
    pub lat: f64,
    pub lon: f64,
    pub hdop: f32,
    pub datetime: Option<NaiveDateTime>,
    pub centiseconds: u8,
}

pub trait GpsSource: Send + Sync {
    fn poll(&self) -> GpsFix;
}

/// Fixed-position GPS source for bench setups, tests and the simulator.
#[derive(Default)]
pub struct StaticGps {
    fix: Mutex<GpsFix>,
}

impl StaticGps {
    pub fn new(fix: GpsFix) -> Self {
        Self { fix: Mutex::new(fix) }
    }

    pub fn set(&self, fix: GpsFix) {
        *self.fix.lock().unwrap() = fix;
    }
}

impl GpsSource for StaticGps {
    fn poll(&self) -> GpsFix {
        *self.fix.lock().unwrap()
    }
}

// ── Per-session target accumulator ────────────────────────────────────────────

/// Does a hit belong to the session target?
pub fn hit_matches(target: &TargetRef, hit: &ScanHit) -> bool {
    match target {
        TargetRef::Mac(mac) => hit.mac == *mac,
        TargetRef::Identity(tok) => hit.identity.as_ref() == Some(tok),
    }
}

/// Running per-radio aggregate of matching hits during a session.
#[derive(Debug, Default, Clone)]
pub struct TargetAccumulator {
    pub wifi_hits: u32,
    pub wifi_rssi_sum: f64,
    pub ble_hits: u32,
    pub ble_rssi_sum: f64,
    pub best_rssi: Option<i8>,
    pub last_hit_epoch_us: Option<i64>,
}

impl TargetAccumulator {
    pub fn add(&mut self, hit: &ScanHit, epoch_us: Option<i64>) {
        if hit.is_ble {
            self.ble_hits += 1;
            self.ble_rssi_sum += hit.rssi as f64;
        } else {
            self.wifi_hits += 1;
            self.wifi_rssi_sum += hit.rssi as f64;
        }
        self.best_rssi = Some(self.best_rssi.map_or(hit.rssi, |b| b.max(hit.rssi)));
        if epoch_us.is_some() {
            self.last_hit_epoch_us = epoch_us;
        }
    }

    pub fn total_hits(&self) -> u32 {
        self.wifi_hits + self.ble_hits
    }

    pub fn wifi_avg(&self) -> Option<i8> {
        (self.wifi_hits > 0)
            .then(|| (self.wifi_rssi_sum / self.wifi_hits as f64).round() as i8)
    }

    pub fn ble_avg(&self) -> Option<i8> {
        (self.ble_hits > 0).then(|| (self.ble_rssi_sum / self.ble_hits as f64).round() as i8)
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(rssi: i8, is_ble: bool) -> ScanHit {
        ScanHit {
            mac: Mac([0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01]),
            rssi,
            channel: 6,
            name: None,
            is_ble,
            identity: None,
        }
    }

    #[test]
    fn queue_respects_scanning_flag_and_capacity() {
        let s = QueueScanner::with_capacity(2);
        s.push(hit(-50, false));
        assert!(s.try_next_hit().is_none());

        s.start(ScanMode::Both, 30);
        s.push(hit(-50, false));
        s.push(hit(-51, false));
        s.push(hit(-52, false)); // over capacity, dropped
        assert_eq!(s.try_next_hit().unwrap().rssi, -50);
        assert_eq!(s.try_next_hit().unwrap().rssi, -51);
        assert!(s.try_next_hit().is_none());
    }

    #[test]
    fn mode_filters_radio() {
        let s = QueueScanner::default();
        s.start(ScanMode::Ble, 30);
        s.push(hit(-40, false));
        s.push(hit(-41, true));
        assert_eq!(s.try_next_hit().unwrap().rssi, -41);
        assert!(s.try_next_hit().is_none());
    }

    #[test]
    fn accumulator_tracks_both_radios() {
        let mut acc = TargetAccumulator::default();
        acc.add(&hit(-60, false), Some(1));
        acc.add(&hit(-70, false), Some(2));
        acc.add(&hit(-80, true), Some(3));
        assert_eq!(acc.wifi_avg(), Some(-65));
        assert_eq!(acc.ble_avg(), Some(-80));
        assert_eq!(acc.total_hits(), 3);
        assert_eq!(acc.best_rssi, Some(-60));
        assert_eq!(acc.last_hit_epoch_us, Some(3));
    }

    #[test]
    fn identity_targets_match_only_tagged_hits() {
        let target = TargetRef::parse("T-0a9f").unwrap();
        let mut h = hit(-50, true);
        assert!(!hit_matches(&target, &h));
        h.identity = Some(*b"0a9f");
        assert!(hit_matches(&target, &h));
    }
}
