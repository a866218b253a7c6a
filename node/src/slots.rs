//! TDMA reporting schedule.
//!
//! During a session every participant owns one transmission slot per cycle,
//! assigned by position in the coordinator's sorted node list. Slot duration
//! shrinks as the roster grows so a full cycle stays bounded; a 200 ms guard
//! interval at the end of each slot absorbs serial jitter. The cycle origin
//! is the coordinator-supplied start timestamp and is never reset
//! mid-session — late joiners are appended and only the duration recalculates.

use meshloc_types::NodeId;
use tracing::debug;

const GUARD_MS: u64 = 200;

#[derive(Debug, Default)]
pub struct ReportingSchedule {
    order: Vec<NodeId>,
    slot_ms: u64,
    cycle_start_ms: Option<u64>,
}

impl ReportingSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.order.clear();
        self.slot_ms = 0;
        self.cycle_start_ms = None;
    }

    /// Rebuild from a coordinator node list and cycle origin.
    pub fn rebuild(&mut self, nodes: &[NodeId], cycle_start_ms: u64) {
        self.order = nodes.to_vec();
        self.cycle_start_ms = Some(cycle_start_ms);
        self.recalculate();
    }

    /// Append a node if absent (late joiner). Returns true when added.
    /// `cycle_start_ms` stays untouched.
    pub fn add_node(&mut self, id: &NodeId) -> bool {
        if self.order.contains(id) {
            return false;
        }
        self.order.push(id.clone());
        self.recalculate();
        debug!(node = %id, slot = self.order.len() - 1, slot_ms = self.slot_ms, "slot registered");
        true
    }

    pub fn set_cycle_start(&mut self, ms: u64) {
        self.cycle_start_ms = Some(ms);
    }

    pub fn cycle_start_ms(&self) -> Option<u64> {
        self.cycle_start_ms
    }

    pub fn slot_duration_ms(&self) -> u64 {
        self.slot_ms
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.order.contains(id)
    }

    pub fn slot_index(&self, id: &NodeId) -> Option<usize> {
        self.order.iter().position(|n| n == id)
    }

    fn recalculate(&mut self) {
        self.slot_ms = match self.order.len() {
            0 => 0,
            1..=3 => 3000,
            4..=6 => 2500,
            _ => 2000,
        };
    }

    /// May `id` transmit its report at `now_ms` (same clock domain as the
    /// cycle origin)? False outside the slot window or inside the guard
    /// interval; priority traffic bypasses this check at the bus.
    pub fn is_slot_active(&self, id: &NodeId, now_ms: u64) -> bool {
        let (Some(start), Some(slot_idx)) = (self.cycle_start_ms, self.slot_index(id)) else {
            return false;
        };
        if self.slot_ms == 0 || now_ms < start {
            return false;
        }
        let cycle_ms = self.slot_ms * self.order.len() as u64;
        let pos = (now_ms - start) % cycle_ms;
        let slot_start = slot_idx as u64 * self.slot_ms;
        let slot_end = slot_start + self.slot_ms - GUARD_MS;
        (slot_start..slot_end).contains(&pos)
    }

    /// Which cycle iteration `now_ms` falls in; lets a sender emit at most
    /// one report per slot window.
    pub fn cycle_number(&self, now_ms: u64) -> Option<u64> {
        let start = self.cycle_start_ms?;
        if self.slot_ms == 0 || self.order.is_empty() || now_ms < start {
            return None;
        }
        Some((now_ms - start) / (self.slot_ms * self.order.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|n| NodeId::new(n).unwrap()).collect()
    }

    #[test]
    fn duration_table() {
        let mut s = ReportingSchedule::new();
        s.rebuild(&ids(&["N1", "N2"]), 0);
        assert_eq!(s.slot_duration_ms(), 3000);
        s.rebuild(&ids(&["N1", "N2", "N3"]), 0);
        assert_eq!(s.slot_duration_ms(), 3000);
        s.rebuild(&ids(&["N1", "N2", "N3", "N4", "N5"]), 0);
        assert_eq!(s.slot_duration_ms(), 2500);
        s.rebuild(&ids(&["N1", "N2", "N3", "N4", "N5", "N6", "N7"]), 0);
        assert_eq!(s.slot_duration_ms(), 2000);
    }

    #[test]
    fn slot_windows_and_guard() {
        let mut s = ReportingSchedule::new();
        let nodes = ids(&["N1", "N2", "N3"]);
        s.rebuild(&nodes, 10_000);

        // N1 owns [0, 2800) of each 9000 ms cycle.
        assert!(s.is_slot_active(&nodes[0], 10_000));
        assert!(s.is_slot_active(&nodes[0], 12_799));
        assert!(!s.is_slot_active(&nodes[0], 12_800)); // guard interval
        assert!(!s.is_slot_active(&nodes[0], 13_000)); // N2's slot

        // N2 owns [3000, 5800).
        assert!(s.is_slot_active(&nodes[1], 13_000));
        assert!(!s.is_slot_active(&nodes[1], 10_500));

        // Wraps into the next cycle.
        assert!(s.is_slot_active(&nodes[0], 19_000));
        assert_eq!(s.cycle_number(19_000), Some(1));
    }

    #[test]
    fn before_cycle_start_nothing_transmits() {
        let mut s = ReportingSchedule::new();
        let nodes = ids(&["N1", "N2"]);
        s.rebuild(&nodes, 50_000);
        assert!(!s.is_slot_active(&nodes[0], 49_999));
    }

    #[test]
    fn late_joiner_appends_without_moving_cycle_start() {
        let mut s = ReportingSchedule::new();
        let nodes = ids(&["N1", "N2", "N3"]);
        s.rebuild(&nodes, 1_000);
        assert_eq!(s.slot_duration_ms(), 3000);

        let late = NodeId::new("N9").unwrap();
        assert!(s.add_node(&late));
        assert!(!s.add_node(&late));
        assert_eq!(s.slot_index(&late), Some(3));
        assert_eq!(s.slot_duration_ms(), 2500);
        assert_eq!(s.cycle_start_ms(), Some(1_000));
    }

    #[test]
    fn unknown_node_never_active() {
        let mut s = ReportingSchedule::new();
        s.rebuild(&ids(&["N1", "N2"]), 0);
        assert!(!s.is_slot_active(&NodeId::new("ZZ").unwrap(), 100));
    }
}
