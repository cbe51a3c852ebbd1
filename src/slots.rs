use nalgebra::Isometry3;

use crate::types::{PoseMatch, MAX_SENSORS, NUM_DELAY_SLOTS};

/// One pose observation recorded against a delay slot.
#[derive(Debug, Clone, Copy)]
pub struct PoseReport {
    pub local_ts: u64,
    /// Candidate fusion pose derived from the vision pipeline's model pose.
    pub pose: Isometry3<f64>,
    pub score: PoseMatch,
    /// Whether the report actually drove a filter correction.
    pub used: bool,
}

/// A correction anchor into the filter's lagged state.
///
/// Lifecycle: free (`use_count == 0`, `!valid`) → allocated at an exposure
/// event (`valid`, `use_count == 0`) → claimed by one frame per sensor
/// (`use_count > 0`) → free again once every claimant has released. A valid
/// slot whose reports have already been integrated may be reclaimed for a
/// new exposure, silently losing its old identity.
#[derive(Debug, Clone)]
pub struct DelaySlot {
    pub slot_id: usize,
    pub valid: bool,
    pub use_count: u32,
    pub device_time_ns: u64,
    reports: Vec<PoseReport>,
    n_used_reports: usize,
}

impl DelaySlot {
    fn new(slot_id: usize) -> Self {
        Self {
            slot_id,
            valid: false,
            use_count: 0,
            device_time_ns: 0,
            reports: Vec::with_capacity(MAX_SENSORS),
            n_used_reports: 0,
        }
    }

    pub fn reports(&self) -> &[PoseReport] {
        &self.reports
    }

    pub fn n_used_reports(&self) -> usize {
        self.n_used_reports
    }
}

/// Fixed table of delay slots for one tracked device.
#[derive(Debug)]
pub struct DelaySlotTable {
    slots: [DelaySlot; NUM_DELAY_SLOTS],
    cursor: usize,
}

impl Default for DelaySlotTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DelaySlotTable {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(DelaySlot::new),
            cursor: NUM_DELAY_SLOTS - 1,
        }
    }

    /// Allocate a slot for a new exposure at `device_time_ns`.
    ///
    /// Tries, in round-robin order, for a slot with no outstanding claims;
    /// failing that, reclaims a valid slot whose reports were already
    /// integrated into the filter. Returns `None` when every slot is still
    /// awaiting its first correction, in which case the exposure goes
    /// uncorrected for this device.
    pub fn allocate(&mut self, device_time_ns: u64) -> Option<usize> {
        for i in 0..NUM_DELAY_SLOTS {
            let idx = (self.cursor + 1 + i) % NUM_DELAY_SLOTS;
            if self.slots[idx].use_count == 0 {
                self.cursor = idx;
                self.rearm(idx, device_time_ns);
                return Some(idx);
            }
        }
        for idx in 0..NUM_DELAY_SLOTS {
            let slot = &self.slots[idx];
            if slot.valid && slot.n_used_reports > 0 {
                self.rearm(idx, device_time_ns);
                return Some(idx);
            }
        }
        None
    }

    fn rearm(&mut self, idx: usize, device_time_ns: u64) {
        let slot = &mut self.slots[idx];
        slot.valid = true;
        slot.device_time_ns = device_time_ns;
        slot.reports.clear();
        slot.n_used_reports = 0;
    }

    /// Whether `slot_id` currently anchors the exposure at `device_time_ns`.
    pub fn matches(&self, slot_id: usize, device_time_ns: u64) -> bool {
        let slot = &self.slots[slot_id];
        slot.valid && slot.device_time_ns == device_time_ns
    }

    /// Claim the slot on behalf of an arriving frame. Returns false if the
    /// slot no longer carries the requested identity.
    pub fn claim(&mut self, slot_id: usize, device_time_ns: u64) -> bool {
        if !self.matches(slot_id, device_time_ns) {
            return false;
        }
        self.slots[slot_id].use_count += 1;
        true
    }

    /// Release one claim. Returns true on the transition to zero claims, at
    /// which point the caller must drop the filter's slot constraint.
    /// Releasing an unclaimed or reassigned slot does nothing.
    pub fn release(&mut self, slot_id: usize, device_time_ns: u64) -> bool {
        if !self.matches(slot_id, device_time_ns) {
            return false;
        }
        let slot = &mut self.slots[slot_id];
        if slot.use_count == 0 {
            return false;
        }
        slot.use_count -= 1;
        if slot.use_count == 0 {
            slot.valid = false;
            return true;
        }
        false
    }

    /// Record a pose report against the slot, up to one per sensor.
    pub fn record(&mut self, slot_id: usize, report: PoseReport) {
        let slot = &mut self.slots[slot_id];
        if slot.reports.len() >= MAX_SENSORS {
            log::warn!("delay slot {} report table full, dropping report", slot_id);
            return;
        }
        if report.used {
            slot.n_used_reports += 1;
        }
        slot.reports.push(report);
    }

    pub fn slot(&self, slot_id: usize) -> &DelaySlot {
        &self.slots[slot_id]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(used: bool) -> PoseReport {
        PoseReport {
            local_ts: 0,
            pose: Isometry3::identity(),
            score: PoseMatch::GOOD,
            used,
        }
    }

    #[test]
    fn test_allocate_cycles_through_all_slots() {
        let mut table = DelaySlotTable::new();
        let a = table.allocate(100).unwrap();
        let b = table.allocate(200).unwrap();
        let c = table.allocate(300).unwrap();
        assert_eq!(
            {
                let mut ids = [a, b, c];
                ids.sort();
                ids
            },
            [0, 1, 2]
        );
        assert!(table.matches(c, 300));
    }

    #[test]
    fn test_exhausted_table_returns_none_without_used_reports() {
        let mut table = DelaySlotTable::new();
        for t in [100, 200, 300] {
            let id = table.allocate(t).unwrap();
            assert!(table.claim(id, t));
        }
        assert_eq!(table.allocate(400), None);
    }

    #[test]
    fn test_reclaims_slot_with_integrated_report() {
        let mut table = DelaySlotTable::new();
        let s0 = table.allocate(100).unwrap();
        let s1 = table.allocate(200).unwrap();
        let s2 = table.allocate(300).unwrap();
        for (id, t) in [(s0, 100), (s1, 200), (s2, 300)] {
            assert!(table.claim(id, t));
        }
        table.record(s0, report(true));

        let s3 = table.allocate(400).unwrap();
        assert_eq!(s3, s0);
        assert_eq!(table.slot(s3).device_time_ns, 400);
        assert_eq!(table.slot(s3).n_used_reports(), 0);
        // The untouched slots keep their identity.
        assert!(table.matches(s1, 200));
        assert!(table.matches(s2, 300));
    }

    #[test]
    fn test_release_edge_and_idempotence() {
        let mut table = DelaySlotTable::new();
        let id = table.allocate(100).unwrap();
        assert!(table.claim(id, 100));
        assert!(table.claim(id, 100));
        assert!(!table.release(id, 100));
        assert!(table.release(id, 100));
        // A released slot no longer matches; further releases are no-ops.
        assert!(!table.release(id, 100));
        assert!(!table.matches(id, 100));
        assert_eq!(table.slot(id).use_count, 0);
    }

    #[test]
    fn test_claim_rejects_stale_identity() {
        let mut table = DelaySlotTable::new();
        let id = table.allocate(100).unwrap();
        assert!(!table.claim(id, 999));
        assert_eq!(table.slot(id).use_count, 0);
    }

    #[test]
    fn test_report_table_is_bounded() {
        let mut table = DelaySlotTable::new();
        let id = table.allocate(100).unwrap();
        for _ in 0..MAX_SENSORS + 2 {
            table.record(id, report(false));
        }
        assert_eq!(table.slot(id).reports().len(), MAX_SENSORS);
    }
}
