//! Cache-status aggregator
//!
//! Folds per-device health into the tri-state availability signal consumed
//! by the upstream write cache. Each redundancy group is scored from its
//! member records, the groups are folded to a local value, and the local
//! value is combined with the peer's last report. The upstream consumer is
//! notified only when the combined value actually transitions.

use tracing::{debug, info};

use crate::domain::{CacheStatus, DeviceLocation, DeviceRecord};
use crate::monitor::RedundancyGroups;

// =============================================================================
// Combine lattice
// =============================================================================

/// Severity order for folding: Failed absorbs everything, Degraded beats Ok.
fn severity(status: CacheStatus) -> u8 {
    match status {
        CacheStatus::Ok => 0,
        CacheStatus::Uninitialized => 0,
        CacheStatus::Degraded => 1,
        CacheStatus::Failed => 2,
    }
}

/// Combine the local value with the peer's last report.
///
/// `combine(Failed, x) = Failed`; `combine(Degraded, Ok) = Degraded`;
/// `combine(Ok, Ok) = Ok`. An uninitialized peer counts as Ok here; the
/// caller separately re-broadcasts the local value so the peer can fill in.
pub fn combine(local: CacheStatus, peer: CacheStatus) -> CacheStatus {
    if severity(local) >= severity(peer) {
        normalize(local)
    } else {
        normalize(peer)
    }
}

fn normalize(status: CacheStatus) -> CacheStatus {
    match status {
        CacheStatus::Uninitialized => CacheStatus::Ok,
        other => other,
    }
}

// =============================================================================
// Group scoring
// =============================================================================

/// Score one redundancy group from its member records. A slot with no record
/// counts as a faulted member.
fn group_status(members: &[DeviceLocation], lookup: &dyn Fn(DeviceLocation) -> Option<DeviceRecord>) -> CacheStatus {
    let count = members.len();
    if count == 0 {
        return CacheStatus::Ok;
    }

    let mut faulted = 0usize;
    let mut overtemp = 0usize;
    for member in members {
        match lookup(*member) {
            Some(record) => {
                if !record.healthy() {
                    faulted += 1;
                }
                if record.faults.overtemp {
                    overtemp += 1;
                }
            }
            None => faulted += 1,
        }
    }

    // Over-temperature reported independently by two or more members points
    // at the shared environment, not one bad unit.
    if overtemp >= 2 {
        return CacheStatus::Failed;
    }

    if faulted == 0 {
        CacheStatus::Ok
    } else if faulted == count || (count > 2 && faulted >= count - 1) {
        CacheStatus::Failed
    } else {
        CacheStatus::Degraded
    }
}

// =============================================================================
// Aggregator
// =============================================================================

/// What a recompute produced.
#[derive(Debug, Default, PartialEq)]
pub struct AggregateOutcome {
    /// Combined value transitioned (old, new); notify upstream exactly once
    pub transition: Option<(CacheStatus, CacheStatus)>,
    /// Local value to send to the peer (changed, or re-broadcast requested)
    pub broadcast: Option<CacheStatus>,
}

/// Tracks local, last-known-peer, and combined cache status.
pub struct CacheStatusAggregator {
    groups: RedundancyGroups,
    local: CacheStatus,
    peer: CacheStatus,
    combined: CacheStatus,
}

impl CacheStatusAggregator {
    pub fn new(groups: RedundancyGroups) -> Self {
        Self {
            groups,
            local: CacheStatus::Uninitialized,
            peer: CacheStatus::Uninitialized,
            combined: CacheStatus::Uninitialized,
        }
    }

    pub fn local(&self) -> CacheStatus {
        self.local
    }

    pub fn peer(&self) -> CacheStatus {
        self.peer
    }

    /// Last combined value handed upstream.
    pub fn combined(&self) -> CacheStatus {
        self.combined
    }

    /// Recompute the local value from member records and fold in the peer.
    pub fn recompute(
        &mut self,
        lookup: &dyn Fn(DeviceLocation) -> Option<DeviceRecord>,
    ) -> AggregateOutcome {
        let local = self
            .groups
            .groups()
            .iter()
            .map(|members| group_status(members, lookup))
            .max_by_key(|s| severity(*s))
            .unwrap_or(CacheStatus::Ok);

        let broadcast = if local != self.local {
            debug!(old = %self.local, new = %local, "local cache status changed");
            Some(local)
        } else {
            None
        };
        self.local = local;

        AggregateOutcome {
            transition: self.update_combined(),
            broadcast,
        }
    }

    /// Fold in a fresh peer report.
    pub fn update_peer(&mut self, status: CacheStatus) -> AggregateOutcome {
        // An uninitialized peer wants our value again; combining still treats
        // it as Ok.
        let broadcast = if status == CacheStatus::Uninitialized {
            Some(self.local)
        } else {
            None
        };
        self.peer = status;

        AggregateOutcome {
            transition: self.update_combined(),
            broadcast,
        }
    }

    fn update_combined(&mut self) -> Option<(CacheStatus, CacheStatus)> {
        let new = combine(self.local, self.peer);
        if new != self.combined {
            let old = self.combined;
            info!(old = %old, new = %new, "combined cache status transition");
            self.combined = new;
            Some((old, new))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DeviceClass, FaultFlags, FirmwareProtocol, SpId};
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn record(location: DeviceLocation, inserted: bool, faults: FaultFlags) -> DeviceRecord {
        DeviceRecord {
            location,
            class: DeviceClass::PowerSupply,
            inserted,
            faults,
            firmware_rev: "1.00".into(),
            product_id: "ACME-PS-550".into(),
            downloadable: true,
            protocol: FirmwareProtocol::Manifest,
            owner: SpId::SpA,
            supported: true,
        }
    }

    fn fault() -> FaultFlags {
        FaultFlags {
            general: true,
            ..FaultFlags::default()
        }
    }

    fn two_member_setup(
        a_faults: Option<FaultFlags>,
        b_faults: Option<FaultFlags>,
    ) -> (CacheStatusAggregator, HashMap<DeviceLocation, DeviceRecord>) {
        let loc_a = DeviceLocation::new(0, 0, 0);
        let loc_b = DeviceLocation::new(0, 0, 1);
        let groups = RedundancyGroups::new(vec![vec![loc_a, loc_b]]);
        let mut records = HashMap::new();
        records.insert(loc_a, record(loc_a, true, a_faults.unwrap_or_default()));
        records.insert(loc_b, record(loc_b, true, b_faults.unwrap_or_default()));
        (CacheStatusAggregator::new(groups), records)
    }

    #[test]
    fn test_all_healthy_is_ok() {
        let (mut agg, records) = two_member_setup(None, None);
        let out = agg.recompute(&|l| records.get(&l).cloned());
        assert_eq!(agg.combined(), CacheStatus::Ok);
        assert_eq!(out.transition, Some((CacheStatus::Uninitialized, CacheStatus::Ok)));
    }

    #[test]
    fn test_one_of_two_faulted_is_degraded() {
        let (mut agg, records) = two_member_setup(Some(fault()), None);
        agg.recompute(&|l| records.get(&l).cloned());
        assert_eq!(agg.combined(), CacheStatus::Degraded);
    }

    #[test]
    fn test_both_faulted_is_failed_with_single_notification() {
        // Scenario: both members of a two-device group fail at once.
        let (mut agg, records) = two_member_setup(Some(fault()), Some(fault()));
        let out = agg.recompute(&|l| records.get(&l).cloned());
        assert_eq!(agg.combined(), CacheStatus::Failed);
        assert_eq!(
            out.transition,
            Some((CacheStatus::Uninitialized, CacheStatus::Failed))
        );

        // recompute with no change: no second notification
        let out = agg.recompute(&|l| records.get(&l).cloned());
        assert_eq!(out.transition, None);
    }

    #[test]
    fn test_missing_record_counts_as_faulted() {
        let (mut agg, mut records) = two_member_setup(None, None);
        records.remove(&DeviceLocation::new(0, 0, 1));
        agg.recompute(&|l| records.get(&l).cloned());
        assert_eq!(agg.local(), CacheStatus::Degraded);
    }

    #[test]
    fn test_overtemp_correlation_escalates_to_failed() {
        let overtemp = FaultFlags {
            overtemp: true,
            ..FaultFlags::default()
        };
        // naive count would say Degraded at worst per member, but two
        // independent overtemps fail the group outright
        let (mut agg, records) = two_member_setup(Some(overtemp), Some(overtemp));
        agg.recompute(&|l| records.get(&l).cloned());
        assert_eq!(agg.local(), CacheStatus::Failed);
    }

    #[test]
    fn test_larger_group_n_minus_one_rule() {
        let locs: Vec<DeviceLocation> =
            (0..4).map(|s| DeviceLocation::new(0, 0, s)).collect();
        let groups = RedundancyGroups::new(vec![locs.clone()]);
        let mut records = HashMap::new();
        for (i, loc) in locs.iter().enumerate() {
            let faults = if i < 3 { fault() } else { FaultFlags::default() };
            records.insert(*loc, record(*loc, true, faults));
        }
        let mut agg = CacheStatusAggregator::new(groups);
        agg.recompute(&|l| records.get(&l).cloned());
        // 3 of 4 faulted: >= count - 1, group fails
        assert_eq!(agg.local(), CacheStatus::Failed);
    }

    #[test]
    fn test_peer_failed_dominates_local_ok() {
        let (mut agg, records) = two_member_setup(None, None);
        agg.recompute(&|l| records.get(&l).cloned());
        let out = agg.update_peer(CacheStatus::Failed);
        assert_eq!(agg.combined(), CacheStatus::Failed);
        assert_eq!(out.transition, Some((CacheStatus::Ok, CacheStatus::Failed)));
    }

    #[test]
    fn test_uninitialized_peer_counts_ok_but_rebroadcasts() {
        let (mut agg, records) = two_member_setup(None, None);
        agg.recompute(&|l| records.get(&l).cloned());
        let out = agg.update_peer(CacheStatus::Uninitialized);
        assert_eq!(agg.combined(), CacheStatus::Ok);
        assert_eq!(out.broadcast, Some(CacheStatus::Ok));
    }

    #[test]
    fn test_local_change_broadcasts() {
        let (mut agg, mut records) = two_member_setup(None, None);
        let out = agg.recompute(&|l| records.get(&l).cloned());
        assert_eq!(out.broadcast, Some(CacheStatus::Ok));

        let loc_a = DeviceLocation::new(0, 0, 0);
        records.insert(loc_a, record(loc_a, true, fault()));
        let out = agg.recompute(&|l| records.get(&l).cloned());
        assert_eq!(out.broadcast, Some(CacheStatus::Degraded));

        // steady state: no broadcast
        let out = agg.recompute(&|l| records.get(&l).cloned());
        assert_eq!(out.broadcast, None);
    }

    fn arb_status() -> impl Strategy<Value = CacheStatus> {
        prop_oneof![
            Just(CacheStatus::Ok),
            Just(CacheStatus::Degraded),
            Just(CacheStatus::Failed),
            Just(CacheStatus::Uninitialized),
        ]
    }

    proptest! {
        #[test]
        fn prop_failed_absorbs(x in arb_status()) {
            prop_assert_eq!(combine(CacheStatus::Failed, x), CacheStatus::Failed);
            prop_assert_eq!(combine(x, CacheStatus::Failed), CacheStatus::Failed);
        }

        #[test]
        fn prop_combine_commutes(a in arb_status(), b in arb_status()) {
            prop_assert_eq!(combine(a, b), combine(b, a));
        }

        #[test]
        fn prop_combine_never_yields_uninitialized(a in arb_status(), b in arb_status()) {
            prop_assert_ne!(combine(a, b), CacheStatus::Uninitialized);
        }
    }

    #[test]
    fn test_combine_table() {
        assert_eq!(combine(CacheStatus::Ok, CacheStatus::Ok), CacheStatus::Ok);
        assert_eq!(
            combine(CacheStatus::Degraded, CacheStatus::Ok),
            CacheStatus::Degraded
        );
        assert_eq!(
            combine(CacheStatus::Ok, CacheStatus::Uninitialized),
            CacheStatus::Ok
        );
    }
}
