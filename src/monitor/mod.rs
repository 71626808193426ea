//! Device status monitor
//!
//! Ingests raw per-slot hardware signals (pushed notifications or a full
//! startup poll), filters fault flicker through the debounce set, keeps the
//! canonical `DeviceRecord` per slot, and emits change events. Fault events
//! fire on transition only.
//!
//! Two classes of expected transients are suppressed outright, as policy
//! data rather than inline branching: faults on a device that is itself
//! mid-activation (image activation resets the device), and faults observed
//! while the device's cross-controller counterpart is mid-activation.

pub mod debounce;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::domain::events::{DeviceEvent, FaultKind};
use crate::domain::{
    DeviceClass, DeviceLocation, DeviceRecord, FamilyPolicy, FaultFlags, RawDeviceSignal,
};
use crate::domain::ports::DiscoveryNotification;
use debounce::DebounceSet;

pub use debounce::DebounceConfig;

// =============================================================================
// Redundancy topology
// =============================================================================

/// Static grouping of slots into redundancy groups (the devices whose
/// combined health feeds one cache-availability signal). For two-member
/// groups the other member is the device's twin.
#[derive(Debug, Clone, Default)]
pub struct RedundancyGroups {
    groups: Vec<Vec<DeviceLocation>>,
}

impl RedundancyGroups {
    pub fn new(groups: Vec<Vec<DeviceLocation>>) -> Self {
        Self { groups }
    }

    pub fn groups(&self) -> &[Vec<DeviceLocation>] {
        &self.groups
    }

    /// The group containing this slot, if any.
    pub fn group_of(&self, location: DeviceLocation) -> Option<&[DeviceLocation]> {
        self.groups
            .iter()
            .find(|g| g.contains(&location))
            .map(Vec::as_slice)
    }

    /// The redundant twin: the other member of a two-member group.
    pub fn twin(&self, location: DeviceLocation) -> Option<DeviceLocation> {
        let group = self.group_of(location)?;
        if group.len() == 2 {
            group.iter().copied().find(|l| *l != location)
        } else {
            None
        }
    }
}

// =============================================================================
// Suppression policy
// =============================================================================

/// Slots whose faults are currently expected and must not be reported.
///
/// Shared between the monitor (reader) and the upgrade orchestrator / peer
/// coordinator (writers). Peer-side entries carry a deadline so a peer that
/// dies mid-activation cannot mute a slot forever.
#[derive(Debug, Default)]
pub struct SuppressionPolicy {
    local_activating: HashSet<DeviceLocation>,
    peer_activating: HashMap<DeviceLocation, Instant>,
}

impl SuppressionPolicy {
    pub fn mark_local_activating(&mut self, location: DeviceLocation) {
        self.local_activating.insert(location);
    }

    pub fn clear_local_activating(&mut self, location: DeviceLocation) {
        self.local_activating.remove(&location);
    }

    pub fn mark_peer_activating(&mut self, location: DeviceLocation, until: Instant) {
        self.peer_activating.insert(location, until);
    }

    pub fn clear_peer_activating(&mut self, location: DeviceLocation) {
        self.peer_activating.remove(&location);
    }

    fn peer_activating_now(&self, location: DeviceLocation, now: Instant) -> bool {
        self.peer_activating
            .get(&location)
            .map(|until| *until > now)
            .unwrap_or(false)
    }

    /// Whether faults at this slot are suppressed right now.
    pub fn suppressed(
        &self,
        location: DeviceLocation,
        twin: Option<DeviceLocation>,
        now: Instant,
    ) -> bool {
        if self.local_activating.contains(&location) {
            return true;
        }
        if self.peer_activating_now(location, now) {
            return true;
        }
        if let Some(twin) = twin {
            if self.peer_activating_now(twin, now) {
                return true;
            }
        }
        false
    }
}

// =============================================================================
// Monitor
// =============================================================================

/// Monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Class of device this monitor instance manages
    pub class: DeviceClass,
    /// Debounce settings
    pub debounce: DebounceConfig,
    /// Family coexistence policy (externally supplied)
    pub family_policy: FamilyPolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            class: DeviceClass::PowerSupply,
            debounce: DebounceConfig::default(),
            family_policy: FamilyPolicy::default(),
        }
    }
}

/// What one intake pass produced.
#[derive(Debug, Default)]
pub struct MonitorOutput {
    /// Events to publish (transition-only)
    pub events: Vec<DeviceEvent>,
    /// Slots whose records changed this pass
    pub changed: Vec<DeviceLocation>,
    /// Slots whose devices were removed this pass
    pub removed: Vec<DeviceLocation>,
    /// A device family was learned for the first time and should be persisted
    pub learned_family: Option<String>,
}

impl MonitorOutput {
    fn merge(&mut self, other: MonitorOutput) {
        self.events.extend(other.events);
        self.changed.extend(other.changed);
        self.removed.extend(other.removed);
        if other.learned_family.is_some() {
            self.learned_family = other.learned_family;
        }
    }
}

/// Owns the canonical device records for one device class.
pub struct DeviceMonitor {
    config: MonitorConfig,
    groups: RedundancyGroups,
    suppression: Arc<RwLock<SuppressionPolicy>>,
    records: HashMap<DeviceLocation, DeviceRecord>,
    last_raw: HashMap<DeviceLocation, RawDeviceSignal>,
    debounce: DebounceSet,
    /// Family recorded at first boot; conflicting families are unsupported
    expected_family: Option<String>,
}

impl DeviceMonitor {
    pub fn new(
        config: MonitorConfig,
        groups: RedundancyGroups,
        suppression: Arc<RwLock<SuppressionPolicy>>,
    ) -> Self {
        let debounce = DebounceSet::new(config.debounce.clone());
        Self {
            config,
            groups,
            suppression,
            records: HashMap::new(),
            last_raw: HashMap::new(),
            debounce,
            expected_family: None,
        }
    }

    /// Restore the persisted expected family (Specialize phase) or set it
    /// from the control surface.
    pub fn set_expected_family(&mut self, family: Option<String>) {
        self.expected_family = family;
    }

    pub fn expected_family(&self) -> Option<&str> {
        self.expected_family.as_deref()
    }

    /// Canonical record for a slot.
    pub fn record(&self, location: DeviceLocation) -> Option<&DeviceRecord> {
        self.records.get(&location)
    }

    /// All canonical records.
    pub fn records(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.records.values()
    }

    pub fn groups(&self) -> &RedundancyGroups {
        &self.groups
    }

    /// Full startup sweep.
    pub fn full_poll(
        &mut self,
        samples: Vec<(DeviceLocation, RawDeviceSignal)>,
        now: Instant,
    ) -> MonitorOutput {
        let mut out = MonitorOutput::default();
        for (location, signal) in samples {
            out.merge(self.process_signal(location, signal, now));
        }
        out
    }

    /// Apply one batch of pushed notifications. Removals are processed ahead
    /// of updates so a removed device cannot be acted upon later in the same
    /// tick.
    pub fn handle_notifications(
        &mut self,
        notes: Vec<DiscoveryNotification>,
        now: Instant,
    ) -> MonitorOutput {
        let mut out = MonitorOutput::default();

        for note in notes
            .iter()
            .filter(|n| matches!(n, DiscoveryNotification::Removed(_)))
        {
            if let DiscoveryNotification::Removed(location) = note {
                out.merge(self.handle_removal(*location));
            }
        }
        for note in notes {
            if let DiscoveryNotification::Updated(location, signal) = note {
                if out.removed.contains(&location) {
                    continue;
                }
                out.merge(self.process_signal(location, signal, now));
            }
        }
        out
    }

    /// Periodic debounce sweep: re-evaluate slots whose window just expired.
    pub fn sweep_debounce(&mut self, now: Instant) -> MonitorOutput {
        let mut out = MonitorOutput::default();
        for location in self.debounce.sweep(now) {
            let Some(signal) = self.last_raw.get(&location).cloned() else {
                // window outlived its device; drop it
                self.debounce.close(location);
                continue;
            };
            out.merge(self.process_signal(location, signal, now));
        }
        out
    }

    /// Device pulled: destroy the record and its debounce window. Work item
    /// teardown is the orchestrator's half of removal and runs first in the
    /// engine's removal path.
    pub fn handle_removal(&mut self, location: DeviceLocation) -> MonitorOutput {
        let mut out = MonitorOutput::default();
        self.debounce.remove_slot(location);
        self.last_raw.remove(&location);
        if self.records.remove(&location).is_some() {
            info!(location = %location, "device removed");
            out.events.push(DeviceEvent::DeviceRemoved {
                location,
                timestamp: Utc::now(),
            });
            out.changed.push(location);
            out.removed.push(location);
        } else {
            warn!(location = %location, "removal for unknown device");
        }
        out
    }

    // =========================================================================
    // Core per-slot processing
    // =========================================================================

    fn process_signal(
        &mut self,
        location: DeviceLocation,
        signal: RawDeviceSignal,
        now: Instant,
    ) -> MonitorOutput {
        let mut out = MonitorOutput::default();
        self.last_raw.insert(location, signal.clone());

        let is_new = !self.records.contains_key(&location);
        if is_new {
            let record = DeviceRecord::from_signal(location, self.config.class, &signal);
            if record.inserted {
                info!(
                    location = %location,
                    product_id = %record.product_id,
                    "device inserted"
                );
                out.events.push(DeviceEvent::DeviceInserted {
                    location,
                    product_id: record.product_id.clone(),
                    timestamp: Utc::now(),
                });
            }
            self.records.insert(location, record);
            out.changed.push(location);
            self.apply_family_policy(location, &signal, &mut out);
        }

        // Non-fault fields track the raw signal directly.
        let before = self.records.get(&location).cloned();
        {
            let record = self.records.get_mut(&location).expect("record just ensured");
            if !record.inserted && signal.inserted {
                out.events.push(DeviceEvent::DeviceInserted {
                    location,
                    product_id: signal.product_id.clone(),
                    timestamp: Utc::now(),
                });
            }
            record.inserted = signal.inserted;
            record.firmware_rev = signal.firmware_rev.clone();
            record.product_id = signal.product_id.clone();
            record.downloadable = signal.downloadable;
            record.protocol = signal.protocol;
            record.owner = signal.owner;
        }
        if !is_new {
            self.apply_family_policy(location, &signal, &mut out);
        }

        self.debounce_faults(location, &signal, now, &mut out);

        if let Some(before) = before {
            let after = self.records.get(&location).expect("record present");
            if *after != before && !out.changed.contains(&location) {
                out.changed.push(location);
            }
        }
        out
    }

    /// Debounce-gated fault application for one slot.
    fn debounce_faults(
        &mut self,
        location: DeviceLocation,
        signal: &RawDeviceSignal,
        now: Instant,
        out: &mut MonitorOutput,
    ) {
        let twin = self.groups.twin(location);
        let suppressed = self.suppression.read().suppressed(location, twin, now);

        // While suppressed the slot behaves as fault-free: an activation
        // reset must never read as a hardware fault.
        let raw_faulted = !suppressed && signal.any_fault();
        let prev_faulted = self
            .records
            .get(&location)
            .map(|r| r.faults.any())
            .unwrap_or(false);

        if raw_faulted {
            if prev_faulted {
                // already faulted; track per-bit changes directly
                self.apply_faults(location, signal, out);
            } else if self.debounce.expired(location) {
                self.debounce.close(location);
                self.apply_faults(location, signal, out);
            } else {
                // rising edge: hold the visible bits, open (or keep) window
                self.debounce.open(location, now);
            }
        } else {
            self.debounce.close(location);
            if prev_faulted {
                self.apply_faults(location, signal, out);
            }
        }
    }

    /// Copy the raw fault bits into the record, emitting one event per bit
    /// transition.
    fn apply_faults(
        &mut self,
        location: DeviceLocation,
        signal: &RawDeviceSignal,
        out: &mut MonitorOutput,
    ) {
        let Some(record) = self.records.get_mut(&location) else {
            return;
        };
        let new = FaultFlags {
            general: signal.general_fault,
            internal: signal.internal_fault,
            overtemp: signal.overtemp,
            fault_register: signal.fault_register_fail,
        };
        let old = record.faults;
        if old == new {
            return;
        }

        let transitions = [
            (old.general, new.general, FaultKind::General),
            (old.internal, new.internal, FaultKind::Internal),
            (old.overtemp, new.overtemp, FaultKind::OverTemperature),
            (old.fault_register, new.fault_register, FaultKind::FaultRegister),
        ];
        for (was, is, kind) in transitions {
            if !was && is {
                info!(location = %location, fault = %kind, "fault asserted");
                out.events.push(DeviceEvent::FaultAsserted {
                    location,
                    fault: kind,
                    timestamp: Utc::now(),
                });
            } else if was && !is {
                info!(location = %location, fault = %kind, "fault cleared");
                out.events.push(DeviceEvent::FaultCleared {
                    location,
                    fault: kind,
                    timestamp: Utc::now(),
                });
            }
        }

        record.faults = new;
        if !out.changed.contains(&location) {
            out.changed.push(location);
        }
    }

    /// First observed family is recorded; later conflicting families mark the
    /// device unsupported.
    fn apply_family_policy(
        &mut self,
        location: DeviceLocation,
        signal: &RawDeviceSignal,
        out: &mut MonitorOutput,
    ) {
        let Some(family) = self.config.family_policy.family(&signal.product_id) else {
            return;
        };
        match &self.expected_family {
            None => {
                info!(family = family, "recording device family for this platform");
                self.expected_family = Some(family.to_string());
                out.learned_family = Some(family.to_string());
            }
            Some(expected) if expected != family => {
                warn!(
                    location = %location,
                    family = family,
                    expected = expected.as_str(),
                    "device family conflicts with platform policy"
                );
                if let Some(record) = self.records.get_mut(&location) {
                    record.supported = false;
                }
            }
            Some(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FirmwareProtocol, SpId};
    use std::time::Duration;

    fn signal(fault: bool) -> RawDeviceSignal {
        RawDeviceSignal {
            inserted: true,
            general_fault: fault,
            internal_fault: false,
            overtemp: false,
            fault_register_fail: false,
            firmware_rev: "1.00".into(),
            product_id: "ACME-PS-550".into(),
            downloadable: true,
            protocol: FirmwareProtocol::Manifest,
            owner: SpId::SpA,
        }
    }

    fn monitor() -> DeviceMonitor {
        let groups = RedundancyGroups::new(vec![vec![
            DeviceLocation::new(0, 0, 0),
            DeviceLocation::new(0, 0, 1),
        ]]);
        DeviceMonitor::new(
            MonitorConfig::default(),
            groups,
            Arc::new(RwLock::new(SuppressionPolicy::default())),
        )
    }

    fn fault_events(out: &MonitorOutput) -> usize {
        out.events
            .iter()
            .filter(|e| matches!(e, DeviceEvent::FaultAsserted { .. }))
            .count()
    }

    #[test]
    fn test_transient_fault_produces_no_event() {
        // Scenario: fault asserted at t=0, cleared at t=2s, window 6s.
        let mut mon = monitor();
        let loc = DeviceLocation::new(0, 0, 0);
        let t0 = Instant::now();

        let out = mon.process_signal(loc, signal(false), t0);
        assert_eq!(fault_events(&out), 0);

        let out = mon.process_signal(loc, signal(true), t0);
        assert_eq!(fault_events(&out), 0);
        assert!(!mon.record(loc).unwrap().faults.any());

        let out = mon.process_signal(loc, signal(false), t0 + Duration::from_secs(2));
        assert_eq!(fault_events(&out), 0);

        // sweeps after the would-be expiry stay silent
        let out = mon.sweep_debounce(t0 + Duration::from_secs(7));
        assert_eq!(fault_events(&out), 0);
        assert!(!mon.record(loc).unwrap().faults.any());
    }

    #[test]
    fn test_persistent_fault_fires_exactly_once_at_window() {
        // Scenario: fault held for 8s, window 6s: one event at ~6s.
        let mut mon = monitor();
        let loc = DeviceLocation::new(0, 0, 0);
        let t0 = Instant::now();

        mon.process_signal(loc, signal(true), t0);
        assert!(!mon.record(loc).unwrap().faults.any());

        // pre-expiry sweeps are silent
        let out = mon.sweep_debounce(t0 + Duration::from_secs(3));
        assert_eq!(fault_events(&out), 0);

        // expiry applies the fault exactly once
        let out = mon.sweep_debounce(t0 + Duration::from_secs(6));
        assert_eq!(fault_events(&out), 1);
        assert!(mon.record(loc).unwrap().faults.general);

        // further polls with the fault still set stay quiet
        let out = mon.process_signal(loc, signal(true), t0 + Duration::from_secs(8));
        assert_eq!(fault_events(&out), 0);
    }

    #[test]
    fn test_fault_clear_emits_cleared_event() {
        let mut mon = monitor();
        let loc = DeviceLocation::new(0, 0, 0);
        let t0 = Instant::now();

        mon.process_signal(loc, signal(true), t0);
        mon.sweep_debounce(t0 + Duration::from_secs(6));
        assert!(mon.record(loc).unwrap().faults.general);

        let out = mon.process_signal(loc, signal(false), t0 + Duration::from_secs(10));
        assert!(out
            .events
            .iter()
            .any(|e| matches!(e, DeviceEvent::FaultCleared { .. })));
        assert!(!mon.record(loc).unwrap().faults.any());
    }

    #[test]
    fn test_suppression_during_own_activation() {
        let suppression = Arc::new(RwLock::new(SuppressionPolicy::default()));
        let groups = RedundancyGroups::default();
        let mut mon = DeviceMonitor::new(MonitorConfig::default(), groups, suppression.clone());
        let loc = DeviceLocation::new(0, 0, 0);
        let t0 = Instant::now();

        mon.process_signal(loc, signal(false), t0);
        suppression.write().mark_local_activating(loc);

        // activation reset looks like a fault; nothing may fire, ever
        mon.process_signal(loc, signal(true), t0 + Duration::from_secs(1));
        let out = mon.sweep_debounce(t0 + Duration::from_secs(10));
        assert_eq!(fault_events(&out), 0);
        assert!(!mon.record(loc).unwrap().faults.any());
    }

    #[test]
    fn test_suppression_while_twin_mid_activation() {
        let suppression = Arc::new(RwLock::new(SuppressionPolicy::default()));
        let loc_a = DeviceLocation::new(0, 0, 0);
        let loc_b = DeviceLocation::new(0, 0, 1);
        let groups = RedundancyGroups::new(vec![vec![loc_a, loc_b]]);
        let mut mon = DeviceMonitor::new(MonitorConfig::default(), groups, suppression.clone());
        let t0 = Instant::now();

        mon.process_signal(loc_a, signal(false), t0);
        suppression
            .write()
            .mark_peer_activating(loc_b, t0 + Duration::from_secs(60));

        mon.process_signal(loc_a, signal(true), t0 + Duration::from_secs(1));
        let out = mon.sweep_debounce(t0 + Duration::from_secs(10));
        assert_eq!(fault_events(&out), 0);
    }

    #[test]
    fn test_removal_destroys_window() {
        let mut mon = monitor();
        let loc = DeviceLocation::new(0, 0, 0);
        let t0 = Instant::now();

        mon.process_signal(loc, signal(true), t0);
        let out = mon.handle_removal(loc);
        assert_eq!(out.removed, vec![loc]);
        assert!(mon.record(loc).is_none());

        // no stale window fires after removal
        let out = mon.sweep_debounce(t0 + Duration::from_secs(10));
        assert!(out.events.is_empty());
    }

    #[test]
    fn test_removals_processed_before_updates() {
        let mut mon = monitor();
        let loc = DeviceLocation::new(0, 0, 0);
        let t0 = Instant::now();
        mon.process_signal(loc, signal(false), t0);

        let notes = vec![
            DiscoveryNotification::Updated(loc, signal(true)),
            DiscoveryNotification::Removed(loc),
        ];
        let out = mon.handle_notifications(notes, t0);
        assert_eq!(out.removed, vec![loc]);
        // the update for a removed slot is dropped
        assert!(mon.record(loc).is_none());
    }

    #[test]
    fn test_family_policy_learns_then_rejects() {
        let mut config = MonitorConfig::default();
        config
            .family_policy
            .family_of
            .insert("ACME-PS-550".into(), "octane".into());
        config
            .family_policy
            .family_of
            .insert("OTHER-PS-700".into(), "legacy".into());

        let mut mon = DeviceMonitor::new(
            config,
            RedundancyGroups::default(),
            Arc::new(RwLock::new(SuppressionPolicy::default())),
        );
        let t0 = Instant::now();

        let out = mon.process_signal(DeviceLocation::new(0, 0, 0), signal(false), t0);
        assert_eq!(out.learned_family.as_deref(), Some("octane"));

        let mut other = signal(false);
        other.product_id = "OTHER-PS-700".into();
        mon.process_signal(DeviceLocation::new(0, 0, 1), other, t0);
        assert!(!mon.record(DeviceLocation::new(0, 0, 1)).unwrap().supported);
    }
}
