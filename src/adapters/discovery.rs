//! Simulated discovery source
//!
//! Feeds scripted raw slot signals to the monitor the way the physical
//! discovery layer would: a full snapshot at startup plus pushed
//! notifications afterwards. The handle side is shared with the test or
//! simulation driver.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::domain::ports::{DiscoveryNotification, DiscoverySource};
use crate::domain::{DeviceLocation, RawDeviceSignal};

#[derive(Default)]
struct Shared {
    snapshot: BTreeMap<DeviceLocation, RawDeviceSignal>,
    queue: VecDeque<DiscoveryNotification>,
}

/// Driver-side handle: scripts what the discovery layer reports.
#[derive(Clone)]
pub struct SimulatedDiscoveryHandle {
    shared: Arc<Mutex<Shared>>,
}

impl SimulatedDiscoveryHandle {
    /// Seed or replace the startup snapshot for a slot.
    pub fn seed(&self, location: DeviceLocation, signal: RawDeviceSignal) {
        self.shared.lock().snapshot.insert(location, signal);
    }

    /// Push a status update notification.
    pub fn push_update(&self, location: DeviceLocation, signal: RawDeviceSignal) {
        let mut shared = self.shared.lock();
        shared.snapshot.insert(location, signal.clone());
        shared
            .queue
            .push_back(DiscoveryNotification::Updated(location, signal));
    }

    /// Push a device-removed notification.
    pub fn push_removal(&self, location: DeviceLocation) {
        let mut shared = self.shared.lock();
        shared.snapshot.remove(&location);
        shared.queue.push_back(DiscoveryNotification::Removed(location));
    }

    /// Current raw signal for a slot, as the simulation sees it.
    pub fn current(&self, location: DeviceLocation) -> Option<RawDeviceSignal> {
        self.shared.lock().snapshot.get(&location).cloned()
    }
}

/// Engine-side discovery port.
pub struct SimulatedDiscovery {
    shared: Arc<Mutex<Shared>>,
}

impl SimulatedDiscovery {
    pub fn new() -> (Self, SimulatedDiscoveryHandle) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        (
            Self {
                shared: shared.clone(),
            },
            SimulatedDiscoveryHandle { shared },
        )
    }
}

impl DiscoverySource for SimulatedDiscovery {
    fn poll_all(&mut self) -> Vec<(DeviceLocation, RawDeviceSignal)> {
        self.shared
            .lock()
            .snapshot
            .iter()
            .map(|(loc, sig)| (*loc, sig.clone()))
            .collect()
    }

    fn drain_notifications(&mut self) -> Vec<DiscoveryNotification> {
        self.shared.lock().queue.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FirmwareProtocol, SpId};

    fn signal() -> RawDeviceSignal {
        RawDeviceSignal {
            inserted: true,
            general_fault: false,
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

    #[test]
    fn test_seed_then_poll_all() {
        let (mut source, handle) = SimulatedDiscovery::new();
        let loc = DeviceLocation::new(0, 0, 0);
        handle.seed(loc, signal());

        let snapshot = source.poll_all();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, loc);
    }

    #[test]
    fn test_push_and_drain_order() {
        let (mut source, handle) = SimulatedDiscovery::new();
        let loc = DeviceLocation::new(0, 0, 0);

        handle.push_update(loc, signal());
        handle.push_removal(loc);

        let notes = source.drain_notifications();
        assert_eq!(notes.len(), 2);
        assert!(matches!(notes[0], DiscoveryNotification::Updated(..)));
        assert!(matches!(notes[1], DiscoveryNotification::Removed(_)));
        assert!(source.drain_notifications().is_empty());
    }
}
