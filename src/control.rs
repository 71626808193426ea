//! Control surface
//!
//! Read side is a lock-light status mirror the engine republishes after each
//! tick; callers read it without touching engine state. The write side is a
//! small command channel the engine drains once per tick, so every mutation
//! goes through the same single-threaded evaluation path as hardware events.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::domain::{CacheStatus, DeviceLocation, DeviceRecord};
use crate::fup::WorkItemSnapshot;

// =============================================================================
// Commands
// =============================================================================

/// Mutating requests accepted by the engine.
#[derive(Debug, Clone)]
pub enum ControlCommand {
    /// Pin the expected power-supply family; devices of another family are
    /// marked unsupported.
    SetExpectedDeviceType { family: String },
    /// Ask the orchestrator to abort every live work item of a device.
    RequestAbort { location: DeviceLocation },
}

// =============================================================================
// Status mirror
// =============================================================================

/// Engine-published view of device, upgrade, and cache state.
pub struct StatusMirror {
    devices: DashMap<DeviceLocation, DeviceRecord>,
    work_items: RwLock<Vec<WorkItemSnapshot>>,
    cache: RwLock<CacheStatus>,
}

impl StatusMirror {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            devices: DashMap::new(),
            work_items: RwLock::new(Vec::new()),
            cache: RwLock::new(CacheStatus::Uninitialized),
        })
    }

    /// Replace the device view; called by the engine after each tick.
    pub fn publish_devices<'a>(&self, records: impl Iterator<Item = &'a DeviceRecord>) {
        let fresh: Vec<DeviceRecord> = records.cloned().collect();
        self.devices.retain(|loc, _| fresh.iter().any(|r| r.location == *loc));
        for record in fresh {
            self.devices.insert(record.location, record);
        }
    }

    pub fn publish_work_items(&self, snapshots: Vec<WorkItemSnapshot>) {
        *self.work_items.write() = snapshots;
    }

    pub fn publish_cache_status(&self, status: CacheStatus) {
        *self.cache.write() = status;
    }
}

// =============================================================================
// Surface handed to callers
// =============================================================================

/// Caller-facing handle: non-blocking reads plus the command channel.
#[derive(Clone)]
pub struct ControlSurface {
    mirror: Arc<StatusMirror>,
    commands: mpsc::UnboundedSender<ControlCommand>,
}

impl ControlSurface {
    /// Build a surface and the engine-side command receiver.
    pub fn new(mirror: Arc<StatusMirror>) -> (Self, mpsc::UnboundedReceiver<ControlCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                mirror,
                commands: tx,
            },
            rx,
        )
    }

    pub fn get_device_status(&self, location: DeviceLocation) -> Option<DeviceRecord> {
        self.mirror.devices.get(&location).map(|r| r.clone())
    }

    pub fn all_device_status(&self) -> Vec<DeviceRecord> {
        let mut records: Vec<DeviceRecord> =
            self.mirror.devices.iter().map(|r| r.clone()).collect();
        records.sort_by_key(|r| r.location);
        records
    }

    pub fn get_fup_status(&self) -> Vec<WorkItemSnapshot> {
        self.mirror.work_items.read().clone()
    }

    pub fn get_cache_status(&self) -> CacheStatus {
        *self.mirror.cache.read()
    }

    /// Queue a family pin; applied on the engine's next tick.
    pub fn set_expected_device_type(&self, family: impl Into<String>) {
        let _ = self.commands.send(ControlCommand::SetExpectedDeviceType {
            family: family.into(),
        });
    }

    /// Queue an abort for every live work item of a device.
    pub fn request_abort(&self, location: DeviceLocation) {
        let _ = self.commands.send(ControlCommand::RequestAbort { location });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DeviceClass, FaultFlags, FirmwareProtocol, SpId};

    fn record(bus: u8) -> DeviceRecord {
        DeviceRecord {
            location: DeviceLocation::new(bus, 0, 0),
            class: DeviceClass::PowerSupply,
            inserted: true,
            faults: FaultFlags::default(),
            firmware_rev: "1.00".into(),
            product_id: "ACME-PS-550".into(),
            downloadable: true,
            protocol: FirmwareProtocol::Manifest,
            owner: SpId::SpA,
            supported: true,
        }
    }

    #[test]
    fn test_mirror_publish_replaces_stale_devices() {
        let mirror = StatusMirror::new();
        let (surface, _rx) = ControlSurface::new(mirror.clone());

        let a = record(0);
        let b = record(1);
        mirror.publish_devices([a.clone(), b].iter());
        assert_eq!(surface.all_device_status().len(), 2);

        mirror.publish_devices([a.clone()].iter());
        assert_eq!(surface.all_device_status().len(), 1);
        assert!(surface.get_device_status(a.location).is_some());
    }

    #[test]
    fn test_commands_reach_the_receiver() {
        let mirror = StatusMirror::new();
        let (surface, mut rx) = ControlSurface::new(mirror);

        let loc = DeviceLocation::new(0, 0, 1);
        surface.set_expected_device_type("octane");
        surface.request_abort(loc);

        assert!(matches!(
            rx.try_recv().unwrap(),
            ControlCommand::SetExpectedDeviceType { family } if family == "octane"
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            ControlCommand::RequestAbort { location } if location == loc
        ));
    }

    #[test]
    fn test_cache_status_defaults_uninitialized() {
        let mirror = StatusMirror::new();
        let (surface, _rx) = ControlSurface::new(mirror.clone());
        assert_eq!(surface.get_cache_status(), CacheStatus::Uninitialized);

        mirror.publish_cache_status(CacheStatus::Ok);
        assert_eq!(surface.get_cache_status(), CacheStatus::Ok);
    }
}
