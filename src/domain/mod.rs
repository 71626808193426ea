//! Domain layer: value objects, ports, and events.
//!
//! The domain layer holds the types shared by every engine component and the
//! port traits that infrastructure adapters implement. Nothing in here talks
//! to hardware directly.

pub mod events;
pub mod ports;

use std::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// Controller identity
// =============================================================================

/// One of the two redundant storage processors in the appliance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpId {
    SpA,
    SpB,
}

impl SpId {
    /// The other controller.
    pub fn peer(&self) -> SpId {
        match self {
            SpId::SpA => SpId::SpB,
            SpId::SpB => SpId::SpA,
        }
    }
}

impl fmt::Display for SpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpId::SpA => write!(f, "SPA"),
            SpId::SpB => write!(f, "SPB"),
        }
    }
}

// =============================================================================
// Device identity
// =============================================================================

/// Physical slot of a field-replaceable unit. Immutable once assigned.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct DeviceLocation {
    pub bus: u8,
    pub enclosure: u8,
    pub slot: u8,
}

impl DeviceLocation {
    pub fn new(bus: u8, enclosure: u8, slot: u8) -> Self {
        Self {
            bus,
            enclosure,
            slot,
        }
    }
}

impl fmt::Display for DeviceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.bus, self.enclosure, self.slot)
    }
}

/// Class of managed FRU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceClass {
    PowerSupply,
    Enclosure,
    IoModule,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::PowerSupply => write!(f, "PS"),
            DeviceClass::Enclosure => write!(f, "ENCL"),
            DeviceClass::IoModule => write!(f, "IOM"),
        }
    }
}

// =============================================================================
// Fault flags
// =============================================================================

/// Per-device fault bits as reported by the hardware after debounce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultFlags {
    /// General (summary) fault
    pub general: bool,
    /// Internal device fault
    pub internal: bool,
    /// Over-temperature condition
    pub overtemp: bool,
    /// The fault status register itself could not be read
    pub fault_register: bool,
}

impl FaultFlags {
    /// True if any fault bit is set.
    pub fn any(&self) -> bool {
        self.general || self.internal || self.overtemp || self.fault_register
    }
}

// =============================================================================
// Firmware identity
// =============================================================================

/// Which firmware-download protocol generation the device speaks.
///
/// Newer devices publish a product identifier that is resolved against the
/// manifest; older ones take a single hard-wired image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FirmwareProtocol {
    Legacy,
    Manifest,
}

/// Identifier of one programmable firmware component inside a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FirmwareTarget(pub String);

impl FirmwareTarget {
    /// The single target used for devices speaking the legacy protocol.
    pub fn legacy() -> Self {
        FirmwareTarget("legacy".to_string())
    }
}

impl fmt::Display for FirmwareTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Force flags accepted when initiating an upgrade.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceFlags {
    /// Upgrade even if the device already runs the image revision
    pub no_revision_check: bool,
    /// Skip peer coordination (service mode on a single-SP bench)
    pub single_sp_mode: bool,
}

// =============================================================================
// Raw telemetry and the canonical record
// =============================================================================

/// One raw status sample for a slot, as delivered by the discovery layer.
///
/// This is pre-debounce: fault bits in here may flicker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDeviceSignal {
    pub inserted: bool,
    pub general_fault: bool,
    pub internal_fault: bool,
    pub overtemp: bool,
    pub fault_register_fail: bool,
    pub firmware_rev: String,
    pub product_id: String,
    pub downloadable: bool,
    pub protocol: FirmwareProtocol,
    /// Controller this device feeds
    pub owner: SpId,
}

impl RawDeviceSignal {
    /// True if any raw fault bit is set.
    pub fn any_fault(&self) -> bool {
        self.general_fault || self.internal_fault || self.overtemp || self.fault_register_fail
    }
}

/// Canonical per-device record, owned by the device status monitor.
///
/// Fault bits here are post-debounce: a transient raw fault never shows up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub location: DeviceLocation,
    pub class: DeviceClass,
    pub inserted: bool,
    pub faults: FaultFlags,
    pub firmware_rev: String,
    pub product_id: String,
    pub downloadable: bool,
    pub protocol: FirmwareProtocol,
    pub owner: SpId,
    /// False once the family policy rules this device off the platform
    pub supported: bool,
}

impl DeviceRecord {
    /// Build a fresh record from a raw sample with no faults applied yet.
    pub fn from_signal(location: DeviceLocation, class: DeviceClass, sig: &RawDeviceSignal) -> Self {
        Self {
            location,
            class,
            inserted: sig.inserted,
            faults: FaultFlags::default(),
            firmware_rev: sig.firmware_rev.clone(),
            product_id: sig.product_id.clone(),
            downloadable: sig.downloadable,
            protocol: sig.protocol,
            owner: sig.owner,
            supported: true,
        }
    }

    /// True if the device is present and carries no fault.
    pub fn healthy(&self) -> bool {
        self.inserted && !self.faults.any()
    }
}

// =============================================================================
// Cache availability
// =============================================================================

/// Tri-state availability signal consumed by the upstream write cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheStatus {
    Ok,
    Degraded,
    Failed,
    /// No value reported yet (peer side before first contact)
    Uninitialized,
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheStatus::Ok => write!(f, "Ok"),
            CacheStatus::Degraded => write!(f, "Degraded"),
            CacheStatus::Failed => write!(f, "Failed"),
            CacheStatus::Uninitialized => write!(f, "Uninitialized"),
        }
    }
}

// =============================================================================
// Family policy
// =============================================================================

/// Externally supplied power-supply family coexistence policy.
///
/// Maps product identifiers to a family name; the first family observed on
/// the platform is recorded persistently and later conflicting families mark
/// their devices unsupported. The engine never invents constraints beyond
/// "pick one family and disallow mixing".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FamilyPolicy {
    /// product identifier → family name
    pub family_of: std::collections::HashMap<String, String>,
}

impl FamilyPolicy {
    /// Family for a product, if the policy knows it. Unknown products are
    /// unconstrained.
    pub fn family(&self, product_id: &str) -> Option<&str> {
        self.family_of.get(product_id).map(String::as_str)
    }
}
