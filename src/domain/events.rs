//! Domain events
//!
//! Immutable records of significant occurrences, published through the
//! `EventSink` port. Fault events fire on transition only, never on every
//! poll, so a stuck fault cannot cause a log storm.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{CacheStatus, DeviceLocation};

/// Which fault bit an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    General,
    Internal,
    OverTemperature,
    FaultRegister,
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultKind::General => write!(f, "general"),
            FaultKind::Internal => write!(f, "internal"),
            FaultKind::OverTemperature => write!(f, "overtemp"),
            FaultKind::FaultRegister => write!(f, "fault-register"),
        }
    }
}

/// Domain event representing a significant occurrence in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DeviceEvent {
    // =========================================================================
    // Device lifecycle
    // =========================================================================
    /// A device appeared in a slot.
    DeviceInserted {
        location: DeviceLocation,
        product_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A device was pulled from its slot.
    DeviceRemoved {
        location: DeviceLocation,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Faults (post-debounce)
    // =========================================================================
    /// A fault survived its debounce window and is now applied.
    FaultAsserted {
        location: DeviceLocation,
        fault: FaultKind,
        timestamp: DateTime<Utc>,
    },

    /// A previously applied fault cleared.
    FaultCleared {
        location: DeviceLocation,
        fault: FaultKind,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Firmware upgrades
    // =========================================================================
    /// A work item entered the upgrade pipeline.
    UpgradeStarted {
        location: DeviceLocation,
        target: String,
        image_rev: String,
        timestamp: DateTime<Utc>,
    },

    /// A work item reached a terminal completion reason.
    UpgradeCompleted {
        location: DeviceLocation,
        target: String,
        reason: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Cache availability
    // =========================================================================
    /// The combined cache status transitioned.
    CacheStatusChanged {
        old: CacheStatus,
        new: CacheStatus,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Peer contact
    // =========================================================================
    /// Contact with the peer controller was lost.
    PeerContactLost { timestamp: DateTime<Utc> },

    /// Contact with the peer controller was restored.
    PeerContactRestored { timestamp: DateTime<Utc> },
}

impl DeviceEvent {
    /// Short event type name for log fields.
    pub fn event_type(&self) -> &'static str {
        match self {
            DeviceEvent::DeviceInserted { .. } => "DeviceInserted",
            DeviceEvent::DeviceRemoved { .. } => "DeviceRemoved",
            DeviceEvent::FaultAsserted { .. } => "FaultAsserted",
            DeviceEvent::FaultCleared { .. } => "FaultCleared",
            DeviceEvent::UpgradeStarted { .. } => "UpgradeStarted",
            DeviceEvent::UpgradeCompleted { .. } => "UpgradeCompleted",
            DeviceEvent::CacheStatusChanged { .. } => "CacheStatusChanged",
            DeviceEvent::PeerContactLost { .. } => "PeerContactLost",
            DeviceEvent::PeerContactRestored { .. } => "PeerContactRestored",
        }
    }

    /// Location the event refers to, if it is device-scoped.
    pub fn location(&self) -> Option<DeviceLocation> {
        match self {
            DeviceEvent::DeviceInserted { location, .. }
            | DeviceEvent::DeviceRemoved { location, .. }
            | DeviceEvent::FaultAsserted { location, .. }
            | DeviceEvent::FaultCleared { location, .. }
            | DeviceEvent::UpgradeStarted { location, .. }
            | DeviceEvent::UpgradeCompleted { location, .. } => Some(*location),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_carries_tag() {
        let event = DeviceEvent::FaultAsserted {
            location: DeviceLocation::new(0, 0, 1),
            fault: FaultKind::General,
            timestamp: Utc::now(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"FaultAsserted\""));
    }

    #[test]
    fn test_event_type_and_location() {
        let loc = DeviceLocation::new(1, 2, 0);
        let event = DeviceEvent::DeviceRemoved {
            location: loc,
            timestamp: Utc::now(),
        };
        assert_eq!(event.event_type(), "DeviceRemoved");
        assert_eq!(event.location(), Some(loc));

        let event = DeviceEvent::PeerContactLost {
            timestamp: Utc::now(),
        };
        assert_eq!(event.location(), None);
    }
}
