//! Error types for the FRU management engine

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the FRU management engine
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Transient errors (retried with a bounded count)
    // =========================================================================
    /// The device or transport is busy; retry later
    #[error("Device busy: {0}")]
    Busy(String),

    /// An I/O-bound phase did not complete in time
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The peer replied busy to a coordination request
    #[error("Peer busy for work item {work_item_id}")]
    PeerBusy { work_item_id: uuid::Uuid },

    // =========================================================================
    // Environmental gates (re-evaluated on a triggering event, not retried)
    // =========================================================================
    /// The redundant twin is absent or faulted; activation would remove
    /// both power/cooling feeds at once
    #[error("Bad environment status for device at {location}: {reason}")]
    BadEnvStatus { location: String, reason: String },

    /// The peer denied permission or never answered
    #[error("No peer permission for work item {work_item_id}")]
    NoPeerPermission { work_item_id: uuid::Uuid },

    // =========================================================================
    // Hardware faults (terminal for the current upgrade attempt)
    // =========================================================================
    /// Firmware image failed its checksum on the device
    #[error("Image checksum error on device at {location}")]
    ImageChecksum { location: String },

    /// The device never came back from image activation
    #[error("Activation timed out on device at {location}")]
    ActivateTimeout { location: String },

    /// The device is not supported on this platform
    #[error("Unsupported device at {location}: {reason}")]
    UnsupportedDevice { location: String, reason: String },

    // =========================================================================
    // Lookup errors (logged as defect indicators, short-circuit to a no-op)
    // =========================================================================
    /// No device record exists for the given location
    #[error("No device at location {location}")]
    DeviceNotFound { location: String },

    /// No work item exists for the given reference
    #[error("No work item {work_item_id}")]
    WorkItemNotFound { work_item_id: uuid::Uuid },

    /// The manifest has no entry for the product identifier
    #[error("No manifest entry for product {product_id}")]
    ManifestEntryNotFound { product_id: String },

    // =========================================================================
    // Everything else
    // =========================================================================
    /// Manifest file could not be parsed
    #[error("Failed to parse manifest: {0}")]
    ManifestParse(#[from] serde_yaml::Error),

    /// Firmware image could not be read or is malformed
    #[error("Bad firmware image {filename}: {reason}")]
    BadImage { filename: String, reason: String },

    /// Persistence client rejected the operation
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Peer transport failed fatally
    #[error("Peer transport error: {0}")]
    PeerTransport(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error is transient and worth retrying within the
    /// work item's retry budget.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Busy(_) | Error::Timeout(_) | Error::PeerBusy { .. }
        )
    }

    /// Whether this error is an environmental gate: not retried
    /// automatically, only re-evaluated when a device-status change or
    /// peer-contact-restored event fires.
    pub fn is_environmental_gate(&self) -> bool {
        matches!(
            self,
            Error::BadEnvStatus { .. } | Error::NoPeerPermission { .. }
        )
    }

    /// Whether this error indicates a hardware fault that terminates the
    /// current upgrade attempt.
    pub fn is_hardware_fault(&self) -> bool {
        matches!(
            self,
            Error::ImageChecksum { .. }
                | Error::ActivateTimeout { .. }
                | Error::UnsupportedDevice { .. }
        )
    }

    /// Whether this error is a lookup failure that callers should treat as
    /// a defect indicator and short-circuit to a safe no-op.
    pub fn is_lookup(&self) -> bool {
        matches!(
            self,
            Error::DeviceNotFound { .. }
                | Error::WorkItemNotFound { .. }
                | Error::ManifestEntryNotFound { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_is_disjoint() {
        let busy = Error::Busy("download".into());
        assert!(busy.is_transient());
        assert!(!busy.is_environmental_gate());
        assert!(!busy.is_hardware_fault());
        assert!(!busy.is_lookup());

        let gate = Error::BadEnvStatus {
            location: "0_1_0".into(),
            reason: "twin removed".into(),
        };
        assert!(gate.is_environmental_gate());
        assert!(!gate.is_transient());

        let hw = Error::ImageChecksum {
            location: "0_1_0".into(),
        };
        assert!(hw.is_hardware_fault());
        assert!(!hw.is_transient());

        let lookup = Error::DeviceNotFound {
            location: "0_1_9".into(),
        };
        assert!(lookup.is_lookup());
        assert!(!lookup.is_hardware_fault());
    }
}
