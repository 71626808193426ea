//! Domain ports (port/adapter pattern)
//!
//! Port traits the engine depends on; infrastructure adapters implement them.
//! All calls are non-blocking: anything that takes time returns a
//! pending-style status and is polled again on the next scheduler tick. No
//! port call may block the scheduler thread.

use bytes::Bytes;

use crate::domain::{DeviceLocation, FirmwareTarget, RawDeviceSignal};
use crate::error::Result;

// =============================================================================
// Discovery / topology
// =============================================================================

/// A pushed notification from the discovery layer.
#[derive(Debug, Clone)]
pub enum DiscoveryNotification {
    /// New or changed raw status for a slot
    Updated(DeviceLocation, RawDeviceSignal),
    /// The FRU was pulled from its slot
    Removed(DeviceLocation),
}

/// Source of raw per-slot hardware telemetry.
pub trait DiscoverySource: Send {
    /// Full status sweep, used once at startup (Specialize phase).
    fn poll_all(&mut self) -> Vec<(DeviceLocation, RawDeviceSignal)>;

    /// Drain notifications pushed since the last tick.
    fn drain_notifications(&mut self) -> Vec<DiscoveryNotification>;
}

// =============================================================================
// Device programming
// =============================================================================

/// Outcome of polling an in-flight download or activate operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    /// Still running; poll again next tick
    InProgress,
    /// Completed successfully
    Done,
    /// Device cannot take the request right now; retry counts against the
    /// work item's budget
    Busy,
    /// The device rejected the image checksum (terminal for the attempt)
    ChecksumError,
    /// The device never completed activation (terminal for the attempt)
    ActivateTimeout,
}

/// Firmware download/activate interface of one device class.
pub trait DeviceProgrammer: Send {
    /// Begin transferring an image to the device.
    fn start_download(
        &mut self,
        location: DeviceLocation,
        target: &FirmwareTarget,
        image: Bytes,
    ) -> Result<()>;

    /// Poll an in-flight download.
    fn poll_download(&mut self, location: DeviceLocation) -> OpStatus;

    /// Tell the device to switch to the downloaded image. The device resets
    /// as part of activation.
    fn start_activate(&mut self, location: DeviceLocation) -> Result<()>;

    /// Poll an in-flight activation.
    fn poll_activate(&mut self, location: DeviceLocation) -> OpStatus;
}

// =============================================================================
// Image repository
// =============================================================================

/// Parsed header of a firmware image file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    /// Revision the image carries
    pub revision: String,
    /// Total image length in bytes
    pub byte_len: usize,
}

/// Read access to the firmware image store.
pub trait ImageRepository: Send {
    /// Read and parse just the image header.
    fn read_header(&self, filename: &str) -> Result<ImageHeader>;

    /// Read the entire image into memory.
    fn open_image(&self, filename: &str) -> Result<Bytes>;
}

// =============================================================================
// Peer transport
// =============================================================================

/// Result of attempting to hand a message to the inter-controller link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Queued on the link
    Sent,
    /// Link is flow-controlled; try again next tick
    Pending,
    /// Link rejected the message; counts against the retry budget
    Busy,
}

/// Event delivered by the inter-controller link.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// An opaque payload arrived from the peer
    Received(Vec<u8>),
    /// The peer controller is not installed
    PeerNotPresent,
    /// The peer exists but cannot service requests right now
    PeerBusy,
    /// Contact with the peer was lost
    ContactLost,
    /// The link failed without a response inside its timeout
    FatalError,
    /// Contact with the peer was (re-)established
    PeerAlive,
}

/// The controller-to-controller messaging link. Payloads are opaque bytes;
/// the transport never inspects them.
pub trait PeerTransport: Send {
    fn try_send(&mut self, payload: &[u8]) -> SendOutcome;

    /// Drain events received since the last tick.
    fn drain_events(&mut self) -> Vec<TransportEvent>;
}

// =============================================================================
// Event sink
// =============================================================================

/// Consumer of domain events (logging, audit, tests).
pub trait EventSink: Send {
    fn publish(&self, event: &crate::domain::events::DeviceEvent);
}
