//! Upgrade work items
//!
//! One work item tracks the in-flight firmware upgrade of a single
//! (device, firmware target) pair. At most one live work item exists per
//! pair; the orchestrator enforces this through its registry.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Instant;
use uuid::Uuid;

use bytes::Bytes;

use crate::domain::ports::ImageHeader;
use crate::domain::{DeviceLocation, FirmwareTarget, ForceFlags};

// =============================================================================
// Pipeline states
// =============================================================================

/// States of the upgrade pipeline, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UpgradeState {
    Idle,
    WaitBeforeUpgrade,
    WaitInterDeviceDelay,
    ReadImageHeader,
    CheckRevision,
    ReadEntireImage,
    GetPeerPermission,
    CheckEnvironmentStatus,
    DownloadImage,
    PollDownloadStatus,
    ActivateImage,
    PollActivateStatus,
    CheckResult,
    RefreshDeviceStatus,
    EndUpgrade,
    ReleaseImage,
    /// Teardown after an abort request; reachable from any non-terminal state
    Abort,
}

impl UpgradeState {
    /// States from which an abort request still has an effect.
    pub fn abortable(&self) -> bool {
        !matches!(
            self,
            UpgradeState::Idle
                | UpgradeState::EndUpgrade
                | UpgradeState::ReleaseImage
                | UpgradeState::Abort
        )
    }

    /// States during which the device's own faults are filtered: activation
    /// resets the device and the reset must not read as a fault.
    pub fn activation_in_progress(&self) -> bool {
        matches!(
            self,
            UpgradeState::ActivateImage | UpgradeState::PollActivateStatus
        )
    }
}

impl std::fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UpgradeState::Idle => "Idle",
            UpgradeState::WaitBeforeUpgrade => "WaitBeforeUpgrade",
            UpgradeState::WaitInterDeviceDelay => "WaitInterDeviceDelay",
            UpgradeState::ReadImageHeader => "ReadImageHeader",
            UpgradeState::CheckRevision => "CheckRevision",
            UpgradeState::ReadEntireImage => "ReadEntireImage",
            UpgradeState::GetPeerPermission => "GetPeerPermission",
            UpgradeState::CheckEnvironmentStatus => "CheckEnvironmentStatus",
            UpgradeState::DownloadImage => "DownloadImage",
            UpgradeState::PollDownloadStatus => "PollDownloadStatus",
            UpgradeState::ActivateImage => "ActivateImage",
            UpgradeState::PollActivateStatus => "PollActivateStatus",
            UpgradeState::CheckResult => "CheckResult",
            UpgradeState::RefreshDeviceStatus => "RefreshDeviceStatus",
            UpgradeState::EndUpgrade => "EndUpgrade",
            UpgradeState::ReleaseImage => "ReleaseImage",
            UpgradeState::Abort => "Abort",
        };
        write!(f, "{}", name)
    }
}

// =============================================================================
// Completion reasons
// =============================================================================

/// Terminal (or in-flight) disposition of one upgrade attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CompletionReason {
    /// Attempt still running
    InProgress,
    /// Image activated and the revision changed
    SuccessRevChanged,
    /// Device already ran the image revision; nothing to do
    SuccessNoRevChange,
    /// Peer denied permission or never answered
    NoPeerPermission,
    /// Redundant twin absent/faulted past the patience budget
    FailBadEnvStatus,
    /// Device rejected the image checksum
    FailChecksum,
    /// Device never completed activation
    FailActivateTimeout,
    /// Image file unreadable or malformed
    FailReadImage,
    /// Transient-retry budget exhausted
    FailRetryExceeded,
    /// Abort requested (device removal or explicit request)
    Aborted,
}

impl CompletionReason {
    /// Reasons the peer-alive resume scan re-initiates.
    pub fn resumable_on_peer_alive(&self) -> bool {
        matches!(
            self,
            CompletionReason::NoPeerPermission | CompletionReason::Aborted
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            CompletionReason::SuccessRevChanged | CompletionReason::SuccessNoRevChange
        )
    }
}

impl std::fmt::Display for CompletionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CompletionReason::InProgress => "InProgress",
            CompletionReason::SuccessRevChanged => "SuccessRevChanged",
            CompletionReason::SuccessNoRevChange => "SuccessNoRevChange",
            CompletionReason::NoPeerPermission => "NoPeerPermission",
            CompletionReason::FailBadEnvStatus => "FailBadEnvStatus",
            CompletionReason::FailChecksum => "FailChecksum",
            CompletionReason::FailActivateTimeout => "FailActivateTimeout",
            CompletionReason::FailReadImage => "FailReadImage",
            CompletionReason::FailRetryExceeded => "FailRetryExceeded",
            CompletionReason::Aborted => "Aborted",
        };
        write!(f, "{}", name)
    }
}

// =============================================================================
// Peer permission bookkeeping
// =============================================================================

/// Where the item stands with cross-controller permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PermissionState {
    NotRequested,
    Requested,
    Granted,
    Denied,
}

// =============================================================================
// Work item
// =============================================================================

/// One timestamped step in the item's trail, kept for the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct UpgradeStep {
    pub state: UpgradeState,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// The in-flight upgrade task for one (device, firmware target) pair.
#[derive(Debug)]
pub struct WorkItem {
    pub id: Uuid,
    pub location: DeviceLocation,
    pub target: FirmwareTarget,
    pub image_file: String,
    pub state: UpgradeState,
    pub reason: CompletionReason,
    pub permission: PermissionState,
    pub force: ForceFlags,
    /// Transient-retry budget consumed so far
    pub retry_count: u32,
    /// Revision carried by the image (known after ReadImageHeader)
    pub image_rev: String,
    /// Revision the device ran when the item was created
    pub previous_rev: String,
    /// Revision read back after activation
    pub current_rev: String,
    pub abort_requested: bool,
    /// Set while CheckEnvironmentStatus is stalling
    pub env_stall_since: Option<Instant>,
    /// Earliest instant the current wait state may end
    pub wait_until: Option<Instant>,
    pub header: Option<ImageHeader>,
    pub image: Option<Bytes>,
    pub started_at: DateTime<Utc>,
    pub steps: Vec<UpgradeStep>,
}

impl WorkItem {
    pub fn new(
        location: DeviceLocation,
        target: FirmwareTarget,
        image_file: String,
        previous_rev: String,
        force: ForceFlags,
    ) -> Self {
        let mut item = Self {
            id: Uuid::new_v4(),
            location,
            target,
            image_file,
            state: UpgradeState::WaitBeforeUpgrade,
            reason: CompletionReason::InProgress,
            permission: PermissionState::NotRequested,
            force,
            retry_count: 0,
            image_rev: String::new(),
            previous_rev,
            current_rev: String::new(),
            abort_requested: false,
            env_stall_since: None,
            wait_until: None,
            header: None,
            image: None,
            started_at: Utc::now(),
            steps: Vec::new(),
        };
        item.record_step("work item created");
        item
    }

    /// Move to a new state, recording the step trail.
    pub fn transition(&mut self, next: UpgradeState, message: impl Into<String>) {
        self.state = next;
        self.record_step(message);
    }

    fn record_step(&mut self, message: impl Into<String>) {
        self.steps.push(UpgradeStep {
            state: self.state,
            timestamp: Utc::now(),
            message: message.into(),
        });
    }

    /// Milliseconds since the item was created.
    pub fn elapsed_ms(&self) -> u64 {
        (Utc::now() - self.started_at).num_milliseconds().max(0) as u64
    }

    /// Consume one unit of the transient-retry budget. Returns false once
    /// the budget is exhausted.
    pub fn consume_retry(&mut self, budget: u32) -> bool {
        self.retry_count += 1;
        self.retry_count <= budget
    }
}

/// Read-only snapshot of a work item for the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct WorkItemSnapshot {
    pub id: Uuid,
    pub location: DeviceLocation,
    pub target: FirmwareTarget,
    pub state: UpgradeState,
    pub reason: CompletionReason,
    pub retry_count: u32,
    pub image_rev: String,
    pub previous_rev: String,
    pub started_at: DateTime<Utc>,
    pub steps: Vec<UpgradeStep>,
}

impl From<&WorkItem> for WorkItemSnapshot {
    fn from(item: &WorkItem) -> Self {
        Self {
            id: item.id,
            location: item.location,
            target: item.target.clone(),
            state: item.state,
            reason: item.reason,
            retry_count: item.retry_count,
            image_rev: item.image_rev.clone(),
            previous_rev: item.previous_rev.clone(),
            started_at: item.started_at,
            steps: item.steps.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> WorkItem {
        WorkItem::new(
            DeviceLocation::new(0, 0, 0),
            FirmwareTarget("primary".into()),
            "ps.bin".into(),
            "1.00".into(),
            ForceFlags::default(),
        )
    }

    #[test]
    fn test_new_item_starts_in_wait_before_upgrade() {
        let item = item();
        assert_eq!(item.state, UpgradeState::WaitBeforeUpgrade);
        assert_eq!(item.reason, CompletionReason::InProgress);
        assert_eq!(item.steps.len(), 1);
    }

    #[test]
    fn test_transition_records_steps() {
        let mut item = item();
        item.transition(UpgradeState::ReadImageHeader, "delay elapsed");
        item.transition(UpgradeState::CheckRevision, "header ok");
        assert_eq!(item.steps.len(), 3);
        assert_eq!(item.steps[2].state, UpgradeState::CheckRevision);
    }

    #[test]
    fn test_retry_budget_exhaustion() {
        let mut item = item();
        assert!(item.consume_retry(2));
        assert!(item.consume_retry(2));
        assert!(!item.consume_retry(2));
    }

    #[test]
    fn test_abortable_states() {
        assert!(UpgradeState::DownloadImage.abortable());
        assert!(UpgradeState::GetPeerPermission.abortable());
        assert!(!UpgradeState::EndUpgrade.abortable());
        assert!(!UpgradeState::Idle.abortable());
    }

    #[test]
    fn test_activation_fault_filter_window() {
        assert!(UpgradeState::ActivateImage.activation_in_progress());
        assert!(UpgradeState::PollActivateStatus.activation_in_progress());
        assert!(!UpgradeState::DownloadImage.activation_in_progress());
    }

    #[test]
    fn test_resumable_reasons() {
        assert!(CompletionReason::NoPeerPermission.resumable_on_peer_alive());
        assert!(CompletionReason::Aborted.resumable_on_peer_alive());
        assert!(!CompletionReason::FailChecksum.resumable_on_peer_alive());
        assert!(!CompletionReason::SuccessRevChanged.resumable_on_peer_alive());
    }
}
