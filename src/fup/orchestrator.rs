//! Firmware upgrade orchestrator
//!
//! Owns the work item registry and drives each item through the pipeline,
//! one step per scheduler tick. I/O-bound phases never block: they poll the
//! programmer/repository/peer ports and stay pending until the external
//! result arrives. Busy and timeout results retry against the item's bounded
//! budget; checksum and activate-timeout faults are terminal for the
//! attempt; device removal destroys the item immediately and discards any
//! pending fail reason.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::events::DeviceEvent;
use crate::domain::ports::{DeviceProgrammer, ImageRepository, OpStatus};
use crate::domain::{
    DeviceLocation, DeviceRecord, FirmwareProtocol, FirmwareTarget, ForceFlags, SpId,
};
use crate::error::Error;
use crate::fup::manifest::Manifest;
use crate::fup::work_item::{
    CompletionReason, PermissionState, UpgradeState, WorkItem, WorkItemSnapshot,
};
use crate::monitor::{RedundancyGroups, SuppressionPolicy};
use crate::peer::{PeerCoordinator, PermissionOutcome};
use crate::persist::{PersistClient, PersistSector};

// =============================================================================
// Configuration
// =============================================================================

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct FupConfig {
    /// Settle time between qualification and the first pipeline phase
    pub delay_before_upgrade: Duration,

    /// Minimum spacing between activations of devices in one redundancy
    /// group, so the local side never takes two feeds down back to back
    pub inter_device_delay: Duration,

    /// Transient-retry budget per work item
    pub max_retries: u32,

    /// How long CheckEnvironmentStatus stalls on a bad twin before the
    /// attempt ends with FailBadEnvStatus (restartable on a status change)
    pub env_gate_patience: Duration,

    /// How long a peer-granted activation suppresses faults on the granted
    /// slot
    pub peer_activation_grace: Duration,

    /// The system has no redundant controller
    pub single_sp: bool,

    /// Force flags applied to engine-initiated upgrades
    pub default_force: ForceFlags,

    /// Image file used for devices speaking the legacy protocol
    pub legacy_image: String,
}

impl Default for FupConfig {
    fn default() -> Self {
        Self {
            delay_before_upgrade: Duration::from_secs(10),
            inter_device_delay: Duration::from_secs(30),
            max_retries: 3,
            env_gate_patience: Duration::from_secs(30 * 60),
            peer_activation_grace: Duration::from_secs(60),
            single_sp: false,
            default_force: ForceFlags::default(),
            legacy_image: "legacy_ps.bin".to_string(),
        }
    }
}

/// Per-tick collaborators handed to the step pass.
pub struct FupContext<'a> {
    pub programmer: &'a mut dyn DeviceProgrammer,
    pub images: &'a dyn ImageRepository,
    pub peer: &'a mut PeerCoordinator,
    pub persist: &'a mut dyn PersistClient,
    /// Canonical record lookup (the monitor's view)
    pub records: &'a dyn Fn(DeviceLocation) -> Option<DeviceRecord>,
    pub now: Instant,
}

/// Durable record of one finished attempt.
#[derive(Debug, Clone, Serialize)]
struct CompletionEntry {
    location: DeviceLocation,
    target: FirmwareTarget,
    reason: CompletionReason,
    timestamp: chrono::DateTime<Utc>,
}

type ItemKey = (DeviceLocation, FirmwareTarget);

// =============================================================================
// Orchestrator
// =============================================================================

/// Drives all live work items for one device class.
pub struct FupOrchestrator {
    config: FupConfig,
    local_sp: SpId,
    groups: RedundancyGroups,
    suppression: Arc<RwLock<SuppressionPolicy>>,
    /// Live items; at most one per (device, target)
    items: BTreeMap<ItemKey, WorkItem>,
    /// Last terminal reason per (device, target); consulted by the resume
    /// scans and the entry gate
    completed: HashMap<ItemKey, CompletionReason>,
    /// When each slot's last activation finished, for inter-device spacing
    last_activation_end: HashMap<DeviceLocation, Instant>,
}

impl FupOrchestrator {
    pub fn new(
        config: FupConfig,
        local_sp: SpId,
        groups: RedundancyGroups,
        suppression: Arc<RwLock<SuppressionPolicy>>,
    ) -> Self {
        Self {
            config,
            local_sp,
            groups,
            suppression,
            items: BTreeMap::new(),
            completed: HashMap::new(),
            last_activation_end: HashMap::new(),
        }
    }

    // =========================================================================
    // Entry gate and initiation
    // =========================================================================

    /// The upgrade entry gate: downloadable, inserted, no general fault,
    /// platform-supported, and locally owned (or no redundant controller).
    pub fn qualified(&self, record: &DeviceRecord) -> bool {
        record.downloadable
            && record.inserted
            && !record.faults.general
            && record.supported
            && (record.owner == self.local_sp || self.config.single_sp)
    }

    /// Resolve the targets and image files for a device. Manifest-protocol
    /// devices go through the manifest; legacy devices take the single
    /// configured image.
    fn resolve_targets(
        &self,
        record: &DeviceRecord,
        manifest: &Manifest,
    ) -> Vec<(FirmwareTarget, String)> {
        match record.protocol {
            FirmwareProtocol::Legacy => {
                vec![(FirmwareTarget::legacy(), self.config.legacy_image.clone())]
            }
            FirmwareProtocol::Manifest => match manifest.targets_for(&record.product_id) {
                Ok(targets) => targets.to_vec(),
                Err(err) => {
                    // lookup failure must not halt the other devices
                    warn!(
                        location = %record.location,
                        product_id = %record.product_id,
                        error = %err,
                        "no manifest entry, skipping device"
                    );
                    Vec::new()
                }
            },
        }
    }

    /// Consider a device for upgrade, creating work items for any targets
    /// with no live item and no recorded completion.
    pub fn evaluate_device(
        &mut self,
        record: &DeviceRecord,
        manifest: &Manifest,
        force: ForceFlags,
        now: Instant,
    ) {
        if !self.qualified(record) {
            debug!(
                location = %record.location,
                downloadable = record.downloadable,
                inserted = record.inserted,
                general_fault = record.faults.general,
                "not qualified for upgrade"
            );
            return;
        }

        for (target, image_file) in self.resolve_targets(record, manifest) {
            let key = (record.location, target.clone());
            if self.items.contains_key(&key) {
                continue;
            }
            if self.completed.contains_key(&key) {
                continue;
            }

            info!(
                location = %record.location,
                target = %target,
                image = %image_file,
                "work item created"
            );
            let mut item = WorkItem::new(
                record.location,
                target,
                image_file,
                record.firmware_rev.clone(),
                force,
            );
            item.wait_until = Some(now + self.config.delay_before_upgrade);
            self.items.insert(key, item);
        }
    }

    // =========================================================================
    // Removal, abort, resume
    // =========================================================================

    /// Device pulled: destroy its items immediately. No completion reason is
    /// persisted; the device no longer exists.
    pub fn handle_removal(&mut self, location: DeviceLocation, peer: &mut PeerCoordinator) {
        let keys: Vec<ItemKey> = self
            .items
            .keys()
            .filter(|(loc, _)| *loc == location)
            .cloned()
            .collect();
        for key in keys {
            if let Some(item) = self.items.remove(&key) {
                info!(
                    location = %location,
                    target = %key.1,
                    state = %item.state,
                    "work item destroyed on device removal"
                );
                peer.forget(item.id);
            }
        }
        self.suppression.write().clear_local_activating(location);
        self.completed.retain(|(loc, _), _| *loc != location);
        self.last_activation_end.remove(&location);
    }

    /// Request an abort for every live item of a device. Processed by the
    /// abort pass, which runs after all phase steps in the tick.
    pub fn request_abort(&mut self, location: DeviceLocation) {
        for ((loc, _), item) in self.items.iter_mut() {
            if *loc == location && item.state.abortable() {
                item.abort_requested = true;
            }
        }
    }

    /// The abort pass: move abort-requested items into teardown. Ordered
    /// after the step pass so an abort cannot race a phase completing
    /// normally within the same tick.
    pub fn abort_pass(&mut self, peer: &mut PeerCoordinator) {
        for item in self.items.values_mut() {
            if item.abort_requested && item.state.abortable() {
                info!(
                    location = %item.location,
                    target = %item.target,
                    from = %item.state,
                    "aborting work item"
                );
                self.suppression.write().clear_local_activating(item.location);
                peer.forget(item.id);
                item.reason = CompletionReason::Aborted;
                item.abort_requested = false;
                item.transition(UpgradeState::Abort, "abort requested");
            }
        }
    }

    /// Peer contact restored: clear completions the peer's absence caused so
    /// the next evaluation re-initiates them. Returns the device locations
    /// to re-evaluate.
    pub fn peer_alive_resume(&mut self) -> Vec<DeviceLocation> {
        let mut locations = Vec::new();
        self.completed.retain(|(loc, target), reason| {
            if reason.resumable_on_peer_alive() {
                info!(
                    location = %loc,
                    target = %target,
                    reason = %reason,
                    "peer contact restored, re-qualifying upgrade"
                );
                locations.push(*loc);
                false
            } else {
                true
            }
        });
        locations.sort();
        locations.dedup();
        locations
    }

    /// A device's status changed (e.g. a twin's fault cleared): clear
    /// FailBadEnvStatus completions of its group siblings so they re-enter
    /// the pipeline. Returns the locations to re-evaluate.
    pub fn env_restart_candidates(&mut self, changed: &[DeviceLocation]) -> Vec<DeviceLocation> {
        let mut locations = Vec::new();
        for loc in changed {
            let Some(group) = self.groups.group_of(*loc) else {
                continue;
            };
            for sibling in group.iter().filter(|s| *s != loc) {
                let keys: Vec<ItemKey> = self
                    .completed
                    .iter()
                    .filter(|((l, _), reason)| {
                        l == sibling && **reason == CompletionReason::FailBadEnvStatus
                    })
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in keys {
                    info!(
                        location = %key.0,
                        target = %key.1,
                        "environment recovered, re-qualifying upgrade"
                    );
                    self.completed.remove(&key);
                    locations.push(key.0);
                }
            }
        }
        locations.sort();
        locations.dedup();
        locations
    }

    // =========================================================================
    // Step pass
    // =========================================================================

    /// Step every live item once, in key order. Returns events to publish.
    pub fn step_all(&mut self, ctx: &mut FupContext<'_>) -> Vec<DeviceEvent> {
        let mut events = Vec::new();
        let keys: Vec<ItemKey> = self.items.keys().cloned().collect();
        for key in keys {
            let Some(mut item) = self.items.remove(&key) else {
                continue;
            };
            self.step_item(&mut item, ctx, &mut events);
            if item.state == UpgradeState::Idle {
                debug!(
                    location = %item.location,
                    target = %item.target,
                    reason = %item.reason,
                    "work item retired"
                );
                self.completed.insert(key, item.reason);
            } else {
                self.items.insert(key, item);
            }
        }
        events
    }

    fn step_item(
        &mut self,
        item: &mut WorkItem,
        ctx: &mut FupContext<'_>,
        events: &mut Vec<DeviceEvent>,
    ) {
        match item.state {
            UpgradeState::Idle => {}
            UpgradeState::WaitBeforeUpgrade => self.step_wait_before(item, ctx.now),
            UpgradeState::WaitInterDeviceDelay => self.step_inter_device_delay(item, ctx.now),
            UpgradeState::ReadImageHeader => self.step_read_header(item, ctx),
            UpgradeState::CheckRevision => self.step_check_revision(item),
            UpgradeState::ReadEntireImage => self.step_read_image(item, ctx),
            UpgradeState::GetPeerPermission => self.step_peer_permission(item, ctx),
            UpgradeState::CheckEnvironmentStatus => self.step_env_status(item, ctx),
            UpgradeState::DownloadImage => self.step_download(item, ctx, events),
            UpgradeState::PollDownloadStatus => self.step_poll_download(item, ctx),
            UpgradeState::ActivateImage => self.step_activate(item, ctx),
            UpgradeState::PollActivateStatus => self.step_poll_activate(item, ctx),
            UpgradeState::CheckResult => self.step_check_result(item, ctx.now),
            UpgradeState::RefreshDeviceStatus => self.step_refresh_status(item, ctx),
            UpgradeState::EndUpgrade => self.step_end_upgrade(item, ctx, events),
            UpgradeState::ReleaseImage => self.step_release(item),
            UpgradeState::Abort => {
                item.transition(UpgradeState::EndUpgrade, "abort teardown");
            }
        }
    }

    fn step_wait_before(&self, item: &mut WorkItem, now: Instant) {
        if item.wait_until.map(|t| t <= now).unwrap_or(true) {
            item.wait_until = None;
            item.transition(UpgradeState::WaitInterDeviceDelay, "settle delay elapsed");
        }
    }

    /// Stall while a group sibling is downloading/activating or finished
    /// activating less than the spacing budget ago.
    fn step_inter_device_delay(&mut self, item: &mut WorkItem, now: Instant) {
        if self.spacing_clear(item.location, now) {
            item.transition(UpgradeState::ReadImageHeader, "inter-device spacing clear");
        }
    }

    /// True when no group sibling of `location` has an item in a
    /// download/activate state and the last sibling activation ended at
    /// least the spacing budget ago.
    fn spacing_clear(&self, location: DeviceLocation, now: Instant) -> bool {
        let Some(group) = self.groups.group_of(location) else {
            return true;
        };
        for sibling in group.iter().filter(|l| **l != location) {
            let busy = self.items.iter().any(|((loc, _), other)| {
                loc == sibling
                    && matches!(
                        other.state,
                        UpgradeState::DownloadImage
                            | UpgradeState::PollDownloadStatus
                            | UpgradeState::ActivateImage
                            | UpgradeState::PollActivateStatus
                    )
            });
            if busy {
                return false;
            }
            if let Some(ended) = self.last_activation_end.get(sibling) {
                if now.duration_since(*ended) < self.config.inter_device_delay {
                    return false;
                }
            }
        }
        true
    }

    fn step_read_header(&self, item: &mut WorkItem, ctx: &mut FupContext<'_>) {
        match ctx.images.read_header(&item.image_file) {
            Ok(header) => {
                item.image_rev = header.revision.clone();
                item.header = Some(header);
                item.transition(UpgradeState::CheckRevision, "image header read");
            }
            Err(err) if err.is_transient() => self.retry_or_fail(item, &err),
            Err(err) => {
                warn!(location = %item.location, error = %err, "image header unreadable");
                self.fail_attempt(item, CompletionReason::FailReadImage);
            }
        }
    }

    fn step_check_revision(&self, item: &mut WorkItem) {
        if !item.force.no_revision_check && item.previous_rev == item.image_rev {
            debug!(
                location = %item.location,
                rev = %item.image_rev,
                "device already at image revision"
            );
            self.fail_attempt(item, CompletionReason::SuccessNoRevChange);
        } else {
            item.transition(UpgradeState::ReadEntireImage, "revision differs");
        }
    }

    fn step_read_image(&self, item: &mut WorkItem, ctx: &mut FupContext<'_>) {
        match ctx.images.open_image(&item.image_file) {
            Ok(image) => {
                item.image = Some(image);
                item.transition(UpgradeState::GetPeerPermission, "image loaded");
            }
            Err(err) if err.is_transient() => self.retry_or_fail(item, &err),
            Err(err) => {
                warn!(location = %item.location, error = %err, "image unreadable");
                self.fail_attempt(item, CompletionReason::FailReadImage);
            }
        }
    }

    fn step_peer_permission(&self, item: &mut WorkItem, ctx: &mut FupContext<'_>) {
        if self.config.single_sp || item.force.single_sp_mode {
            item.permission = PermissionState::Granted;
            item.transition(
                UpgradeState::CheckEnvironmentStatus,
                "no peer coordination needed",
            );
            return;
        }

        match item.permission {
            PermissionState::NotRequested => {
                ctx.peer.submit_request(item.id, item.location, ctx.now);
                item.permission = PermissionState::Requested;
                // pending until the coordinator reports back
            }
            PermissionState::Requested => match ctx.peer.outcome(item.id) {
                PermissionOutcome::Pending => {}
                PermissionOutcome::Granted => {
                    item.permission = PermissionState::Granted;
                    ctx.peer.forget(item.id);
                    item.transition(UpgradeState::CheckEnvironmentStatus, "peer granted");
                }
                PermissionOutcome::Denied => {
                    item.permission = PermissionState::Denied;
                    ctx.peer.forget(item.id);
                    warn!(location = %item.location, "peer permission denied");
                    self.fail_attempt(item, CompletionReason::NoPeerPermission);
                }
            },
            PermissionState::Granted => {
                item.transition(UpgradeState::CheckEnvironmentStatus, "peer granted");
            }
            PermissionState::Denied => {
                self.fail_attempt(item, CompletionReason::NoPeerPermission);
            }
        }
    }

    /// The twin must be present and fault-free before this device's feed may
    /// go down. A bad twin stalls the phase; only exhausting the patience
    /// budget fails the attempt (restartable on a device-status change).
    fn step_env_status(&self, item: &mut WorkItem, ctx: &mut FupContext<'_>) {
        // Sibling spacing is re-checked here, the last gate before
        // DownloadImage: two sibling items stepping in lockstep both clear
        // WaitInterDeviceDelay before either reaches a download state, and
        // the twin's record looks healthy while its faults are suppressed
        // mid-activation.
        if !self.spacing_clear(item.location, ctx.now) {
            return; // pending, without consuming env-gate patience
        }

        let twin_ok = match self.groups.twin(item.location) {
            None => true,
            Some(twin) => (ctx.records)(twin)
                .map(|r| r.inserted && !r.faults.any())
                .unwrap_or(false),
        };

        if twin_ok {
            item.env_stall_since = None;
            item.transition(UpgradeState::DownloadImage, "environment clear");
            return;
        }

        let since = *item.env_stall_since.get_or_insert(ctx.now);
        if ctx.now.duration_since(since) >= self.config.env_gate_patience {
            warn!(location = %item.location, "environment bad past patience budget");
            self.fail_attempt(item, CompletionReason::FailBadEnvStatus);
        }
        // otherwise stay pending; a status change re-checks next tick
    }

    fn step_download(
        &self,
        item: &mut WorkItem,
        ctx: &mut FupContext<'_>,
        events: &mut Vec<DeviceEvent>,
    ) {
        let Some(image) = item.image.clone() else {
            self.fail_attempt(item, CompletionReason::FailReadImage);
            return;
        };
        match ctx
            .programmer
            .start_download(item.location, &item.target, image)
        {
            Ok(()) => {
                info!(
                    location = %item.location,
                    target = %item.target,
                    image_rev = %item.image_rev,
                    "download started"
                );
                events.push(DeviceEvent::UpgradeStarted {
                    location: item.location,
                    target: item.target.to_string(),
                    image_rev: item.image_rev.clone(),
                    timestamp: Utc::now(),
                });
                item.transition(UpgradeState::PollDownloadStatus, "download started");
            }
            Err(err) if err.is_transient() => self.retry_or_fail(item, &err),
            Err(err) => {
                warn!(location = %item.location, error = %err, "download start failed");
                self.fail_attempt(item, CompletionReason::FailRetryExceeded);
            }
        }
    }

    fn step_poll_download(&self, item: &mut WorkItem, ctx: &mut FupContext<'_>) {
        match ctx.programmer.poll_download(item.location) {
            OpStatus::InProgress => {}
            OpStatus::Done => {
                item.transition(UpgradeState::ActivateImage, "download complete");
            }
            OpStatus::Busy => self.retry_or_fail(item, &Error::Busy("download poll".into())),
            OpStatus::ChecksumError => {
                warn!(location = %item.location, "image checksum rejected");
                self.fail_attempt(item, CompletionReason::FailChecksum);
            }
            OpStatus::ActivateTimeout => {
                self.fail_attempt(item, CompletionReason::FailActivateTimeout);
            }
        }
    }

    fn step_activate(&self, item: &mut WorkItem, ctx: &mut FupContext<'_>) {
        // from here the device's own faults are expected and filtered
        self.suppression
            .write()
            .mark_local_activating(item.location);

        match ctx.programmer.start_activate(item.location) {
            Ok(()) => {
                info!(location = %item.location, "activation started");
                item.transition(UpgradeState::PollActivateStatus, "activation started");
            }
            Err(err) if err.is_transient() => {
                if !item.consume_retry(self.config.max_retries) {
                    self.suppression
                        .write()
                        .clear_local_activating(item.location);
                    self.fail_attempt(item, CompletionReason::FailRetryExceeded);
                }
            }
            Err(err) => {
                warn!(location = %item.location, error = %err, "activation start failed");
                self.suppression
                    .write()
                    .clear_local_activating(item.location);
                self.fail_attempt(item, CompletionReason::FailActivateTimeout);
            }
        }
    }

    fn step_poll_activate(&self, item: &mut WorkItem, ctx: &mut FupContext<'_>) {
        let mut clear_suppression = true;
        match ctx.programmer.poll_activate(item.location) {
            OpStatus::InProgress => clear_suppression = false,
            OpStatus::Done => {
                info!(location = %item.location, "activation complete");
                item.transition(UpgradeState::CheckResult, "activation complete");
            }
            OpStatus::Busy => {
                clear_suppression = false;
                if !item.consume_retry(self.config.max_retries) {
                    clear_suppression = true;
                    self.fail_attempt(item, CompletionReason::FailRetryExceeded);
                }
            }
            OpStatus::ChecksumError => {
                self.fail_attempt(item, CompletionReason::FailChecksum);
            }
            OpStatus::ActivateTimeout => {
                warn!(location = %item.location, "activation timed out");
                self.fail_attempt(item, CompletionReason::FailActivateTimeout);
            }
        }
        if clear_suppression {
            self.suppression
                .write()
                .clear_local_activating(item.location);
        }
    }

    fn step_check_result(&mut self, item: &mut WorkItem, now: Instant) {
        if item.reason == CompletionReason::InProgress {
            item.reason = CompletionReason::SuccessRevChanged;
            self.last_activation_end.insert(item.location, now);
        }
        item.transition(UpgradeState::RefreshDeviceStatus, "result recorded");
    }

    fn step_refresh_status(&self, item: &mut WorkItem, ctx: &mut FupContext<'_>) {
        if let Some(record) = (ctx.records)(item.location) {
            item.current_rev = record.firmware_rev;
        }
        item.transition(UpgradeState::EndUpgrade, "device status refreshed");
    }

    fn step_end_upgrade(
        &self,
        item: &mut WorkItem,
        ctx: &mut FupContext<'_>,
        events: &mut Vec<DeviceEvent>,
    ) {
        let entry = CompletionEntry {
            location: item.location,
            target: item.target.clone(),
            reason: item.reason,
            timestamp: Utc::now(),
        };
        let bytes = serde_json::to_vec(&entry).expect("completion entry encodes");
        match ctx
            .persist
            .write_single(PersistSector::FupCompletionLog, &bytes)
        {
            Ok(_) => {}
            Err(err) if err.is_transient() => return, // pending, retry next tick
            Err(err) => {
                // losing the durable record must not wedge the pipeline
                warn!(location = %item.location, error = %err, "completion persist failed");
            }
        }

        info!(
            location = %item.location,
            target = %item.target,
            reason = %item.reason,
            duration_ms = item.elapsed_ms(),
            "upgrade finished"
        );
        events.push(DeviceEvent::UpgradeCompleted {
            location: item.location,
            target: item.target.to_string(),
            reason: item.reason.to_string(),
            duration_ms: item.elapsed_ms(),
            timestamp: Utc::now(),
        });
        item.transition(UpgradeState::ReleaseImage, "completion recorded");
    }

    fn step_release(&self, item: &mut WorkItem) {
        item.image = None;
        item.header = None;
        item.transition(UpgradeState::Idle, "image released");
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Consume retry budget for a transient error, failing the attempt once
    /// the budget is gone. Peer-permission transients map to
    /// NoPeerPermission, everything else to FailRetryExceeded.
    fn retry_or_fail(&self, item: &mut WorkItem, err: &Error) {
        if item.consume_retry(self.config.max_retries) {
            debug!(
                location = %item.location,
                state = %item.state,
                retry = item.retry_count,
                error = %err,
                "transient error, retrying"
            );
        } else {
            warn!(location = %item.location, state = %item.state, "retry budget exhausted");
            let reason = if item.state == UpgradeState::GetPeerPermission {
                CompletionReason::NoPeerPermission
            } else {
                CompletionReason::FailRetryExceeded
            };
            self.fail_attempt(item, reason);
        }
    }

    /// Terminal disposition for the attempt: record the reason and route the
    /// item through CheckResult toward EndUpgrade.
    fn fail_attempt(&self, item: &mut WorkItem, reason: CompletionReason) {
        item.reason = reason;
        item.transition(UpgradeState::CheckResult, format!("attempt ended: {}", reason));
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// True if a device in this location has a mid-upgrade item. Used by the
    /// inbound permission arbiter.
    pub fn upgrade_in_progress(&self, location: DeviceLocation) -> bool {
        self.items
            .iter()
            .any(|((loc, _), item)| *loc == location && item.state != UpgradeState::Idle)
    }

    /// Live item count.
    pub fn live_items(&self) -> usize {
        self.items.len()
    }

    /// Force flags the engine applies when it initiates an upgrade itself.
    pub fn default_force(&self) -> ForceFlags {
        self.config.default_force
    }

    /// Snapshot of all live items for the control surface.
    pub fn snapshot(&self) -> Vec<WorkItemSnapshot> {
        self.items.values().map(WorkItemSnapshot::from).collect()
    }

    /// Last terminal reason for a (device, target).
    pub fn completion(
        &self,
        location: DeviceLocation,
        target: &FirmwareTarget,
    ) -> Option<CompletionReason> {
        self.completed.get(&(location, target.clone())).copied()
    }
}
