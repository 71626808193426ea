//! Engine assembly
//!
//! Wires the condition scheduler to the monitor, upgrade orchestrator, peer
//! coordinator, and cache-status aggregator, and owns the tick loop. One
//! engine instance manages one device class on one controller.
//!
//! Condition order within a tick matters: device-status intake (removals
//! included) runs before the work-item step pass so a pulled device is never
//! acted on later in the same tick, and the abort pass runs after the step
//! pass so an abort cannot race a phase completing normally.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache_status::{AggregateOutcome, CacheStatusAggregator};
use crate::control::{ControlCommand, ControlSurface, StatusMirror};
use crate::domain::events::DeviceEvent;
use crate::domain::ports::{
    DeviceProgrammer, DiscoverySource, EventSink, ImageRepository, PeerTransport,
};
use crate::domain::{DeviceLocation, SpId};
use crate::fup::{FupConfig, FupContext, FupOrchestrator, ManifestCache};
use crate::monitor::{DeviceMonitor, MonitorConfig, RedundancyGroups, SuppressionPolicy};
use crate::peer::{PeerConfig, PeerCoordinator};
use crate::persist::{PersistClient, PersistSector};
use crate::scheduler::{ConditionAttr, ConditionOutcome, LifecyclePhase, Scheduler};

// =============================================================================
// Configuration
// =============================================================================

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Which controller this engine runs on
    pub local_sp: SpId,
    /// Scheduler tick interval
    pub tick_interval: Duration,
    /// Debounce sweep interval
    pub sweep_interval: Duration,
    /// Redundancy topology
    pub groups: RedundancyGroups,
    pub monitor: MonitorConfig,
    pub fup: FupConfig,
    pub peer: PeerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            local_sp: SpId::SpA,
            tick_interval: Duration::from_millis(500),
            sweep_interval: Duration::from_secs(1),
            groups: RedundancyGroups::default(),
            monitor: MonitorConfig::default(),
            fup: FupConfig::default(),
            peer: PeerConfig::default(),
        }
    }
}

/// Infrastructure handed to the engine at assembly time.
pub struct EnginePorts {
    pub discovery: Box<dyn DiscoverySource>,
    pub programmer: Box<dyn DeviceProgrammer>,
    pub images: Box<dyn ImageRepository>,
    pub transport: Box<dyn PeerTransport>,
    pub persist: Box<dyn PersistClient>,
    pub events: Box<dyn EventSink>,
    pub manifest: ManifestCache,
}

// =============================================================================
// Engine core (the scheduled object)
// =============================================================================

/// State the scheduler's conditions operate on.
pub struct EngineCore {
    monitor: DeviceMonitor,
    fup: FupOrchestrator,
    peer: PeerCoordinator,
    aggregator: CacheStatusAggregator,
    suppression: Arc<RwLock<SuppressionPolicy>>,
    groups: RedundancyGroups,
    discovery: Box<dyn DiscoverySource>,
    programmer: Box<dyn DeviceProgrammer>,
    images: Box<dyn ImageRepository>,
    persist: Box<dyn PersistClient>,
    events: Box<dyn EventSink>,
    manifest: ManifestCache,
    mirror: Arc<StatusMirror>,
    commands: mpsc::UnboundedReceiver<ControlCommand>,
    /// Slots queued for upgrade re-evaluation
    pending_eval: Vec<DeviceLocation>,
    /// Device state changed; recompute cache status this tick
    cache_dirty: bool,
    /// Family persist that bounced Busy, retried next tick
    pending_family: Option<String>,
    peer_contact_lost: bool,
    peer_activation_grace: Duration,
    /// Wall-clock anchor for the current tick
    now: Instant,
}

impl EngineCore {
    pub fn monitor(&self) -> &DeviceMonitor {
        &self.monitor
    }

    pub fn fup(&self) -> &FupOrchestrator {
        &self.fup
    }

    pub fn aggregator(&self) -> &CacheStatusAggregator {
        &self.aggregator
    }

    fn publish_events(&self, events: &[DeviceEvent]) {
        for event in events {
            self.events.publish(event);
        }
    }

    // =========================================================================
    // Specialize / Activate
    // =========================================================================

    /// Startup: restore the persisted device-family policy and take a full
    /// status sweep.
    fn specialize(&mut self) {
        let restored = self
            .persist
            .read_sector(PersistSector::DevicePolicy)
            .into_iter()
            .last()
            .and_then(|(_, bytes)| String::from_utf8(bytes).ok());
        if let Some(family) = restored {
            info!(family = family.as_str(), "restored device family policy");
            self.monitor.set_expected_family(Some(family));
        }

        let samples = self.discovery.poll_all();
        info!(devices = samples.len(), "startup status sweep");
        let out = self.monitor.full_poll(samples, self.now);
        self.handle_monitor_output(out);
        self.cache_dirty = true;
    }

    /// First cache-status computation and broadcast to the peer.
    fn announce(&mut self) {
        self.cache_dirty = true;
        self.cache_recompute();
    }

    // =========================================================================
    // Ready-phase conditions
    // =========================================================================

    fn control_intake(&mut self) {
        if let Some(family) = self.pending_family.take() {
            self.persist_family(family);
        }
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                ControlCommand::SetExpectedDeviceType { family } => {
                    info!(family = family.as_str(), "expected device family pinned");
                    self.monitor.set_expected_family(Some(family.clone()));
                    self.persist_family(family);
                }
                ControlCommand::RequestAbort { location } => {
                    info!(location = %location, "abort requested");
                    self.fup.request_abort(location);
                }
            }
        }
    }

    fn peer_intake(&mut self) {
        let activity = {
            let fup = &self.fup;
            let monitor = &self.monitor;
            let groups = &self.groups;
            // Grant unless our twin of the requested slot is mid-upgrade or
            // unhealthy; taking both feeds down at once is never allowed.
            self.peer.process(self.now, |location| {
                match groups.twin(location) {
                    None => true,
                    Some(twin) => {
                        !fup.upgrade_in_progress(twin)
                            && monitor
                                .record(twin)
                                .map(|r| r.healthy())
                                .unwrap_or(false)
                    }
                }
            })
        };

        for location in activity.granted_to_peer {
            self.suppression
                .write()
                .mark_peer_activating(location, self.now + self.peer_activation_grace);
        }
        if activity.contact_lost {
            self.peer_contact_lost = true;
            self.publish_events(&[DeviceEvent::PeerContactLost {
                timestamp: Utc::now(),
            }]);
        }
        if activity.peer_alive {
            if self.peer_contact_lost {
                self.peer_contact_lost = false;
                self.publish_events(&[DeviceEvent::PeerContactRestored {
                    timestamp: Utc::now(),
                }]);
            }
            let resumed = self.fup.peer_alive_resume();
            self.pending_eval.extend(resumed);
        }
        if let Some(status) = activity.peer_cache_status {
            let outcome = self.aggregator.update_peer(status);
            self.apply_aggregate(outcome);
        }
    }

    fn device_status_intake(&mut self) {
        let notes = self.discovery.drain_notifications();
        if notes.is_empty() {
            return;
        }
        let out = self.monitor.handle_notifications(notes, self.now);
        self.handle_monitor_output(out);
    }

    fn debounce_sweep(&mut self) {
        let out = self.monitor.sweep_debounce(self.now);
        self.handle_monitor_output(out);
    }

    fn fup_evaluate(&mut self) {
        if self.pending_eval.is_empty() {
            return;
        }
        let manifest = match self.manifest.get() {
            Ok(manifest) => manifest,
            Err(err) => {
                // keep the queue; evaluation retries once the manifest loads
                warn!(error = %err, "manifest unavailable, upgrade evaluation deferred");
                return;
            }
        };

        let mut locations: Vec<DeviceLocation> = self.pending_eval.drain(..).collect();
        locations.sort();
        locations.dedup();
        let force = self.fup.default_force();
        for location in locations {
            let Some(record) = self.monitor.record(location).cloned() else {
                continue;
            };
            self.fup.evaluate_device(&record, &manifest, force, self.now);
        }
    }

    fn fup_step(&mut self) {
        let events = {
            let monitor = &self.monitor;
            let records = move |location: DeviceLocation| monitor.record(location).cloned();
            let mut ctx = FupContext {
                programmer: self.programmer.as_mut(),
                images: self.images.as_ref(),
                peer: &mut self.peer,
                persist: self.persist.as_mut(),
                records: &records,
                now: self.now,
            };
            self.fup.step_all(&mut ctx)
        };
        self.publish_events(&events);
    }

    fn fup_abort(&mut self) {
        self.fup.abort_pass(&mut self.peer);
    }

    fn cache_recompute(&mut self) {
        if !self.cache_dirty {
            return;
        }
        self.cache_dirty = false;
        let outcome = {
            let monitor = &self.monitor;
            self.aggregator.recompute(&|l| monitor.record(l).cloned())
        };
        self.apply_aggregate(outcome);
    }

    fn publish_mirror(&self) {
        self.mirror.publish_devices(self.monitor.records());
        self.mirror.publish_work_items(self.fup.snapshot());
    }

    // =========================================================================
    // Shared handling
    // =========================================================================

    fn handle_monitor_output(&mut self, out: crate::monitor::MonitorOutput) {
        for location in &out.removed {
            self.fup.handle_removal(*location, &mut self.peer);
            self.suppression.write().clear_peer_activating(*location);
        }
        if let Some(family) = out.learned_family.clone() {
            self.persist_family(family);
        }
        if !out.changed.is_empty() {
            let restarts = self.fup.env_restart_candidates(&out.changed);
            self.pending_eval.extend(out.changed.iter().copied());
            self.pending_eval.extend(restarts);
            self.cache_dirty = true;
        }
        if !out.removed.is_empty() {
            self.cache_dirty = true;
        }
        self.publish_events(&out.events);
    }

    fn apply_aggregate(&mut self, outcome: AggregateOutcome) {
        if let Some((old, new)) = outcome.transition {
            self.mirror.publish_cache_status(new);
            self.publish_events(&[DeviceEvent::CacheStatusChanged {
                old,
                new,
                timestamp: Utc::now(),
            }]);
        }
        if let Some(status) = outcome.broadcast {
            self.peer.broadcast_cache_status(status);
        }
    }

    fn persist_family(&mut self, family: String) {
        match self
            .persist
            .write_single(PersistSector::DevicePolicy, family.as_bytes())
        {
            Ok(_) => {
                info!(family = family.as_str(), "device family policy persisted");
            }
            Err(err) if err.is_transient() => {
                debug!(error = %err, "family persist busy, retrying next tick");
                self.pending_family = Some(family);
            }
            Err(err) => {
                warn!(error = %err, "device family policy persist failed");
            }
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// The assembled engine: a scheduled core plus its tick loop.
pub struct Engine {
    scheduler: Scheduler<EngineCore>,
    core: EngineCore,
    tick_interval: Duration,
}

impl Engine {
    /// Assemble an engine and its caller-facing control surface.
    pub fn new(config: EngineConfig, ports: EnginePorts) -> (Self, ControlSurface) {
        let suppression = Arc::new(RwLock::new(SuppressionPolicy::default()));
        let monitor = DeviceMonitor::new(
            config.monitor.clone(),
            config.groups.clone(),
            suppression.clone(),
        );
        let fup = FupOrchestrator::new(
            config.fup.clone(),
            config.local_sp,
            config.groups.clone(),
            suppression.clone(),
        );
        let peer = PeerCoordinator::new(config.peer.clone(), ports.transport);
        let aggregator = CacheStatusAggregator::new(config.groups.clone());
        let mirror = StatusMirror::new();
        let (surface, commands) = ControlSurface::new(mirror.clone());

        let core = EngineCore {
            monitor,
            fup,
            peer,
            aggregator,
            suppression,
            groups: config.groups.clone(),
            discovery: ports.discovery,
            programmer: ports.programmer,
            images: ports.images,
            persist: ports.persist,
            events: ports.events,
            manifest: ports.manifest,
            mirror,
            commands,
            pending_eval: Vec::new(),
            cache_dirty: false,
            pending_family: None,
            peer_contact_lost: false,
            peer_activation_grace: config.fup.peer_activation_grace,
            now: Instant::now(),
        };

        let mut scheduler = Scheduler::new("fru_engine");
        scheduler.declare(
            "startup_poll",
            LifecyclePhase::Specialize,
            ConditionAttr::Preset,
            |core: &mut EngineCore, ops| {
                core.specialize();
                ops.set_phase(LifecyclePhase::Activate);
                ConditionOutcome::Complete
            },
        );
        scheduler.declare(
            "announce_peer",
            LifecyclePhase::Activate,
            ConditionAttr::Preset,
            |core: &mut EngineCore, ops| {
                core.announce();
                ops.set_phase(LifecyclePhase::Ready);
                ConditionOutcome::Complete
            },
        );
        scheduler.declare(
            "control_intake",
            LifecyclePhase::Ready,
            ConditionAttr::Preset,
            |core: &mut EngineCore, _| {
                core.control_intake();
                ConditionOutcome::Pending
            },
        );
        scheduler.declare(
            "peer_intake",
            LifecyclePhase::Ready,
            ConditionAttr::Preset,
            |core: &mut EngineCore, _| {
                core.peer_intake();
                ConditionOutcome::Pending
            },
        );
        scheduler.declare(
            "device_status",
            LifecyclePhase::Ready,
            ConditionAttr::Preset,
            |core: &mut EngineCore, _| {
                core.device_status_intake();
                ConditionOutcome::Pending
            },
        );
        scheduler.declare(
            "debounce_sweep",
            LifecyclePhase::Ready,
            ConditionAttr::PeriodicTimer(config.sweep_interval),
            |core: &mut EngineCore, _| {
                core.debounce_sweep();
                ConditionOutcome::Complete
            },
        );
        scheduler.declare(
            "fup_evaluate",
            LifecyclePhase::Ready,
            ConditionAttr::Preset,
            |core: &mut EngineCore, _| {
                core.fup_evaluate();
                ConditionOutcome::Pending
            },
        );
        scheduler.declare(
            "fup_step",
            LifecyclePhase::Ready,
            ConditionAttr::Preset,
            |core: &mut EngineCore, _| {
                core.fup_step();
                ConditionOutcome::Pending
            },
        );
        scheduler.declare(
            "fup_abort",
            LifecyclePhase::Ready,
            ConditionAttr::Preset,
            |core: &mut EngineCore, _| {
                core.fup_abort();
                ConditionOutcome::Pending
            },
        );
        scheduler.declare(
            "cache_status",
            LifecyclePhase::Ready,
            ConditionAttr::Preset,
            |core: &mut EngineCore, _| {
                core.cache_recompute();
                ConditionOutcome::Pending
            },
        );
        scheduler.declare(
            "publish_status",
            LifecyclePhase::Ready,
            ConditionAttr::Preset,
            |core: &mut EngineCore, _| {
                core.publish_mirror();
                ConditionOutcome::Pending
            },
        );

        (
            Self {
                scheduler,
                core,
                tick_interval: config.tick_interval,
            },
            surface,
        )
    }

    /// Run one scheduler tick at the given instant. Exposed for tests and
    /// simulation drivers.
    pub fn tick_once(&mut self, now: Instant) {
        self.core.now = now;
        self.scheduler.tick(&mut self.core, now);
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.scheduler.phase()
    }

    pub fn core(&self) -> &EngineCore {
        &self.core
    }

    /// Drive the tick loop until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_ms = self.tick_interval.as_millis() as u64,
            "engine tick loop started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("engine tick loop stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick_once(Instant::now());
                }
            }
        }
    }
}
