//! Peer coordination protocol
//!
//! Thin asynchronous messaging layer over the controller-to-controller link.
//! Before activating firmware on a device with a cross-controller redundant
//! twin, the orchestrator must hold this layer's permission. Payloads travel
//! as opaque bytes through the `PeerTransport` port; this module owns the
//! tagged message type and all request/retry/timeout bookkeeping.
//!
//! Rules:
//! - `PeerNotPresent` on a request auto-grants (nobody to coordinate with)
//! - `PeerBusy` retries with backoff, bounded by the retry budget
//! - no answer inside the response timeout, or a transport `FatalError`,
//!   counts as a deny
//! - inbound requests are granted unless our own twin of the requested
//!   device is mid-upgrade or unhealthy

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::ports::{PeerTransport, SendOutcome, TransportEvent};
use crate::domain::{CacheStatus, DeviceLocation};

// =============================================================================
// Wire messages
// =============================================================================

/// Message exchanged between the two controllers. Exhaustively matched on
/// receipt; there is no default-case fallthrough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum PeerMessage {
    PermissionRequest {
        work_item_id: Uuid,
        location: DeviceLocation,
    },
    PermissionGrant {
        work_item_id: Uuid,
    },
    PermissionDeny {
        work_item_id: Uuid,
    },
    CacheStatusUpdate {
        status: CacheStatus,
    },
    PeerAlive,
}

impl PeerMessage {
    fn encode(&self) -> Vec<u8> {
        // message enums serialize infallibly
        serde_json::to_vec(self).expect("peer message encodes")
    }

    fn decode(payload: &[u8]) -> Option<PeerMessage> {
        match serde_json::from_slice(payload) {
            Ok(msg) => Some(msg),
            Err(err) => {
                warn!(error = %err, "undecodable peer message dropped");
                None
            }
        }
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// Peer protocol tuning.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// How long to wait for an answer before treating the request as denied
    pub response_timeout: Duration,
    /// Delay before re-sending after a busy reply
    pub retry_backoff: Duration,
    /// Busy retries allowed per request
    pub max_retries: u32,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(10),
            retry_backoff: Duration::from_secs(1),
            max_retries: 3,
        }
    }
}

/// Disposition of one permission request as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionOutcome {
    Pending,
    Granted,
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestPhase {
    /// Needs (re-)sending, no earlier than `next_attempt`
    Sending,
    /// On the wire, waiting for an answer until `deadline`
    AwaitingReply,
}

#[derive(Debug)]
struct OutstandingRequest {
    location: DeviceLocation,
    phase: RequestPhase,
    retries: u32,
    next_attempt: Instant,
    deadline: Instant,
}

/// What one processing pass surfaced to the engine.
#[derive(Debug, Default)]
pub struct PeerActivity {
    /// Contact with the peer was (re-)established this pass
    pub peer_alive: bool,
    /// Contact with the peer was lost this pass
    pub contact_lost: bool,
    /// Fresh cache status reported by the peer
    pub peer_cache_status: Option<CacheStatus>,
    /// The peer asked for the local value again (it reported Uninitialized)
    pub rebroadcast_wanted: bool,
    /// Inbound permission requests we granted (device location granted)
    pub granted_to_peer: Vec<DeviceLocation>,
}

/// Owns the permission-request state machines and the transport.
pub struct PeerCoordinator {
    config: PeerConfig,
    transport: Box<dyn PeerTransport>,
    outstanding: HashMap<Uuid, OutstandingRequest>,
    outcomes: HashMap<Uuid, PermissionOutcome>,
    outbox: VecDeque<PeerMessage>,
    peer_present: bool,
}

impl PeerCoordinator {
    pub fn new(config: PeerConfig, transport: Box<dyn PeerTransport>) -> Self {
        Self {
            config,
            transport,
            outstanding: HashMap::new(),
            outcomes: HashMap::new(),
            outbox: VecDeque::new(),
            peer_present: true,
        }
    }

    /// Whether the peer controller is believed installed and reachable.
    pub fn peer_present(&self) -> bool {
        self.peer_present
    }

    /// Begin a permission request for a work item. With no peer installed
    /// the request auto-grants immediately.
    pub fn submit_request(&mut self, work_item_id: Uuid, location: DeviceLocation, now: Instant) {
        if !self.peer_present {
            debug!(work_item = %work_item_id, "no peer present, auto-granting permission");
            self.outcomes.insert(work_item_id, PermissionOutcome::Granted);
            return;
        }
        self.outcomes.insert(work_item_id, PermissionOutcome::Pending);
        self.outstanding.insert(
            work_item_id,
            OutstandingRequest {
                location,
                phase: RequestPhase::Sending,
                retries: 0,
                next_attempt: now,
                deadline: now + self.config.response_timeout,
            },
        );
    }

    /// Current disposition of a request.
    pub fn outcome(&self, work_item_id: Uuid) -> PermissionOutcome {
        self.outcomes
            .get(&work_item_id)
            .copied()
            .unwrap_or(PermissionOutcome::Pending)
    }

    /// Drop all state for a work item (teardown, abort, completion).
    pub fn forget(&mut self, work_item_id: Uuid) {
        self.outstanding.remove(&work_item_id);
        self.outcomes.remove(&work_item_id);
    }

    /// Queue an unsolicited cache-status broadcast to the peer.
    pub fn broadcast_cache_status(&mut self, status: CacheStatus) {
        self.outbox
            .push_back(PeerMessage::CacheStatusUpdate { status });
    }

    /// One processing pass: drain transport events, answer inbound requests,
    /// pump outstanding requests and the outbox.
    ///
    /// `may_grant` arbitrates inbound requests: given the peer's device
    /// location, may the peer take it down right now?
    pub fn process(
        &mut self,
        now: Instant,
        mut may_grant: impl FnMut(DeviceLocation) -> bool,
    ) -> PeerActivity {
        let mut activity = PeerActivity::default();

        for event in self.transport.drain_events() {
            self.handle_event(event, now, &mut may_grant, &mut activity);
        }

        self.pump_requests(now);
        self.flush_outbox();
        activity
    }

    // =========================================================================
    // Event handling
    // =========================================================================

    fn handle_event(
        &mut self,
        event: TransportEvent,
        now: Instant,
        may_grant: &mut impl FnMut(DeviceLocation) -> bool,
        activity: &mut PeerActivity,
    ) {
        match event {
            TransportEvent::Received(payload) => {
                if let Some(msg) = PeerMessage::decode(&payload) {
                    self.handle_message(msg, may_grant, activity);
                }
            }
            TransportEvent::PeerNotPresent => {
                // nobody to coordinate with: every outstanding request grants
                if self.peer_present {
                    info!("peer not present, auto-granting outstanding permission requests");
                }
                self.peer_present = false;
                for (id, _) in self.outstanding.drain() {
                    self.outcomes.insert(id, PermissionOutcome::Granted);
                }
            }
            TransportEvent::PeerBusy => {
                self.handle_peer_busy(now);
            }
            TransportEvent::ContactLost => {
                warn!("peer contact lost");
                activity.contact_lost = true;
                for (id, _) in self.outstanding.drain() {
                    self.outcomes.insert(id, PermissionOutcome::Denied);
                }
            }
            TransportEvent::FatalError => {
                warn!("peer transport fatal error, denying outstanding requests");
                for (id, _) in self.outstanding.drain() {
                    self.outcomes.insert(id, PermissionOutcome::Denied);
                }
            }
            TransportEvent::PeerAlive => {
                info!("peer contact established");
                self.peer_present = true;
                activity.peer_alive = true;
            }
        }
    }

    fn handle_message(
        &mut self,
        msg: PeerMessage,
        may_grant: &mut impl FnMut(DeviceLocation) -> bool,
        activity: &mut PeerActivity,
    ) {
        match msg {
            PeerMessage::PermissionRequest {
                work_item_id,
                location,
            } => {
                if may_grant(location) {
                    info!(location = %location, "granting peer permission request");
                    self.outbox
                        .push_back(PeerMessage::PermissionGrant { work_item_id });
                    activity.granted_to_peer.push(location);
                } else {
                    info!(location = %location, "denying peer permission request");
                    self.outbox
                        .push_back(PeerMessage::PermissionDeny { work_item_id });
                }
            }
            PeerMessage::PermissionGrant { work_item_id } => {
                if self.outstanding.remove(&work_item_id).is_some() {
                    info!(work_item = %work_item_id, "peer granted permission");
                    self.outcomes
                        .insert(work_item_id, PermissionOutcome::Granted);
                } else {
                    debug!(work_item = %work_item_id, "grant for unknown request ignored");
                }
            }
            PeerMessage::PermissionDeny { work_item_id } => {
                if self.outstanding.remove(&work_item_id).is_some() {
                    info!(work_item = %work_item_id, "peer denied permission");
                    self.outcomes
                        .insert(work_item_id, PermissionOutcome::Denied);
                }
            }
            PeerMessage::CacheStatusUpdate { status } => {
                activity.peer_cache_status = Some(status);
                if status == CacheStatus::Uninitialized {
                    activity.rebroadcast_wanted = true;
                }
            }
            PeerMessage::PeerAlive => {
                self.peer_present = true;
                activity.peer_alive = true;
            }
        }
    }

    /// Peer answered busy: every awaiting request goes back to sending after
    /// a backoff, bounded by the retry budget.
    fn handle_peer_busy(&mut self, now: Instant) {
        let backoff = self.config.retry_backoff;
        let max_retries = self.config.max_retries;
        let timeout = self.config.response_timeout;
        let mut exhausted = Vec::new();

        for (id, req) in self.outstanding.iter_mut() {
            if req.phase != RequestPhase::AwaitingReply {
                continue;
            }
            req.retries += 1;
            if req.retries > max_retries {
                exhausted.push(*id);
            } else {
                warn!(
                    work_item = %id,
                    retry = req.retries,
                    "peer busy, retrying permission request"
                );
                req.phase = RequestPhase::Sending;
                req.next_attempt = now + backoff;
                req.deadline = now + backoff + timeout;
            }
        }
        for id in exhausted {
            warn!(work_item = %id, "peer busy retry budget exhausted, denying");
            self.outstanding.remove(&id);
            self.outcomes.insert(id, PermissionOutcome::Denied);
        }
    }

    // =========================================================================
    // Outbound pumping
    // =========================================================================

    fn pump_requests(&mut self, now: Instant) {
        let mut timed_out = Vec::new();
        let mut to_send = Vec::new();

        for (id, req) in self.outstanding.iter() {
            match req.phase {
                RequestPhase::Sending if req.next_attempt <= now => to_send.push(*id),
                RequestPhase::AwaitingReply if req.deadline <= now => timed_out.push(*id),
                _ => {}
            }
        }

        for id in timed_out {
            warn!(work_item = %id, "no peer response within timeout, denying");
            self.outstanding.remove(&id);
            self.outcomes.insert(id, PermissionOutcome::Denied);
        }

        for id in to_send {
            let Some(req) = self.outstanding.get_mut(&id) else {
                continue;
            };
            let msg = PeerMessage::PermissionRequest {
                work_item_id: id,
                location: req.location,
            };
            match self.transport.try_send(&msg.encode()) {
                SendOutcome::Sent => {
                    req.phase = RequestPhase::AwaitingReply;
                    req.deadline = now + self.config.response_timeout;
                }
                SendOutcome::Pending => {
                    // flow control; try again next tick, no budget consumed
                }
                SendOutcome::Busy => {
                    req.retries += 1;
                    if req.retries > self.config.max_retries {
                        warn!(work_item = %id, "transport busy retry budget exhausted, denying");
                        self.outstanding.remove(&id);
                        self.outcomes.insert(id, PermissionOutcome::Denied);
                    } else {
                        req.next_attempt = now + self.config.retry_backoff;
                    }
                }
            }
        }
    }

    fn flush_outbox(&mut self) {
        while let Some(msg) = self.outbox.front() {
            match self.transport.try_send(&msg.encode()) {
                SendOutcome::Sent => {
                    self.outbox.pop_front();
                }
                // leave the rest queued for the next pass
                SendOutcome::Pending | SendOutcome::Busy => break,
            }
        }
    }
}
