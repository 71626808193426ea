//! FRUpilot - Redundant FRU Management and Firmware Upgrade Engine
//!
//! Management engine for the field-replaceable units (power supplies and
//! friends) of a dual-controller storage appliance. Each controller runs one
//! engine instance per device class; the two instances coordinate over the
//! inter-controller link so firmware activation never takes both redundant
//! feeds down at once.
//!
//! # Architecture
//!
//! ```text
//! Discovery → Device Status Monitor → Upgrade Orchestrator → Programmer
//!                    │ (debounce)            │ (work items)
//!                    ▼                       ▼
//!            Cache-Status Aggregator   Peer Coordination ⇄ peer controller
//! ```
//!
//! Everything is driven by the condition scheduler: a single-threaded tick
//! loop running an ordered condition table through the Specialize → Activate
//! → Ready lifecycle. Conditions never block; waiting is expressed as
//! "pending, re-check next tick".
//!
//! # Modules
//!
//! - [`adapters`] - Infrastructure adapters implementing domain ports
//! - [`cache_status`] - Tri-state cache availability aggregation
//! - [`control`] - Status mirror and command surface
//! - [`domain`] - Domain layer with ports and events
//! - [`engine`] - Engine assembly and tick loop
//! - [`error`] - Error types
//! - [`fup`] - Firmware upgrade pipeline (work items, manifest, orchestrator)
//! - [`monitor`] - Device status monitor with fault debounce
//! - [`peer`] - Cross-controller coordination protocol
//! - [`persist`] - Durable store client contract
//! - [`scheduler`] - Condition scheduler

pub mod adapters;
pub mod cache_status;
pub mod control;
pub mod domain;
pub mod engine;
pub mod error;
pub mod fup;
pub mod monitor;
pub mod peer;
pub mod persist;
pub mod scheduler;

// Re-export commonly used types
pub use control::ControlSurface;
pub use domain::{CacheStatus, DeviceLocation, DeviceRecord, SpId};
pub use engine::{Engine, EngineConfig, EnginePorts};
pub use error::{Error, Result};
pub use fup::{CompletionReason, UpgradeState, WorkItemSnapshot};
pub use scheduler::LifecyclePhase;
