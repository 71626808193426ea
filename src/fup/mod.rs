//! Firmware upgrade pipeline
//!
//! One work item per (device, firmware target) pair, driven through a
//! multi-phase download/activate pipeline by the orchestrator. Peer
//! permission and environment gates sit ahead of activation so the appliance
//! never loses both power/cooling feeds of a controller at once.

pub mod manifest;
pub mod orchestrator;
pub mod work_item;

pub use manifest::{Manifest, ManifestCache, ManifestEntry};
pub use orchestrator::{FupConfig, FupContext, FupOrchestrator};
pub use work_item::{CompletionReason, UpgradeState, UpgradeStep, WorkItem, WorkItemSnapshot};
