//! Condition scheduler
//!
//! Cooperative engine that drives one management-object instance through an
//! ordered set of named conditions, grouped by lifecycle phase. Each tick
//! runs every due condition of the current phase, in declared order. A
//! condition either completes (clearing itself) or stays pending for the next
//! tick; periodic conditions re-arm themselves, everything else must be
//! re-armed explicitly.
//!
//! The engine is strictly single-threaded per object instance: no two
//! conditions of one object ever run concurrently, so conditions need no
//! internal locking. Conditions must never block; waiting for an external
//! result is expressed as "stay pending, re-check next tick".

use std::time::{Duration, Instant};

use tracing::{debug, trace};

// =============================================================================
// Condition model
// =============================================================================

/// Lifecycle phase of a managed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecyclePhase {
    /// One-time setup (startup poll, persisted-state read)
    Specialize,
    /// Bring-up of steady-state machinery
    Activate,
    /// Normal operation
    Ready,
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecyclePhase::Specialize => write!(f, "Specialize"),
            LifecyclePhase::Activate => write!(f, "Activate"),
            LifecyclePhase::Ready => write!(f, "Ready"),
        }
    }
}

/// Scheduling attribute of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionAttr {
    /// Armed at declaration time or explicitly by another condition
    Preset,
    /// Re-arms itself on the given interval
    PeriodicTimer(Duration),
}

/// What a condition's action reports back to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOutcome {
    /// The condition's work is done; it clears until re-armed
    Complete,
    /// Still waiting on something external; run again next tick
    Pending,
}

/// Requests a running condition hands back to the engine.
///
/// Applied as soon as the condition returns, so arming a condition declared
/// later in the table makes it run within the same tick.
#[derive(Debug, Default)]
pub struct TickOps {
    arm: Vec<&'static str>,
    phase: Option<LifecyclePhase>,
}

impl TickOps {
    /// Arm the named condition.
    pub fn arm(&mut self, name: &'static str) {
        self.arm.push(name);
    }

    /// Move the object to a new lifecycle phase. Takes effect on the next
    /// tick; the remainder of the current tick still runs the old phase.
    pub fn set_phase(&mut self, phase: LifecyclePhase) {
        self.phase = Some(phase);
    }
}

type Action<T> = Box<dyn FnMut(&mut T, &mut TickOps) -> ConditionOutcome + Send>;

struct ConditionSlot<T> {
    name: &'static str,
    phase: LifecyclePhase,
    attr: ConditionAttr,
    armed: bool,
    next_due: Option<Instant>,
    action: Action<T>,
}

// =============================================================================
// Scheduler
// =============================================================================

/// Drives one object instance. Conditions run in declared order.
pub struct Scheduler<T> {
    object_name: &'static str,
    conditions: Vec<ConditionSlot<T>>,
    phase: LifecyclePhase,
}

impl<T> Scheduler<T> {
    pub fn new(object_name: &'static str) -> Self {
        Self {
            object_name,
            conditions: Vec::new(),
            phase: LifecyclePhase::Specialize,
        }
    }

    /// Declare a condition. Preset conditions start armed; periodic ones
    /// first fire one interval after the first tick.
    pub fn declare(
        &mut self,
        name: &'static str,
        phase: LifecyclePhase,
        attr: ConditionAttr,
        action: impl FnMut(&mut T, &mut TickOps) -> ConditionOutcome + Send + 'static,
    ) {
        debug_assert!(
            self.conditions.iter().all(|c| c.name != name),
            "duplicate condition name"
        );
        self.conditions.push(ConditionSlot {
            name,
            phase,
            attr,
            armed: matches!(attr, ConditionAttr::Preset),
            next_due: None,
            action: Box::new(action),
        });
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    /// Arm a condition from outside the tick loop (external trigger).
    pub fn arm(&mut self, name: &'static str) {
        if let Some(slot) = self.conditions.iter_mut().find(|c| c.name == name) {
            slot.armed = true;
        } else {
            debug!(
                object = self.object_name,
                condition = name,
                "arm request for unknown condition"
            );
        }
    }

    /// Run one tick: every due condition of the current phase, in declared
    /// order.
    pub fn tick(&mut self, obj: &mut T, now: Instant) {
        let phase = self.phase;
        let mut ops = TickOps::default();

        for idx in 0..self.conditions.len() {
            let slot = &mut self.conditions[idx];
            if slot.phase != phase {
                continue;
            }

            let due = match slot.attr {
                ConditionAttr::Preset => slot.armed,
                ConditionAttr::PeriodicTimer(interval) => match slot.next_due {
                    None => {
                        slot.next_due = Some(now + interval);
                        slot.armed
                    }
                    Some(due_at) => slot.armed || due_at <= now,
                },
            };
            if !due {
                continue;
            }

            trace!(
                object = self.object_name,
                condition = slot.name,
                phase = %phase,
                "running condition"
            );
            let outcome = (slot.action)(obj, &mut ops);

            match outcome {
                ConditionOutcome::Complete => {
                    slot.armed = false;
                    if let ConditionAttr::PeriodicTimer(interval) = slot.attr {
                        slot.next_due = Some(now + interval);
                    }
                }
                ConditionOutcome::Pending => {
                    slot.armed = true;
                }
            }

            self.apply_ops(&mut ops);
        }

        if let Some(next) = ops.phase.take() {
            self.transition(next);
        }
    }

    fn apply_ops(&mut self, ops: &mut TickOps) {
        for name in ops.arm.drain(..) {
            self.arm(name);
        }
    }

    fn transition(&mut self, next: LifecyclePhase) {
        if next != self.phase {
            debug!(
                object = self.object_name,
                from = %self.phase,
                to = %next,
                "lifecycle transition"
            );
            self.phase = next;
        }
    }
}
