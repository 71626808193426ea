//! Per-slot fault debounce
//!
//! A raw fault's rising edge opens a fixed-width window during which the
//! externally visible fault bit is held at its previous value. The periodic
//! sweep marks windows whose period has elapsed; the monitor then re-reads
//! the raw signal and either applies the fault (still asserted) or closes
//! the window silently (flicker). A raw clear before expiry closes the
//! window immediately with no event.
//!
//! At most one window exists per slot.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::domain::DeviceLocation;

/// Debounce configuration.
#[derive(Debug, Clone)]
pub struct DebounceConfig {
    /// Window width W
    pub window: Duration,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(6),
        }
    }
}

/// One in-flight debounce window.
#[derive(Debug, Clone, Copy)]
struct Window {
    opened_at: Instant,
    /// Set by the periodic sweep once W has elapsed
    period_expired: bool,
}

/// The set of active debounce windows, one at most per slot.
#[derive(Debug)]
pub struct DebounceSet {
    config: DebounceConfig,
    windows: HashMap<DeviceLocation, Window>,
}

impl DebounceSet {
    pub fn new(config: DebounceConfig) -> Self {
        Self {
            config,
            windows: HashMap::new(),
        }
    }

    /// Whether a window is currently masking faults for this slot.
    pub fn masking(&self, location: DeviceLocation) -> bool {
        self.windows.contains_key(&location)
    }

    /// Open a window on a fault's rising edge. A second open for the same
    /// slot is a no-op: the first window keeps its deadline.
    pub fn open(&mut self, location: DeviceLocation, now: Instant) {
        self.windows.entry(location).or_insert_with(|| {
            debug!(location = %location, "debounce start, fault suppressed");
            Window {
                opened_at: now,
                period_expired: false,
            }
        });
    }

    /// True once the sweep has marked this slot's window expired.
    pub fn expired(&self, location: DeviceLocation) -> bool {
        self.windows
            .get(&location)
            .map(|w| w.period_expired)
            .unwrap_or(false)
    }

    /// Close the slot's window, if any. Used both for the silent path (raw
    /// fault cleared in time) and after applying a persistent fault.
    pub fn close(&mut self, location: DeviceLocation) {
        if self.windows.remove(&location).is_some() {
            debug!(location = %location, "debounce timer stopped");
        }
    }

    /// Drop all state for a removed device.
    pub fn remove_slot(&mut self, location: DeviceLocation) {
        self.windows.remove(&location);
    }

    /// Periodic sweep: mark windows whose period has elapsed and return their
    /// slots so the caller can re-evaluate the raw signal.
    pub fn sweep(&mut self, now: Instant) -> Vec<DeviceLocation> {
        let window = self.config.window;
        let mut newly_expired = Vec::new();
        for (loc, w) in self.windows.iter_mut() {
            if !w.period_expired && now.duration_since(w.opened_at) >= window {
                w.period_expired = true;
                newly_expired.push(*loc);
            }
        }
        newly_expired
    }

    /// Number of active windows (diagnostics).
    pub fn active_count(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc() -> DeviceLocation {
        DeviceLocation::new(0, 0, 0)
    }

    #[test]
    fn test_open_masks_until_sweep() {
        let mut set = DebounceSet::new(DebounceConfig::default());
        let t0 = Instant::now();

        set.open(loc(), t0);
        assert!(set.masking(loc()));
        assert!(!set.expired(loc()));

        // sweep before W: nothing expires
        let expired = set.sweep(t0 + Duration::from_secs(2));
        assert!(expired.is_empty());
        assert!(set.masking(loc()));
    }

    #[test]
    fn test_sweep_marks_expired_after_window() {
        let mut set = DebounceSet::new(DebounceConfig::default());
        let t0 = Instant::now();

        set.open(loc(), t0);
        let expired = set.sweep(t0 + Duration::from_secs(6));
        assert_eq!(expired, vec![loc()]);
        assert!(set.expired(loc()));

        // expiry is reported once
        let expired = set.sweep(t0 + Duration::from_secs(7));
        assert!(expired.is_empty());
    }

    #[test]
    fn test_reopen_keeps_original_deadline() {
        let mut set = DebounceSet::new(DebounceConfig::default());
        let t0 = Instant::now();

        set.open(loc(), t0);
        set.open(loc(), t0 + Duration::from_secs(5));
        assert_eq!(set.active_count(), 1);

        let expired = set.sweep(t0 + Duration::from_secs(6));
        assert_eq!(expired, vec![loc()]);
    }

    #[test]
    fn test_close_is_silent_and_idempotent() {
        let mut set = DebounceSet::new(DebounceConfig::default());
        let t0 = Instant::now();

        set.open(loc(), t0);
        set.close(loc());
        assert!(!set.masking(loc()));
        set.close(loc());

        let expired = set.sweep(t0 + Duration::from_secs(10));
        assert!(expired.is_empty());
    }
}
