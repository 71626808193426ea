//! Event sink adapters
//!
//! The daemon publishes domain events through the structured log; tests
//! collect them in memory and assert on the sequence.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::domain::events::DeviceEvent;
use crate::domain::ports::EventSink;

/// Publishes each event as a structured log line.
#[derive(Default)]
pub struct LoggingEventSink;

impl LoggingEventSink {
    pub fn new() -> Self {
        Self
    }
}

impl EventSink for LoggingEventSink {
    fn publish(&self, event: &DeviceEvent) {
        match event.location() {
            Some(location) => info!(
                event_type = event.event_type(),
                %location,
                detail = ?event,
                "device event"
            ),
            None => info!(event_type = event.event_type(), detail = ?event, "device event"),
        }
    }
}

/// Collects published events for inspection, cloneable across the test
/// harness and the engine.
#[derive(Clone, Default)]
pub struct InMemoryEventCollector {
    events: Arc<Mutex<Vec<DeviceEvent>>>,
}

impl InMemoryEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DeviceEvent> {
        self.events.lock().clone()
    }

    /// Event type names in publish order.
    pub fn event_types(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.event_type()).collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for InMemoryEventCollector {
    fn publish(&self, event: &DeviceEvent) {
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::FaultKind;
    use crate::domain::DeviceLocation;
    use chrono::Utc;

    #[test]
    fn test_collector_preserves_order() {
        let collector = InMemoryEventCollector::new();
        let loc = DeviceLocation::new(0, 1, 0);

        collector.publish(&DeviceEvent::DeviceInserted {
            location: loc,
            product_id: "ACME-PS-550".into(),
            timestamp: Utc::now(),
        });
        collector.publish(&DeviceEvent::FaultAsserted {
            location: loc,
            fault: FaultKind::OverTemperature,
            timestamp: Utc::now(),
        });

        assert_eq!(
            collector.event_types(),
            vec!["DeviceInserted", "FaultAsserted"]
        );
    }
}
