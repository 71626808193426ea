//! Loopback inter-controller transport
//!
//! A pair of in-process endpoints wired back to back with unbounded
//! channels. `loopback_pair` stands in for the CMI-style hardware link in
//! simulation mode and in two-engine tests; each side can also be driven to
//! report link faults.

use tokio::sync::mpsc;
use tracing::warn;

use crate::domain::ports::{PeerTransport, SendOutcome, TransportEvent};

/// One endpoint of an in-process controller-to-controller link.
pub struct LoopbackTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    injected: Vec<TransportEvent>,
    link_up: bool,
}

impl LoopbackTransport {
    /// Inject a link-level event ahead of any received payloads.
    pub fn inject(&mut self, event: TransportEvent) {
        self.injected.push(event);
    }

    /// Take the link down: sends report Busy and queued payloads are
    /// discarded until `set_link_up(true)`.
    pub fn set_link_up(&mut self, up: bool) {
        self.link_up = up;
    }
}

impl PeerTransport for LoopbackTransport {
    fn try_send(&mut self, payload: &[u8]) -> SendOutcome {
        if !self.link_up {
            return SendOutcome::Busy;
        }
        match self.tx.send(payload.to_vec()) {
            Ok(()) => SendOutcome::Sent,
            Err(_) => {
                warn!("loopback peer endpoint dropped");
                SendOutcome::Busy
            }
        }
    }

    fn drain_events(&mut self) -> Vec<TransportEvent> {
        let mut events = std::mem::take(&mut self.injected);
        while let Ok(payload) = self.rx.try_recv() {
            if self.link_up {
                events.push(TransportEvent::Received(payload));
            }
        }
        events
    }
}

/// Build two connected endpoints, one per controller.
pub fn loopback_pair() -> (LoopbackTransport, LoopbackTransport) {
    let (tx_a, rx_b) = mpsc::unbounded_channel();
    let (tx_b, rx_a) = mpsc::unbounded_channel();
    (
        LoopbackTransport {
            tx: tx_a,
            rx: rx_a,
            injected: Vec::new(),
            link_up: true,
        },
        LoopbackTransport {
            tx: tx_b,
            rx: rx_b,
            injected: Vec::new(),
            link_up: true,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_crosses_the_link() {
        let (mut a, mut b) = loopback_pair();

        assert_eq!(a.try_send(b"hello"), SendOutcome::Sent);
        let events = b.drain_events();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], TransportEvent::Received(p) if p == b"hello"));
        assert!(b.drain_events().is_empty());
    }

    #[test]
    fn test_link_down_rejects_and_discards() {
        let (mut a, mut b) = loopback_pair();

        b.set_link_up(false);
        assert_eq!(a.try_send(b"dropped"), SendOutcome::Sent);
        assert!(b.drain_events().is_empty());

        a.set_link_up(false);
        assert_eq!(a.try_send(b"rejected"), SendOutcome::Busy);
    }

    #[test]
    fn test_injected_events_come_first() {
        let (mut a, mut b) = loopback_pair();

        a.try_send(b"payload");
        b.inject(TransportEvent::PeerAlive);

        let events = b.drain_events();
        assert!(matches!(events[0], TransportEvent::PeerAlive));
        assert!(matches!(events[1], TransportEvent::Received(_)));
    }
}
