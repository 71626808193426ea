//! Infrastructure adapters implementing the domain ports.
//!
//! The simulated adapters stand in for the physical discovery layer, device
//! programmers, and the inter-controller link; they drive the engine in the
//! daemon's simulation mode and in tests.

pub mod discovery;
pub mod events;
pub mod images;
pub mod programmer;
pub mod transport;

pub use discovery::{SimulatedDiscovery, SimulatedDiscoveryHandle};
pub use events::{InMemoryEventCollector, LoggingEventSink};
pub use images::InMemoryImageRepository;
pub use programmer::{ProgrammerScript, SimulatedProgrammer};
pub use transport::{loopback_pair, LoopbackTransport};
