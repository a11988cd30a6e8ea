//! Domain events and their distribution.
//!
//! Domain crates define typed event enums implementing [`Event`]; the
//! infrastructure layer wraps them in an [`EventEnvelope`] and publishes them on
//! an [`EventBus`] after the write that produced them has committed.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
