//! Domain event plumbing: the `Event` contract and a pub/sub bus.
//!
//! The movement engine publishes stock events (movement recorded, low stock
//! detected) here after its transaction commits. Notification delivery lives
//! behind subscribers and is not part of this workspace.

pub mod bus;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
