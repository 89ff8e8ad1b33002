//! Bus messages and event payloads exchanged between the services.
//!
//! - `bus`: transport-agnostic consumer/publisher contracts
//! - `envelope`: the `{ "type", "payload" }` wire envelope
//! - `inbound`: events consumed by the open-intel-delivery notifier
//! - `outbound`: events published by the group service
//! - `in_memory_bus`: a bus for tests and local development

pub mod bus;
pub mod envelope;
pub mod in_memory_bus;
pub mod inbound;
pub mod outbound;
pub mod topics;

pub use bus::{BusConsumer, BusMessage, BusPublisher, MessageOffset, TopicAdmin};
pub use envelope::EventEnvelope;
pub use in_memory_bus::{InMemoryBus, InMemoryConsumer};
pub use inbound::InboundEvent;
pub use outbound::{GroupDeleted, GroupEvent};
