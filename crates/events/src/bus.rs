//! Event bus abstraction (mechanics only).
//!
//! The bus is a Kafka-like log of topics. Services read it through a named
//! consumer group and write to it only through the transactional outbox.
//!
//! ## Delivery Guarantees
//!
//! - **At-least-once**: a message is redelivered until its offset is committed
//! - **Per-topic order**: messages of one topic are delivered in append order
//! - **No cross-topic order**: consumers must tolerate e.g. a delivery arriving
//!   before the intel it references
//!
//! Consumers must be idempotent - processing the same message multiple times
//! has to produce the same final state.

use async_trait::async_trait;

use mds_core::Result;

/// Opaque position of a message inside its topic (stream id, partition offset, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageOffset(pub String);

impl core::fmt::Display for MessageOffset {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A raw message read from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub key: String,
    /// JSON text of an [`crate::EventEnvelope`].
    pub value: String,
    pub offset: MessageOffset,
}

/// Consumer-group side of the bus.
///
/// ## Usage Pattern
///
/// ```ignore
/// loop {
///     for message in consumer.poll(16).await? {
///         match handle(&message).await {
///             Ok(()) => consumer.commit(&message).await?,
///             Err(_) => { consumer.rewind().await; break; }
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait BusConsumer: Send + Sync {
    /// Fetch up to `max` messages. Blocks for a short, implementation-defined
    /// time when nothing is available and then returns an empty batch.
    async fn poll(&self, max: usize) -> Result<Vec<BusMessage>>;

    /// Mark `message` (and everything before it in its topic) as processed.
    async fn commit(&self, message: &BusMessage) -> Result<()>;

    /// Forget everything fetched but not committed; the next poll starts again
    /// at the first uncommitted message of each topic.
    async fn rewind(&self);
}

/// Producer side of the bus.
#[async_trait]
pub trait BusPublisher: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, value: &str) -> Result<()>;
}

/// Topic administration used by the ready probe.
#[async_trait]
pub trait TopicAdmin: Send + Sync {
    /// Returns whether every topic in `topics` exists.
    async fn topics_exist(&self, topics: &[&str]) -> Result<bool>;
}
