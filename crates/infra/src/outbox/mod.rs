//! Transactional outbox.
//!
//! Services never publish to the bus directly. Inside the transaction that
//! performs a mutation they call [`OutboxWriter::emit_event`], which stores
//! the event in `__events_outbox`. The [`OutboxDrainer`] later publishes rows
//! in id order, one `(topic, key)` head at a time, so per-key publication
//! order equals commit order.
//!
//! A row that keeps failing is retried with exponential backoff until its
//! tries are exhausted; it is then marked failed, logged at `error`, and
//! blocks its `(topic, key)` until an operator requeues it.

mod drainer;
mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use mds_core::Result;

use crate::db::Transactional;

pub use drainer::{OutboxDrainer, OutboxDrainerConfig};
pub use memory::{HasOutbox, OutboxTable};

/// Tries a new outbox row starts with.
pub const DEFAULT_OUTBOX_TRIES: i32 = 8;

/// An event to be published once the surrounding transaction commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub topic: String,
    pub key: String,
    pub event_type: String,
    pub payload: JsonValue,
}

impl OutboxEvent {
    pub fn new(
        topic: impl Into<String>,
        key: impl Into<String>,
        event_type: impl Into<String>,
        payload: JsonValue,
    ) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            event_type: event_type.into(),
            payload,
        }
    }
}

/// A stored outbox row.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    pub id: i64,
    pub created: DateTime<Utc>,
    pub event: OutboxEvent,
    pub remaining_tries: i32,
    pub retry_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub failed: bool,
    pub last_error: Option<String>,
}

impl OutboxRecord {
    pub fn is_pending(&self) -> bool {
        self.published_at.is_none()
    }
}

/// Write side of the outbox; callable only within a transaction.
#[async_trait]
pub trait OutboxWriter: Transactional {
    async fn emit_event(&self, tx: &mut Self::Tx, event: OutboxEvent) -> Result<()>;
}

/// Drainer side of the outbox.
#[async_trait]
pub trait OutboxStore: Transactional {
    /// Lock the oldest publishable row: the head of its `(topic, key)`, not
    /// failed, and due. Rows locked by other drainers are skipped.
    async fn claim_next_outbox_record(
        &self,
        tx: &mut Self::Tx,
        now: DateTime<Utc>,
    ) -> Result<Option<OutboxRecord>>;

    async fn mark_outbox_published(&self, tx: &mut Self::Tx, id: i64, now: DateTime<Utc>) -> Result<()>;

    /// Record a failed publication: one try is consumed; with no tries left the
    /// row is marked failed, otherwise it becomes due again at `retry_at`.
    async fn record_outbox_failure(
        &self,
        tx: &mut Self::Tx,
        id: i64,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<OutboxRecord>;

    /// Give every failed row `tries` new tries. Returns the number of rows requeued.
    async fn requeue_failed_outbox(&self, tx: &mut Self::Tx, tries: i32) -> Result<u64>;
}
