use async_trait::async_trait;
use chrono::{DateTime, Utc};

use mds_core::{Error, Result};

use super::{OutboxEvent, OutboxRecord, OutboxStore, OutboxWriter, DEFAULT_OUTBOX_TRIES};
use crate::db::{MemDatabase, MemTx};

/// In-memory `__events_outbox`.
#[derive(Debug, Clone, Default)]
pub struct OutboxTable {
    next_id: i64,
    records: Vec<OutboxRecord>,
}

impl OutboxTable {
    pub fn records(&self) -> &[OutboxRecord] {
        &self.records
    }

    pub fn pending(&self) -> impl Iterator<Item = &OutboxRecord> {
        self.records.iter().filter(|r| r.is_pending())
    }

    fn get_mut(&mut self, id: i64) -> Result<&mut OutboxRecord> {
        self.records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::not_found(format!("outbox record {id}")))
    }

    fn push(&mut self, event: OutboxEvent, now: DateTime<Utc>) {
        self.next_id += 1;
        self.records.push(OutboxRecord {
            id: self.next_id,
            created: now,
            event,
            remaining_tries: DEFAULT_OUTBOX_TRIES,
            retry_at: now,
            published_at: None,
            failed: false,
            last_error: None,
        });
    }

    fn is_head(&self, record: &OutboxRecord) -> bool {
        !self.records.iter().any(|r| {
            r.id < record.id
                && r.is_pending()
                && r.event.topic == record.event.topic
                && r.event.key == record.event.key
        })
    }
}

/// State types that carry an outbox table.
pub trait HasOutbox {
    fn outbox(&self) -> &OutboxTable;
    fn outbox_mut(&mut self) -> &mut OutboxTable;
}

impl HasOutbox for OutboxTable {
    fn outbox(&self) -> &OutboxTable {
        self
    }

    fn outbox_mut(&mut self) -> &mut OutboxTable {
        self
    }
}

#[async_trait]
impl<S> OutboxWriter for MemDatabase<S>
where
    S: HasOutbox + Clone + Send + Sync + 'static,
{
    async fn emit_event(&self, tx: &mut MemTx<S>, event: OutboxEvent) -> Result<()> {
        tx.outbox_mut().push(event, Utc::now());
        Ok(())
    }
}

#[async_trait]
impl<S> OutboxStore for MemDatabase<S>
where
    S: HasOutbox + Clone + Send + Sync + 'static,
{
    async fn claim_next_outbox_record(
        &self,
        tx: &mut MemTx<S>,
        now: DateTime<Utc>,
    ) -> Result<Option<OutboxRecord>> {
        let table = tx.outbox();
        Ok(table
            .records
            .iter()
            .filter(|r| r.is_pending() && !r.failed && r.retry_at <= now)
            .find(|r| table.is_head(r))
            .cloned())
    }

    async fn mark_outbox_published(&self, tx: &mut MemTx<S>, id: i64, now: DateTime<Utc>) -> Result<()> {
        tx.outbox_mut().get_mut(id)?.published_at = Some(now);
        Ok(())
    }

    async fn record_outbox_failure(
        &self,
        tx: &mut MemTx<S>,
        id: i64,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<OutboxRecord> {
        let record = tx.outbox_mut().get_mut(id)?;
        record.remaining_tries = (record.remaining_tries - 1).max(0);
        record.last_error = Some(error.to_string());
        record.retry_at = retry_at;
        record.failed = record.remaining_tries == 0;
        Ok(record.clone())
    }

    async fn requeue_failed_outbox(&self, tx: &mut MemTx<S>, tries: i32) -> Result<u64> {
        let mut n = 0;
        for record in tx.outbox_mut().records.iter_mut().filter(|r| r.failed) {
            record.failed = false;
            record.remaining_tries = tries;
            record.retry_at = Utc::now();
            n += 1;
        }
        Ok(n)
    }
}
