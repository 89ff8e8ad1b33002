use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::FromRow;
use tracing::instrument;

use mds_core::Result;

use super::{OutboxEvent, OutboxRecord, OutboxStore, OutboxWriter, DEFAULT_OUTBOX_TRIES};
use crate::db::{map_sqlx_error, PgDatabase, PgTx};

#[derive(Debug, FromRow)]
struct OutboxRow {
    id: i64,
    created: DateTime<Utc>,
    topic: String,
    key: String,
    event_type: String,
    payload: JsonValue,
    remaining_tries: i32,
    retry_at: DateTime<Utc>,
    published_at: Option<DateTime<Utc>>,
    failed: bool,
    last_error: Option<String>,
}

impl From<OutboxRow> for OutboxRecord {
    fn from(row: OutboxRow) -> Self {
        Self {
            id: row.id,
            created: row.created,
            event: OutboxEvent {
                topic: row.topic,
                key: row.key,
                event_type: row.event_type,
                payload: row.payload,
            },
            remaining_tries: row.remaining_tries,
            retry_at: row.retry_at,
            published_at: row.published_at,
            failed: row.failed,
            last_error: row.last_error,
        }
    }
}

const OUTBOX_COLUMNS: &str =
    "id, created, topic, key, event_type, payload, remaining_tries, retry_at, published_at, failed, last_error";

#[async_trait]
impl OutboxWriter for PgDatabase {
    #[instrument(skip(self, tx, event), fields(topic = %event.topic, key = %event.key, event_type = %event.event_type), err)]
    async fn emit_event(&self, tx: &mut PgTx, event: OutboxEvent) -> Result<()> {
        // Serializes writers of one (topic, key) so id order matches commit order.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1 || '/' || $2, 0))")
            .bind(&event.topic)
            .bind(&event.key)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("lock_outbox_key", e))?;

        sqlx::query(
            r#"
            INSERT INTO __events_outbox (topic, key, event_type, payload, remaining_tries)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&event.topic)
        .bind(&event.key)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(DEFAULT_OUTBOX_TRIES)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_outbox_event", e))?;
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PgDatabase {
    async fn claim_next_outbox_record(
        &self,
        tx: &mut PgTx,
        now: DateTime<Utc>,
    ) -> Result<Option<OutboxRecord>> {
        let sql = format!(
            r#"
            SELECT {OUTBOX_COLUMNS}
            FROM __events_outbox o
            WHERE o.published_at IS NULL
              AND NOT o.failed
              AND o.retry_at <= $1
              AND o.id = (
                  SELECT MIN(h.id) FROM __events_outbox h
                  WHERE h.topic = o.topic AND h.key = o.key AND h.published_at IS NULL
              )
            ORDER BY o.id
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#
        );
        let row = sqlx::query_as::<_, OutboxRow>(&sql)
            .bind(now)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("claim_outbox_record", e))?;
        Ok(row.map(Into::into))
    }

    async fn mark_outbox_published(&self, tx: &mut PgTx, id: i64, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE __events_outbox SET published_at = $2, last_error = NULL WHERE id = $1")
            .bind(id)
            .bind(now)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("mark_outbox_published", e))?;
        Ok(())
    }

    async fn record_outbox_failure(
        &self,
        tx: &mut PgTx,
        id: i64,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<OutboxRecord> {
        let sql = format!(
            r#"
            UPDATE __events_outbox
            SET remaining_tries = GREATEST(remaining_tries - 1, 0),
                failed = remaining_tries <= 1,
                last_error = $2,
                retry_at = $3
            WHERE id = $1
            RETURNING {OUTBOX_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, OutboxRow>(&sql)
            .bind(id)
            .bind(error)
            .bind(retry_at)
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("record_outbox_failure", e))?;
        Ok(row.into())
    }

    async fn requeue_failed_outbox(&self, tx: &mut PgTx, tries: i32) -> Result<u64> {
        let done = sqlx::query(
            "UPDATE __events_outbox SET failed = FALSE, remaining_tries = $1, retry_at = now() WHERE failed",
        )
        .bind(tries)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("requeue_failed_outbox", e))?;
        Ok(done.rows_affected())
    }
}
