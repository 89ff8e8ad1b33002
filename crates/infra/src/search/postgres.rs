use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::FromRow;

use mds_core::Result;

use super::{
    NewSearchAction, SearchAction, SearchActionQueue, SearchActionStore, DEFAULT_RETRY_COOLDOWN,
    DEFAULT_SEARCH_TRIES,
};
use crate::db::{map_sqlx_error, PgDatabase, PgTx};

#[derive(Debug, FromRow)]
struct SearchActionRow {
    id: i64,
    created: DateTime<Utc>,
    index_name: String,
    document_id: Option<String>,
    action_type: String,
    options: JsonValue,
    remaining_tries: i32,
    retry_cooldown_ms: i64,
    processing_ts: Option<DateTime<Utc>>,
    err_message: Option<String>,
}

impl TryFrom<SearchActionRow> for SearchAction {
    type Error = mds_core::Error;

    fn try_from(row: SearchActionRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            created: row.created,
            index: row.index_name,
            document_id: row.document_id,
            action_type: row.action_type.parse()?,
            options: row.options,
            remaining_tries: row.remaining_tries,
            retry_cooldown: Duration::from_millis(row.retry_cooldown_ms.max(0) as u64),
            processing_ts: row.processing_ts,
            err_message: row.err_message,
        })
    }
}

const ACTION_COLUMNS: &str = "id, created, index_name, document_id, action_type, options, \
     remaining_tries, retry_cooldown_ms, processing_ts, err_message";

#[async_trait]
impl SearchActionQueue for PgDatabase {
    async fn enqueue_search_action(&self, tx: &mut PgTx, action: NewSearchAction) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO __search_actions
                (index_name, document_id, action_type, options, remaining_tries, retry_cooldown_ms)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&action.index)
        .bind(&action.document_id)
        .bind(action.action_type.as_str())
        .bind(&action.options)
        .bind(DEFAULT_SEARCH_TRIES)
        .bind(DEFAULT_RETRY_COOLDOWN.as_millis() as i64)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("enqueue_search_action", e))?;
        Ok(())
    }
}

#[async_trait]
impl SearchActionStore for PgDatabase {
    async fn claim_next_search_action(
        &self,
        tx: &mut PgTx,
        now: DateTime<Utc>,
    ) -> Result<Option<SearchAction>> {
        let sql = format!(
            r#"
            SELECT {ACTION_COLUMNS}
            FROM __search_actions a
            WHERE a.id IN (
                SELECT MIN(h.id) FROM __search_actions h
                WHERE h.remaining_tries > 0
                GROUP BY h.index_name, h.document_id
            )
              AND (a.processing_ts IS NULL
                   OR a.processing_ts + a.retry_cooldown_ms * INTERVAL '1 millisecond' < $1)
            ORDER BY a.id
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#
        );
        let row = sqlx::query_as::<_, SearchActionRow>(&sql)
            .bind(now)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("claim_search_action", e))?;
        row.map(SearchAction::try_from).transpose()
    }

    async fn complete_search_action(&self, tx: &mut PgTx, id: i64, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE __search_actions SET remaining_tries = 0, processing_ts = $2, err_message = NULL WHERE id = $1",
        )
        .bind(id)
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("complete_search_action", e))?;
        Ok(())
    }

    async fn fail_search_action(
        &self,
        tx: &mut PgTx,
        id: i64,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<SearchAction> {
        let sql = format!(
            r#"
            UPDATE __search_actions
            SET remaining_tries = GREATEST(remaining_tries - 1, 0),
                processing_ts = $3,
                err_message = $2
            WHERE id = $1
            RETURNING {ACTION_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, SearchActionRow>(&sql)
            .bind(id)
            .bind(error)
            .bind(now)
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("fail_search_action", e))?;
        row.try_into()
    }
}
