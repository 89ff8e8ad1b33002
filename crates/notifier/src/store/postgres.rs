use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use tracing::instrument;
use uuid::Uuid;

use mds_core::{
    ActiveIntelDelivery, ActiveIntelDeliveryAttempt, AddressBookEntryId, Error, Intel, IntelDeliveryAttemptId,
    IntelDeliveryId, IntelId, OpenIntelDeliverySummary, Operation, OperationId, Result, User, UserId,
};
use mds_infra::db::map_sqlx_error;
use mds_infra::{PgDatabase, PgTx};

use super::NotifierStore;

#[derive(Debug, FromRow)]
struct OpenDeliveryRow {
    delivery_id: Uuid,
    delivery_to: Uuid,
    delivery_note: Option<String>,
    intel_id: Uuid,
    intel_created_at: DateTime<Utc>,
    intel_created_by: Uuid,
    intel_operation: Uuid,
    intel_importance: i32,
    intel_is_valid: bool,
}

impl From<OpenDeliveryRow> for OpenIntelDeliverySummary {
    fn from(row: OpenDeliveryRow) -> Self {
        Self {
            delivery: ActiveIntelDelivery {
                id: IntelDeliveryId::from_uuid(row.delivery_id),
                intel: IntelId::from_uuid(row.intel_id),
                to: AddressBookEntryId::from_uuid(row.delivery_to),
                note: row.delivery_note,
            },
            intel: Intel {
                id: IntelId::from_uuid(row.intel_id),
                created_at: row.intel_created_at,
                created_by: UserId::from_uuid(row.intel_created_by),
                operation: OperationId::from_uuid(row.intel_operation),
                importance: row.intel_importance,
                is_valid: row.intel_is_valid,
            },
        }
    }
}

fn operation_or_not_found(row: Option<Uuid>, what: String) -> Result<OperationId> {
    row.map(OperationId::from_uuid)
        .ok_or_else(|| Error::not_found(what))
}

#[async_trait]
impl NotifierStore for PgDatabase {
    #[instrument(skip(self, tx, user), fields(user = %user.id), err)]
    async fn create_user(&self, tx: &mut PgTx, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, username, first_name, last_name, is_admin)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(*user.id.as_uuid())
        .bind(&user.username)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(user.is_admin)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("create_user", e))?;
        Ok(())
    }

    #[instrument(skip(self, tx, user), fields(user = %user.id), err)]
    async fn update_user(&self, tx: &mut PgTx, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, username, first_name, last_name, is_admin)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
            SET username = EXCLUDED.username,
                first_name = EXCLUDED.first_name,
                last_name = EXCLUDED.last_name,
                is_admin = EXCLUDED.is_admin
            "#,
        )
        .bind(*user.id.as_uuid())
        .bind(&user.username)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(user.is_admin)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("update_user", e))?;
        Ok(())
    }

    #[instrument(skip(self, tx), err)]
    async fn delete_user(&self, tx: &mut PgTx, id: UserId) -> Result<()> {
        sqlx::query(r#"DELETE FROM operation_members WHERE "user" = $1"#)
            .bind(*id.as_uuid())
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("delete_user_memberships", e))?;
        sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(*id.as_uuid())
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("delete_user", e))?;
        Ok(())
    }

    #[instrument(skip(self, tx, operation), fields(operation = %operation.id), err)]
    async fn create_operation(&self, tx: &mut PgTx, operation: &Operation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO operations (id, title, description, start_ts, end_ts, is_archived)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(*operation.id.as_uuid())
        .bind(&operation.title)
        .bind(&operation.description)
        .bind(operation.start)
        .bind(operation.end)
        .bind(operation.is_archived)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("create_operation", e))?;
        Ok(())
    }

    #[instrument(skip(self, tx, operation), fields(operation = %operation.id), err)]
    async fn update_operation(&self, tx: &mut PgTx, operation: &Operation) -> Result<()> {
        let done = sqlx::query(
            r#"
            UPDATE operations
            SET title = $2, description = $3, start_ts = $4, end_ts = $5, is_archived = $6
            WHERE id = $1
            "#,
        )
        .bind(*operation.id.as_uuid())
        .bind(&operation.title)
        .bind(&operation.description)
        .bind(operation.start)
        .bind(operation.end)
        .bind(operation.is_archived)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("update_operation", e))?;
        if done.rows_affected() == 0 {
            return Err(Error::not_found(format!("operation {}", operation.id)));
        }
        Ok(())
    }

    #[instrument(skip(self, tx, members), fields(count = members.len()), err)]
    async fn update_operation_members(&self, tx: &mut PgTx, operation: OperationId, members: &[UserId]) -> Result<()> {
        sqlx::query("DELETE FROM operation_members WHERE operation = $1")
            .bind(*operation.as_uuid())
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("clear_operation_members", e))?;

        let users: Vec<Uuid> = members.iter().map(|m| *m.as_uuid()).collect();
        sqlx::query(
            r#"
            INSERT INTO operation_members (operation, "user")
            SELECT $1, u FROM UNNEST($2::uuid[]) AS u
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(*operation.as_uuid())
        .bind(&users)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_operation_members", e))?;
        Ok(())
    }

    #[instrument(skip(self, tx, intel), fields(intel = %intel.id), err)]
    async fn create_intel(&self, tx: &mut PgTx, intel: &Intel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO intel (id, created_at, created_by, operation, importance, is_valid)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(*intel.id.as_uuid())
        .bind(intel.created_at)
        .bind(*intel.created_by.as_uuid())
        .bind(*intel.operation.as_uuid())
        .bind(intel.importance)
        .bind(intel.is_valid)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("create_intel", e))?;
        Ok(())
    }

    #[instrument(skip(self, tx), err)]
    async fn invalidate_intel(&self, tx: &mut PgTx, id: IntelId) -> Result<()> {
        let done = sqlx::query("UPDATE intel SET is_valid = FALSE WHERE id = $1")
            .bind(*id.as_uuid())
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("invalidate_intel", e))?;
        if done.rows_affected() == 0 {
            return Err(Error::not_found(format!("intel {id}")));
        }
        Ok(())
    }

    #[instrument(skip(self, tx, delivery), fields(delivery = %delivery.id), err)]
    async fn create_active_delivery(&self, tx: &mut PgTx, delivery: &ActiveIntelDelivery) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO active_intel_deliveries (id, intel, "to", note)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(*delivery.id.as_uuid())
        .bind(*delivery.intel.as_uuid())
        .bind(*delivery.to.as_uuid())
        .bind(&delivery.note)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("create_active_delivery", e))?;
        Ok(())
    }

    #[instrument(skip(self, tx), err)]
    async fn delete_active_delivery(&self, tx: &mut PgTx, id: IntelDeliveryId) -> Result<()> {
        let done = sqlx::query("DELETE FROM active_intel_deliveries WHERE id = $1")
            .bind(*id.as_uuid())
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("delete_active_delivery", e))?;
        if done.rows_affected() == 0 {
            return Err(Error::not_found(format!("active intel delivery {id}")));
        }
        Ok(())
    }

    #[instrument(skip(self, tx, attempt), fields(attempt = %attempt.id), err)]
    async fn create_active_attempt(&self, tx: &mut PgTx, attempt: &ActiveIntelDeliveryAttempt) -> Result<()> {
        // Inserting only if the parent exists keeps the transaction usable
        // (a foreign key violation would abort it).
        let parent: Option<Uuid> = sqlx::query_scalar("SELECT id FROM active_intel_deliveries WHERE id = $1")
            .bind(*attempt.delivery.as_uuid())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("load_attempt_parent", e))?;
        if parent.is_none() {
            return Err(Error::not_found(format!("active intel delivery {}", attempt.delivery)));
        }

        sqlx::query(
            r#"
            INSERT INTO active_intel_delivery_attempts (id, delivery)
            VALUES ($1, $2)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(*attempt.id.as_uuid())
        .bind(*attempt.delivery.as_uuid())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("create_active_attempt", e))?;
        Ok(())
    }

    #[instrument(skip(self, tx), err)]
    async fn delete_active_attempt(&self, tx: &mut PgTx, id: IntelDeliveryAttemptId) -> Result<()> {
        let done = sqlx::query("DELETE FROM active_intel_delivery_attempts WHERE id = $1")
            .bind(*id.as_uuid())
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("delete_active_attempt", e))?;
        if done.rows_affected() == 0 {
            return Err(Error::not_found(format!("active intel delivery attempt {id}")));
        }
        Ok(())
    }

    #[instrument(skip(self, tx), err)]
    async fn set_auto_intel_delivery_enabled(&self, tx: &mut PgTx, entry: AddressBookEntryId, enabled: bool) -> Result<()> {
        let sql = if enabled {
            "INSERT INTO auto_intel_delivery_address_book_entries (entry) VALUES ($1) ON CONFLICT DO NOTHING"
        } else {
            "DELETE FROM auto_intel_delivery_address_book_entries WHERE entry = $1"
        };
        sqlx::query(sql)
            .bind(*entry.as_uuid())
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("set_auto_intel_delivery_enabled", e))?;
        Ok(())
    }

    #[instrument(skip(self, tx), err)]
    async fn open_deliveries_by_operation(&self, tx: &mut PgTx, operation: OperationId) -> Result<Vec<OpenIntelDeliverySummary>> {
        let rows = sqlx::query_as::<_, OpenDeliveryRow>(
            r#"
            SELECT d.id         AS delivery_id,
                   d."to"       AS delivery_to,
                   d.note       AS delivery_note,
                   i.id         AS intel_id,
                   i.created_at AS intel_created_at,
                   i.created_by AS intel_created_by,
                   i.operation  AS intel_operation,
                   i.importance AS intel_importance,
                   i.is_valid   AS intel_is_valid
            FROM active_intel_deliveries d
            JOIN intel i ON i.id = d.intel
            WHERE i.operation = $1
              AND NOT EXISTS (
                  SELECT 1 FROM active_intel_delivery_attempts a WHERE a.delivery = d.id
              )
              AND NOT EXISTS (
                  SELECT 1 FROM auto_intel_delivery_address_book_entries e WHERE e.entry = d."to"
              )
            ORDER BY i.importance DESC, i.created_at, d.id
            "#,
        )
        .bind(*operation.as_uuid())
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("open_deliveries_by_operation", e))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn intel_operation(&self, tx: &mut PgTx, intel: IntelId) -> Result<OperationId> {
        let row: Option<Uuid> = sqlx::query_scalar("SELECT operation FROM intel WHERE id = $1")
            .bind(*intel.as_uuid())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("intel_operation", e))?;
        operation_or_not_found(row, format!("intel {intel}"))
    }

    async fn intel_operation_by_delivery(&self, tx: &mut PgTx, delivery: IntelDeliveryId) -> Result<OperationId> {
        let row: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT i.operation
            FROM active_intel_deliveries d
            JOIN intel i ON i.id = d.intel
            WHERE d.id = $1
            "#,
        )
        .bind(*delivery.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("intel_operation_by_delivery", e))?;
        operation_or_not_found(row, format!("operation of active intel delivery {delivery}"))
    }

    async fn intel_operation_by_attempt(&self, tx: &mut PgTx, attempt: IntelDeliveryAttemptId) -> Result<OperationId> {
        let row: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT i.operation
            FROM active_intel_delivery_attempts a
            JOIN active_intel_deliveries d ON d.id = a.delivery
            JOIN intel i ON i.id = d.intel
            WHERE a.id = $1
            "#,
        )
        .bind(*attempt.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("intel_operation_by_attempt", e))?;
        operation_or_not_found(row, format!("operation of active intel delivery attempt {attempt}"))
    }

    async fn operations_with_deliveries_to(&self, tx: &mut PgTx, entry: AddressBookEntryId) -> Result<Vec<OperationId>> {
        let rows: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT i.operation
            FROM active_intel_deliveries d
            JOIN intel i ON i.id = d.intel
            WHERE d."to" = $1
            ORDER BY i.operation
            "#,
        )
        .bind(*entry.as_uuid())
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("operations_with_deliveries_to", e))?;
        Ok(rows.into_iter().map(OperationId::from_uuid).collect())
    }
}
