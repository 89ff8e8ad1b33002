use std::time::Duration;

use async_trait::async_trait;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::instrument;

use mds_core::{Error, Result};

use super::Transactional;

pub type PgTx = Transaction<'static, Postgres>;

/// Postgres connection pool.
#[derive(Debug, Clone)]
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    #[instrument(skip(url), err)]
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded migrations of a service.
    #[instrument(skip_all, err)]
    pub async fn migrate(&self, migrator: &Migrator) -> Result<()> {
        migrator
            .run(&self.pool)
            .await
            .map_err(|e| Error::internal(format!("migrations failed: {e}")))
    }

    /// Round-trip to the database.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ping", e))?;
        Ok(())
    }
}

#[async_trait]
impl Transactional for PgDatabase {
    type Tx = PgTx;

    async fn begin(&self) -> Result<PgTx> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    async fn commit(&self, tx: PgTx) -> Result<()> {
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(&self, tx: PgTx) -> Result<()> {
        tx.rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback_transaction", e))
    }

    async fn savepoint(&self, tx: &mut PgTx, name: &'static str) -> Result<()> {
        sqlx::query(&format!("SAVEPOINT {name}"))
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("savepoint", e))?;
        Ok(())
    }

    async fn rollback_to_savepoint(&self, tx: &mut PgTx, name: &'static str) -> Result<()> {
        sqlx::query(&format!("ROLLBACK TO SAVEPOINT {name}"))
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("rollback_to_savepoint", e))?;
        Ok(())
    }

    async fn release_savepoint(&self, tx: &mut PgTx, name: &'static str) -> Result<()> {
        sqlx::query(&format!("RELEASE SAVEPOINT {name}"))
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("release_savepoint", e))?;
        Ok(())
    }
}

/// Map sqlx errors to the service error taxonomy.
pub fn map_sqlx_error(operation: &str, err: sqlx::Error) -> Error {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // foreign key violation
                Some("23503") => Error::not_found(msg),
                // invalid text representation / check violation
                Some("22P02") | Some("23514") => Error::bad_input(msg),
                _ => Error::internal(msg),
            }
        }
        sqlx::Error::RowNotFound => Error::not_found(format!("row not found in {operation}")),
        sqlx::Error::PoolClosed => Error::internal(format!("connection pool closed in {operation}")),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            Error::fatal(format!("row decode failed in {operation}: {err}"))
        }
        _ => Error::internal(format!("sqlx error in {operation}: {err}")),
    }
}

/// Check if an error is a unique constraint violation.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use mds_core::ErrorKind;

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = map_sqlx_error("load", sqlx::Error::RowNotFound);
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn pool_closed_is_transient() {
        let err = map_sqlx_error("load", sqlx::Error::PoolClosed);
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
