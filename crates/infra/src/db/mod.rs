//! Unit-of-work discipline.
//!
//! Every mutation of service state, and every emission of an outbound event,
//! happens inside [`run_in_tx`]. The work itself follows the caller's
//! cancellation; the commit does not. Once the work has succeeded the commit
//! runs detached from the caller, bounded only by [`COMMIT_TIMEOUT`], so a
//! cancelled request can never leave the outcome of a finished transaction
//! ambiguous.
//!
//! Two databases implement [`Transactional`]:
//! - [`PgDatabase`]: Postgres via sqlx
//! - [`MemDatabase`]: an in-process state guarded by a single lock (tests, dev)
//!
//! Dropping an unfinished transaction rolls it back in both implementations.

mod memory;
mod postgres;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use mds_core::{Error, Result};

pub use memory::{MemDatabase, MemTx};
pub use postgres::{is_unique_violation, map_sqlx_error, PgDatabase, PgTx};

/// Upper bound for a detached commit.
pub const COMMIT_TIMEOUT: Duration = Duration::from_secs(10);

/// A database that hands out transactions.
///
/// Implementations are cheap to clone (a pool handle or a shared pointer); the
/// clone is what the detached commit task carries.
#[async_trait]
pub trait Transactional: Clone + Send + Sync + 'static {
    type Tx: Send + 'static;

    async fn begin(&self) -> Result<Self::Tx>;

    async fn commit(&self, tx: Self::Tx) -> Result<()>;

    async fn rollback(&self, tx: Self::Tx) -> Result<()>;

    /// Mark a point inside `tx` that [`Self::rollback_to_savepoint`] returns to.
    async fn savepoint(&self, tx: &mut Self::Tx, name: &'static str) -> Result<()>;

    /// Discard everything `tx` did since `name`. The savepoint stays open and
    /// the transaction is usable again.
    async fn rollback_to_savepoint(&self, tx: &mut Self::Tx, name: &'static str) -> Result<()>;

    async fn release_savepoint(&self, tx: &mut Self::Tx, name: &'static str) -> Result<()>;
}

/// Run `work` inside a fresh transaction.
///
/// `work` receives the transaction by value and hands it back together with its
/// outcome:
///
/// ```ignore
/// let ops = run_in_tx(&cancel, &db, |mut tx| async move {
///     let out = store.delete_user(&mut tx, id).await;
///     (tx, out)
/// })
/// .await?;
/// ```
///
/// - `work` fails: the transaction is rolled back (still under `parent`) and
///   the work's error is returned, with the rollback error attached if any.
/// - `parent` is cancelled before commit: the transaction is dropped (rolled
///   back) and `Internal` is returned.
/// - `work` succeeds: commit runs in its own task with [`COMMIT_TIMEOUT`] and
///   is not affected by `parent`. A failed or timed-out commit is rolled back
///   and reported as `Internal`.
pub async fn run_in_tx<D, T, F, Fut>(parent: &CancellationToken, db: &D, work: F) -> Result<T>
where
    D: Transactional,
    F: FnOnce(D::Tx) -> Fut,
    Fut: Future<Output = (D::Tx, Result<T>)>,
{
    let tx = tokio::select! {
        biased;
        _ = parent.cancelled() => return Err(Error::internal("transaction cancelled before begin")),
        tx = db.begin() => tx?,
    };

    let (tx, outcome) = tokio::select! {
        biased;
        _ = parent.cancelled() => return Err(Error::internal("transaction cancelled")),
        out = work(tx) => out,
    };

    let value = match outcome {
        Ok(value) => value,
        Err(err) => {
            let rolled_back = tokio::select! {
                biased;
                _ = parent.cancelled() => Err(Error::internal("rollback cancelled")),
                res = db.rollback(tx) => res,
            };
            return Err(match rolled_back {
                Ok(()) => err,
                Err(rb) => {
                    warn!(error = %rb, "rollback failed");
                    err.with_detail(format!("rollback failed: {rb}"))
                }
            });
        }
    };

    let db = db.clone();
    let commit = tokio::spawn(async move {
        // On error or timeout the transaction has been consumed or dropped,
        // which rolls it back.
        match tokio::time::timeout(COMMIT_TIMEOUT, db.commit(tx)).await {
            Ok(res) => res,
            Err(_) => Err(Error::internal(format!(
                "commit timed out after {}ms",
                COMMIT_TIMEOUT.as_millis()
            ))),
        }
    });

    match commit.await {
        Ok(Ok(())) => {
            debug!("transaction committed");
            Ok(value)
        }
        Ok(Err(err)) => {
            warn!(error = %err, "commit failed");
            Err(Error::internal("commit failed").with_detail(err.to_string()))
        }
        Err(join) => Err(Error::internal(format!("commit task failed: {join}"))),
    }
}
