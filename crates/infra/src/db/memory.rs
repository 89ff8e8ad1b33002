use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use mds_core::{Error, Result};

use super::Transactional;

/// In-process database over a cloneable state `S`.
///
/// Transactions are fully serialized: `begin` takes the state lock and works
/// on a copy; `commit` swaps the copy in, `rollback` (or drop) discards it.
/// Nested transactions on the same database deadlock; savepoints keep a
/// copy of the working state instead.
#[derive(Debug)]
pub struct MemDatabase<S> {
    state: Arc<Mutex<S>>,
    faults: Arc<Faults>,
}

#[derive(Debug, Default)]
struct Faults {
    failing_commits: AtomicUsize,
    commit_delay_ms: AtomicU64,
}

impl<S> Clone for MemDatabase<S> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            faults: self.faults.clone(),
        }
    }
}

impl<S: Clone + Send + 'static> MemDatabase<S> {
    pub fn new(state: S) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            faults: Arc::new(Faults::default()),
        }
    }

    /// Copy of the last committed state.
    pub async fn snapshot(&self) -> S {
        self.state.lock().await.clone()
    }

    /// Make the next `n` commits fail with `Internal` (the transaction is rolled back).
    pub fn fail_next_commits(&self, n: usize) {
        self.faults.failing_commits.store(n, Ordering::SeqCst);
    }

    /// Delay every commit by `delay`.
    pub fn delay_commits(&self, delay: Duration) {
        self.faults
            .commit_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

impl<S: Clone + Send + Sync + Default + 'static> Default for MemDatabase<S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

/// Open transaction on a [`MemDatabase`]; dereferences to the working copy.
pub struct MemTx<S> {
    guard: OwnedMutexGuard<S>,
    work: S,
    savepoints: Vec<(&'static str, S)>,
}

impl<S> Deref for MemTx<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.work
    }
}

impl<S> DerefMut for MemTx<S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.work
    }
}

#[async_trait]
impl<S: Clone + Send + Sync + 'static> Transactional for MemDatabase<S> {
    type Tx = MemTx<S>;

    async fn begin(&self) -> Result<Self::Tx> {
        let guard = self.state.clone().lock_owned().await;
        let work = guard.clone();
        Ok(MemTx {
            guard,
            work,
            savepoints: Vec::new(),
        })
    }

    async fn commit(&self, tx: Self::Tx) -> Result<()> {
        let delay = self.faults.commit_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let failing = self
            .faults
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(Error::internal("commit failed (injected)"));
        }

        let MemTx { mut guard, work, .. } = tx;
        *guard = work;
        Ok(())
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<()> {
        drop(tx);
        Ok(())
    }

    async fn savepoint(&self, tx: &mut Self::Tx, name: &'static str) -> Result<()> {
        let copy = tx.work.clone();
        tx.savepoints.push((name, copy));
        Ok(())
    }

    async fn rollback_to_savepoint(&self, tx: &mut Self::Tx, name: &'static str) -> Result<()> {
        let at = savepoint_position(tx, name)?;
        tx.savepoints.truncate(at + 1);
        tx.work = tx.savepoints[at].1.clone();
        Ok(())
    }

    async fn release_savepoint(&self, tx: &mut Self::Tx, name: &'static str) -> Result<()> {
        let at = savepoint_position(tx, name)?;
        tx.savepoints.truncate(at);
        Ok(())
    }
}

fn savepoint_position<S>(tx: &MemTx<S>, name: &str) -> Result<usize> {
    tx.savepoints
        .iter()
        .rposition(|(n, _)| *n == name)
        .ok_or_else(|| Error::internal(format!("savepoint {name} does not exist")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rollback_to_savepoint_keeps_earlier_work() {
        let db = MemDatabase::new(Vec::<u32>::new());
        let mut tx = db.begin().await.unwrap();
        tx.push(1);
        db.savepoint(&mut tx, "step").await.unwrap();
        tx.push(2);
        db.rollback_to_savepoint(&mut tx, "step").await.unwrap();
        tx.push(3);
        db.release_savepoint(&mut tx, "step").await.unwrap();
        db.commit(tx).await.unwrap();

        assert_eq!(db.snapshot().await, vec![1, 3]);
    }

    #[tokio::test]
    async fn unknown_savepoint_is_an_error() {
        let db = MemDatabase::new(0u32);
        let mut tx = db.begin().await.unwrap();
        assert!(db.rollback_to_savepoint(&mut tx, "missing").await.is_err());
    }
}
