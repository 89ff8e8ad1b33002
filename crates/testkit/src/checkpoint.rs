//! Checkpoint recorder.
//!
//! Code under test (through a hook) and the test itself append named
//! checkpoints to one ordered log; the test then waits for checkpoints and
//! asserts on their relative order.
//!
//! ```ignore
//! let rec = Arc::new(CheckpointRecorder::new());
//! rec.checkpoint("tx-committed");
//! rec.wait_for("notified").await;
//! assert!(rec.all_before("tx-committed", "notified"));
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::trace;

#[derive(Debug, Default)]
struct Inner {
    log: Vec<String>,
    waiters: HashMap<String, Vec<oneshot::Sender<()>>>,
}

/// Ordered append-only log of named checkpoints.
#[derive(Debug, Default)]
pub struct CheckpointRecorder {
    inner: Mutex<Inner>,
}

impl CheckpointRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `name` and wake everyone waiting for it.
    pub fn checkpoint(&self, name: impl Into<String>) {
        let name = name.into();
        trace!(checkpoint = %name, "checkpoint");
        let waiters = {
            let mut inner = self.inner.lock().unwrap();
            inner.log.push(name.clone());
            inner.waiters.remove(&name).unwrap_or_default()
        };
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }

    /// Completes once `name` is in the log (immediately if it already is).
    pub fn wait_for(&self, name: &str) -> impl Future<Output = ()> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.log.iter().any(|n| n == name) {
                let _ = tx.send(());
            } else {
                inner.waiters.entry(name.to_string()).or_default().push(tx);
            }
        }
        async move {
            let _ = rx.await;
        }
    }

    /// [`Self::wait_for`] bounded by `timeout`; returns whether `name` arrived.
    pub async fn wait_for_within(&self, name: &str, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_for(name)).await.is_ok()
    }

    /// Copy of the log.
    pub fn log(&self) -> Vec<String> {
        self.inner.lock().unwrap().log.clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.inner.lock().unwrap().log.iter().filter(|n| *n == name).count()
    }

    pub fn includes(&self, name: &str) -> bool {
        self.count(name) > 0
    }

    /// First `a` precedes first `b`. False unless both are present.
    pub fn before(&self, a: &str, b: &str) -> bool {
        let log = self.log();
        match (first(&log, a), first(&log, b)) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        }
    }

    /// Last `a` precedes first `b`. False unless both are present.
    pub fn all_before(&self, a: &str, b: &str) -> bool {
        let log = self.log();
        let last_a = log.iter().rposition(|n| n == a);
        match (last_a, first(&log, b)) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        }
    }

    /// `names` occur in this order; other checkpoints may sit in between.
    pub fn includes_ordered(&self, names: &[&str]) -> bool {
        let log = self.log();
        let mut rest = log.iter();
        names.iter().all(|name| rest.any(|n| n == name))
    }
}

fn first(log: &[String], name: &str) -> Option<usize> {
    log.iter().position(|n| n == name)
}
