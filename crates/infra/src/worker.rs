use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Handle to control and join a background worker task.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Spawn `run` with a child of `parent`; the worker must return once the token is cancelled.
    pub fn spawn<F, Fut>(name: &'static str, parent: &CancellationToken, run: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let shutdown = parent.child_token();
        let join = tokio::spawn(run(shutdown.clone()));
        info!(worker = name, "worker started");
        Self {
            name,
            shutdown,
            join,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(err) = self.join.await {
            warn!(worker = self.name, error = %err, "worker task ended abnormally");
        }
        info!(worker = self.name, "worker stopped");
    }
}
