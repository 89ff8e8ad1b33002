//! Reference-counted, one-per-operation watchers.
//!
//! A watcher is created by the first listener of an operation and shut down
//! when its last listener leaves. Both steps happen under the map's write
//! lock, so the count check and the removal are atomic.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use mds_core::{OpenIntelDeliverySummary, OperationId, Result};
use mds_infra::run_in_tx;

use crate::hub::Listener;
use crate::store::NotifierStore;
use crate::watcher::{SnapshotSupplier, Watcher, WatcherConfig};

pub type OpenDeliveries = Vec<OpenIntelDeliverySummary>;

/// Receives "operation changed" hints once the change is committed.
#[async_trait]
pub trait ChangeNotifier: Send + Sync {
    async fn notify_changed(&self, operation: OperationId);
}

/// Snapshot of the open deliveries of one operation, read in its own transaction.
struct OpenDeliveriesSupplier<D> {
    db: D,
    operation: OperationId,
}

#[async_trait]
impl<D: NotifierStore> SnapshotSupplier<OpenDeliveries> for OpenDeliveriesSupplier<D> {
    async fn snapshot(&self, cancel: &CancellationToken) -> Result<OpenDeliveries> {
        let store = &self.db;
        let operation = self.operation;
        run_in_tx(cancel, &self.db, |mut tx| async move {
            let out = store.open_deliveries_by_operation(&mut tx, operation).await;
            (tx, out)
        })
        .await
    }
}

pub struct Controller<D> {
    db: D,
    config: WatcherConfig,
    watchers: RwLock<HashMap<OperationId, Arc<Watcher<OpenDeliveries>>>>,
}

impl<D: NotifierStore> Controller<D> {
    pub fn new(db: D, config: WatcherConfig) -> Self {
        Self {
            db,
            config,
            watchers: RwLock::new(HashMap::new()),
        }
    }

    /// Feed `listener` with the open deliveries of `operation` until `lifetime` ends.
    pub async fn serve_listener(
        &self,
        lifetime: &CancellationToken,
        operation: OperationId,
        listener: Arc<dyn Listener<OpenDeliveries>>,
    ) {
        let handle = {
            let mut watchers = self.watchers.write().await;
            let watcher = watchers.entry(operation).or_insert_with(|| {
                info!(%operation, "starting open intel delivery watcher");
                let supplier = Arc::new(OpenDeliveriesSupplier {
                    db: self.db.clone(),
                    operation,
                });
                Arc::new(Watcher::start(
                    format!("open-intel-deliveries/{operation}"),
                    Vec::new(),
                    supplier,
                    self.config,
                ))
            });
            watcher.hub().register(listener)
        };

        lifetime.cancelled().await;

        let mut watchers = self.watchers.write().await;
        handle.cancel();
        let idle = watchers
            .get(&operation)
            .is_some_and(|w| w.hub().listener_count() == 0);
        if idle {
            if let Some(watcher) = watchers.remove(&operation) {
                info!(%operation, "stopping open intel delivery watcher");
                watcher.shutdown().await;
            }
        }
    }

    pub async fn watcher_count(&self) -> usize {
        self.watchers.read().await.len()
    }

    pub async fn is_watching(&self, operation: OperationId) -> bool {
        self.watchers.read().await.contains_key(&operation)
    }

    /// Stop every watcher. Listeners still being served return once their lifetime ends.
    pub async fn shutdown(&self) {
        let mut watchers = self.watchers.write().await;
        for (operation, watcher) in watchers.drain() {
            debug!(%operation, "stopping watcher on shutdown");
            watcher.shutdown().await;
        }
    }
}

#[async_trait]
impl<D: NotifierStore> ChangeNotifier for Controller<D> {
    async fn notify_changed(&self, operation: OperationId) {
        if let Some(watcher) = self.watchers.read().await.get(&operation) {
            watcher.notify_changed();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use chrono::Utc;
    use mds_core::{ActiveIntelDelivery, AddressBookEntryId, Intel, IntelDeliveryId, IntelId, UserId};
    use mds_infra::{MemDatabase, Transactional};

    use super::*;
    use crate::store::NotifierState;

    #[derive(Default)]
    struct Collect(Mutex<Vec<OpenDeliveries>>);

    impl Collect {
        fn last_len(&self) -> Option<usize> {
            self.0.lock().unwrap().last().map(Vec::len)
        }
    }

    #[async_trait]
    impl Listener<OpenDeliveries> for Collect {
        async fn notify(&self, _cancel: &CancellationToken, snapshot: &OpenDeliveries) -> bool {
            self.0.lock().unwrap().push(snapshot.clone());
            true
        }
    }

    fn controller(db: &MemDatabase<NotifierState>) -> Arc<Controller<MemDatabase<NotifierState>>> {
        Arc::new(Controller::new(
            db.clone(),
            WatcherConfig {
                periodic_interval: Duration::from_secs(5),
                notify_delay: Duration::from_millis(100),
            },
        ))
    }

    async fn seed_delivery(db: &MemDatabase<NotifierState>, operation: OperationId) {
        let mut tx = db.begin().await.unwrap();
        let intel = Intel {
            id: IntelId::new(),
            created_at: Utc::now(),
            created_by: UserId::new(),
            operation,
            importance: 1,
            is_valid: true,
        };
        db.create_intel(&mut tx, &intel).await.unwrap();
        let delivery = ActiveIntelDelivery {
            id: IntelDeliveryId::new(),
            intel: intel.id,
            to: AddressBookEntryId::new(),
            note: None,
        };
        db.create_active_delivery(&mut tx, &delivery).await.unwrap();
        db.commit(tx).await.unwrap();
    }

    fn serve(
        controller: &Arc<Controller<MemDatabase<NotifierState>>>,
        operation: OperationId,
        listener: Arc<Collect>,
    ) -> (CancellationToken, tokio::task::JoinHandle<()>) {
        let lifetime = CancellationToken::new();
        let c = controller.clone();
        let l = lifetime.clone();
        let join = tokio::spawn(async move { c.serve_listener(&l, operation, listener).await });
        (lifetime, join)
    }

    #[tokio::test(start_paused = true)]
    async fn listeners_of_one_operation_share_a_watcher() {
        let db = MemDatabase::<NotifierState>::default();
        let controller = controller(&db);
        let op = OperationId::new();

        let (a, join_a) = serve(&controller, op, Arc::new(Collect::default()));
        let (b, join_b) = serve(&controller, op, Arc::new(Collect::default()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(controller.watcher_count().await, 1);

        a.cancel();
        join_a.await.unwrap();
        assert!(controller.is_watching(op).await);

        b.cancel();
        join_b.await.unwrap();
        assert_eq!(controller.watcher_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn change_hint_reaches_the_operation_watcher() {
        let db = MemDatabase::<NotifierState>::default();
        let controller = controller(&db);
        let op = OperationId::new();
        let listener = Arc::new(Collect::default());
        let (lifetime, join) = serve(&controller, op, listener.clone());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(listener.last_len(), Some(0));

        seed_delivery(&db, op).await;
        controller.notify_changed(op).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(listener.last_len(), Some(1));

        lifetime.cancel();
        join.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn hints_for_unwatched_operations_are_ignored() {
        let db = MemDatabase::<NotifierState>::default();
        let controller = controller(&db);
        controller.notify_changed(OperationId::new()).await;
        assert_eq!(controller.watcher_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_all_watchers() {
        let db = MemDatabase::<NotifierState>::default();
        let controller = controller(&db);
        let (lifetime, join) = serve(&controller, OperationId::new(), Arc::new(Collect::default()));
        let (lifetime2, join2) = serve(&controller, OperationId::new(), Arc::new(Collect::default()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(controller.watcher_count().await, 2);

        controller.shutdown().await;
        assert_eq!(controller.watcher_count().await, 0);
        lifetime.cancel();
        lifetime2.cancel();
        join.await.unwrap();
        join2.await.unwrap();
    }
}
