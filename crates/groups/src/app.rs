//! Wiring of the group service's background workers.

use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use mds_events::{BusConsumer, BusPublisher};
use mds_infra::outbox::{OutboxDrainer, OutboxDrainerConfig, OutboxStore};
use mds_infra::search::{SearchActionStore, SearchClient, SearchDrainer, SearchDrainerConfig};
use mds_infra::{ConsumerConfig, ConsumerLoop, WorkerHandle};

use crate::handler::GroupEventHandler;
use crate::search::GroupIndexRebuilder;
use crate::service::GroupService;
use crate::store::GroupStore;

pub struct GroupApp<D> {
    db: D,
    service: Arc<GroupService<D>>,
    handler: Arc<GroupEventHandler<D>>,
    shutdown: CancellationToken,
}

impl<D> GroupApp<D>
where
    D: GroupStore + OutboxStore + SearchActionStore,
{
    pub fn new(db: D, shutdown: CancellationToken) -> Self {
        let service = Arc::new(GroupService::new(db.clone()));
        let handler = Arc::new(GroupEventHandler::new(db.clone(), service.clone()));
        Self {
            db,
            service,
            handler,
            shutdown,
        }
    }

    pub fn service(&self) -> &Arc<GroupService<D>> {
        &self.service
    }

    pub fn handler(&self) -> &Arc<GroupEventHandler<D>> {
        &self.handler
    }

    pub fn spawn_consumer<C>(&self, consumer: Arc<C>, config: ConsumerConfig) -> WorkerHandle
    where
        C: BusConsumer + 'static,
    {
        let handler = self.handler.clone();
        WorkerHandle::spawn(config.name, &self.shutdown, move |token| {
            ConsumerLoop::new(consumer, handler, config).run(token)
        })
    }

    pub fn spawn_outbox_drainer(&self, publisher: Arc<dyn BusPublisher>, config: OutboxDrainerConfig) -> WorkerHandle {
        let drainer = OutboxDrainer::new(self.db.clone(), publisher, config);
        WorkerHandle::spawn("group-outbox-drainer", &self.shutdown, move |token| drainer.run(token))
    }

    pub fn spawn_search_drainer(&self, client: Arc<dyn SearchClient>, config: SearchDrainerConfig) -> WorkerHandle {
        let drainer = SearchDrainer::new(self.db.clone(), client, config)
            .with_rebuilder(Arc::new(GroupIndexRebuilder::new(self.db.clone())));
        WorkerHandle::spawn("group-search-drainer", &self.shutdown, move |token| drainer.run(token))
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

pub fn health_router() -> Router {
    Router::new().route("/health", get(|| async { Json(json!({ "status": "ok" })) }))
}
