//! Wiring of the notifier's components.

use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use mds_auth::TokenValidator;
use mds_events::{topics, BusConsumer};
use mds_infra::{ConsumerConfig, ConsumerLoop, WorkerHandle};

use crate::controller::Controller;
use crate::dispatcher::Dispatcher;
use crate::store::NotifierStore;
use crate::watcher::WatcherConfig;
use crate::ws::{self, WsState};

/// Topics the read model is built from.
pub const CONSUMED_TOPICS: [&str; 5] = [
    topics::OPERATIONS,
    topics::USERS,
    topics::INTEL,
    topics::INTEL_DELIVERIES,
    topics::ADDRESS_BOOK,
];

pub struct NotifierApp<D> {
    controller: Arc<Controller<D>>,
    dispatcher: Arc<Dispatcher<D, Controller<D>>>,
    shutdown: CancellationToken,
}

impl<D: NotifierStore> NotifierApp<D> {
    pub fn new(db: D, watcher: WatcherConfig, shutdown: CancellationToken) -> Self {
        let controller = Arc::new(Controller::new(db.clone(), watcher));
        let dispatcher = Arc::new(Dispatcher::new(db, controller.clone()));
        Self {
            controller,
            dispatcher,
            shutdown,
        }
    }

    pub fn controller(&self) -> &Arc<Controller<D>> {
        &self.controller
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher<D, Controller<D>>> {
        &self.dispatcher
    }

    pub fn ws_router(&self, tokens: Arc<dyn TokenValidator>) -> Router {
        ws::router(WsState {
            controller: self.controller.clone(),
            tokens,
            shutdown: self.shutdown.clone(),
        })
    }

    /// Run the bus consumer until shutdown.
    pub fn spawn_consumer<C>(&self, consumer: Arc<C>, config: ConsumerConfig) -> WorkerHandle
    where
        C: BusConsumer + 'static,
    {
        let dispatcher = self.dispatcher.clone();
        WorkerHandle::spawn(config.name, &self.shutdown, move |token| {
            ConsumerLoop::new(consumer, dispatcher, config).run(token)
        })
    }

    /// Cancel every connection and stop all watchers.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.controller.shutdown().await;
    }
}

pub fn health_router() -> Router {
    Router::new().route("/health", get(|| async { Json(json!({ "status": "ok" })) }))
}
