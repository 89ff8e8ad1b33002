#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use mds_auth::permissions::MANAGE_INTEL_DELIVERY;
use mds_auth::Principal;
use mds_core::{
    ActiveIntelDelivery, AddressBookEntryId, Error, Intel, IntelDeliveryId, IntelId, OpenIntelDeliverySummary,
    OperationId, Result, UserId,
};
use mds_events::inbound::encode;
use mds_events::{InMemoryBus, InboundEvent};
use mds_infra::{ConsumerConfig, MemDatabase, WorkerHandle};
use mds_notifier::ws::protocol::ServerMessage;
use mds_notifier::ws::{Connection, Peer};
use mds_notifier::{NotifierApp, NotifierState, WatcherConfig, CONSUMED_TOPICS};
use mds_testkit::TokenBuilder;

pub type Db = MemDatabase<NotifierState>;

pub const GROUP: &str = "open-intel-delivery-notifier";
pub const NOTIFY_DELAY: Duration = Duration::from_millis(100);

pub fn watcher_config() -> WatcherConfig {
    WatcherConfig {
        periodic_interval: Duration::from_secs(5),
        notify_delay: NOTIFY_DELAY,
    }
}

/// Peer recording every message; `send` fails while `failing` is set.
#[derive(Default)]
pub struct RecordingPeer {
    messages: Mutex<Vec<ServerMessage>>,
    pub failing: AtomicBool,
}

impl RecordingPeer {
    pub fn messages(&self) -> Vec<ServerMessage> {
        self.messages.lock().unwrap().clone()
    }

    /// Every `open-intel-deliveries` message for `operation`, in order.
    pub fn snapshots(&self, operation: OperationId) -> Vec<Vec<OpenIntelDeliverySummary>> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                ServerMessage::OpenIntelDeliveries(o) if o.operation == operation => Some(o.entries),
                _ => None,
            })
            .collect()
    }

    pub fn last_snapshot(&self, operation: OperationId) -> Option<Vec<OpenIntelDeliverySummary>> {
        self.snapshots(operation).pop()
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Peer for RecordingPeer {
    async fn send(&self, message: ServerMessage) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::internal("peer send failed"));
        }
        self.messages.lock().unwrap().push(message);
        Ok(())
    }
}

pub fn dispatcher_principal() -> Principal {
    Principal::from_claims(
        TokenBuilder::new()
            .permission(MANAGE_INTEL_DELIVERY)
            .claims(),
    )
}

/// The notifier wired to an in-memory database and bus, consuming in the background.
pub struct Harness {
    pub db: Db,
    pub bus: Arc<InMemoryBus>,
    pub app: NotifierApp<Db>,
    pub shutdown: CancellationToken,
    consumer: Option<WorkerHandle>,
}

impl Harness {
    pub fn start() -> Self {
        let db = Db::default();
        let bus = InMemoryBus::arc();
        let shutdown = CancellationToken::new();
        let app = NotifierApp::new(db.clone(), watcher_config(), shutdown.clone());
        let consumer = Arc::new(bus.consumer(GROUP, &CONSUMED_TOPICS));
        let worker = app.spawn_consumer(
            consumer,
            ConsumerConfig {
                name: GROUP,
                ..ConsumerConfig::default()
            },
        );
        Self {
            db,
            bus,
            app,
            shutdown,
            consumer: Some(worker),
        }
    }

    pub fn connect(&self) -> (Arc<Connection<Db>>, Arc<RecordingPeer>) {
        self.connect_as(dispatcher_principal())
    }

    pub fn connect_as(&self, principal: Principal) -> (Arc<Connection<Db>>, Arc<RecordingPeer>) {
        let peer = Arc::new(RecordingPeer::default());
        let connection = Arc::new(Connection::new(
            self.app.controller().clone(),
            peer.clone(),
            principal,
            self.shutdown.child_token(),
        ));
        (connection, peer)
    }

    pub fn publish(&self, event: &InboundEvent) {
        self.bus.append(event.topic(), "k", &encode(event).unwrap());
    }

    pub async fn stop(mut self) {
        if let Some(worker) = self.consumer.take() {
            worker.shutdown().await;
        }
        self.app.shutdown().await;
    }
}

/// Poll `cond` every 10ms for up to `within`.
pub async fn eventually(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn intel(operation: OperationId) -> Intel {
    Intel {
        id: IntelId::new(),
        created_at: Utc::now(),
        created_by: UserId::new(),
        operation,
        importance: 1,
        is_valid: true,
    }
}

pub fn delivery(intel: &Intel, to: AddressBookEntryId) -> ActiveIntelDelivery {
    ActiveIntelDelivery {
        id: IntelDeliveryId::new(),
        intel: intel.id,
        to,
        note: None,
    }
}

pub fn delivery_ids(entries: &[OpenIntelDeliverySummary]) -> Vec<IntelDeliveryId> {
    let mut ids: Vec<_> = entries.iter().map(|e| e.delivery.id).collect();
    ids.sort();
    ids
}
