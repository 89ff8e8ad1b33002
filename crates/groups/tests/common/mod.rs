#![allow(dead_code)]

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use mds_auth::permissions::MANAGE_GROUPS;
use mds_auth::Principal;
use mds_core::{Group, OperationId, User, UserId};
use mds_events::inbound::encode;
use mds_events::{EventEnvelope, GroupEvent, InMemoryBus, InMemoryConsumer, InboundEvent};
use mds_groups::{GroupApp, GroupDraft, GroupEventHandler, GroupState, CONSUMED_TOPICS};
use mds_infra::outbox::{OutboxDrainer, OutboxDrainerConfig};
use mds_infra::search::{InMemorySearchClient, SearchDrainer, SearchDrainerConfig};
use mds_infra::consumer::BatchOutcome;
use mds_infra::{ConsumerConfig, ConsumerLoop, MemDatabase};
use mds_testkit::TokenBuilder;

pub type Db = MemDatabase<GroupState>;

pub const GROUP: &str = "group-service";

pub fn manager() -> Principal {
    Principal::from_claims(TokenBuilder::new().permission(MANAGE_GROUPS).claims())
}

pub fn user(username: &str) -> User {
    User {
        id: UserId::new(),
        username: username.to_string(),
        first_name: username.to_string(),
        last_name: "Doe".to_string(),
        is_admin: false,
    }
}

pub fn draft(title: &str, operation: Option<OperationId>, members: &[UserId]) -> GroupDraft {
    GroupDraft {
        title: title.to_string(),
        description: String::new(),
        operation,
        members: members.to_vec(),
    }
}

/// The group service on an in-memory database, bus and search engine.
///
/// Nothing runs in the background: tests step the consumer and drainers.
pub struct Harness {
    pub db: Db,
    pub bus: Arc<InMemoryBus>,
    pub search: Arc<InMemorySearchClient>,
    pub app: GroupApp<Db>,
    pub cancel: CancellationToken,
    consumer: ConsumerLoop<InMemoryConsumer, GroupEventHandler<Db>>,
    outbox: OutboxDrainer<Db>,
    indexer: SearchDrainer<Db>,
}

impl Harness {
    pub fn new() -> Self {
        let db = Db::default();
        let bus = InMemoryBus::arc();
        let search = Arc::new(InMemorySearchClient::new());
        let cancel = CancellationToken::new();
        let app = GroupApp::new(db.clone(), cancel.clone());

        let consumer = ConsumerLoop::new(
            Arc::new(bus.consumer(GROUP, &CONSUMED_TOPICS)),
            app.handler().clone(),
            ConsumerConfig {
                name: GROUP,
                ..ConsumerConfig::default()
            },
        );
        let outbox = OutboxDrainer::new(db.clone(), bus.clone(), OutboxDrainerConfig::default());
        let indexer = SearchDrainer::new(db.clone(), search.clone(), SearchDrainerConfig::default())
            .with_rebuilder(Arc::new(mds_groups::GroupIndexRebuilder::new(db.clone())));

        Self {
            db,
            bus,
            search,
            app,
            cancel,
            consumer,
            outbox,
            indexer,
        }
    }

    pub fn publish(&self, event: &InboundEvent) {
        self.bus.append(event.topic(), "k", &encode(event).unwrap());
    }

    pub async fn poll(&self) -> BatchOutcome {
        self.consumer.poll_once(&self.cancel).await.unwrap()
    }

    /// Consume everything currently on the bus.
    pub async fn consume(&self) {
        loop {
            let outcome = self.consumer.poll_once(&self.cancel).await.unwrap();
            assert!(!outcome.failed, "consumer batch failed");
            if outcome.handled + outcome.skipped == 0 {
                return;
            }
        }
    }

    /// Publish every pending outbox row.
    pub async fn drain_outbox(&self) {
        while self.outbox.drain_once(&self.cancel).await.unwrap().is_some() {}
    }

    /// Apply every due search action.
    pub async fn drain_search(&self) {
        while self.indexer.drain_once(&self.cancel).await.unwrap().is_some() {}
    }

    pub async fn add_users(&self, users: &[User]) {
        for u in users {
            self.publish(&InboundEvent::UserCreated(u.clone()));
        }
        self.consume().await;
    }

    pub async fn create_group(&self, title: &str, members: &[UserId]) -> Group {
        self.app
            .service()
            .create_group(&self.cancel, &manager(), draft(title, None, members))
            .await
            .unwrap()
    }

    /// `(key, type)` of every outbox row, in emit order.
    pub async fn outbox_rows(&self) -> Vec<(String, String)> {
        self.db
            .snapshot()
            .await
            .outbox
            .records()
            .iter()
            .map(|r| (r.event.key.clone(), r.event.event_type.clone()))
            .collect()
    }

    /// Group events published on the `groups` topic.
    pub fn published_group_events(&self) -> Vec<GroupEvent> {
        self.bus
            .messages(mds_events::topics::GROUPS)
            .into_iter()
            .map(|(key, value)| {
                let env = EventEnvelope::parse(&value).unwrap();
                let event = match env.event_type.as_str() {
                    "group-created" => GroupEvent::Created(env.payload_as().unwrap()),
                    "group-updated" => GroupEvent::Updated(env.payload_as().unwrap()),
                    "group-deleted" => GroupEvent::Deleted(env.payload_as().unwrap()),
                    other => panic!("unexpected group event {other}"),
                };
                assert_eq!(key, event.key());
                event
            })
            .collect()
    }
}
