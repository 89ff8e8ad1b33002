//! Change hints follow the commit; the bus offset follows the hints.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use mds_core::{AddressBookEntryId, OperationId};
use mds_events::{InMemoryBus, InboundEvent};
use mds_infra::{ConsumerConfig, ConsumerLoop};
use mds_notifier::{ChangeNotifier, Dispatcher};
use mds_testkit::CheckpointRecorder;

use common::*;

/// Records what a hint could observe at the moment it was sent.
struct ObservingNotifier {
    db: Db,
    bus: Arc<InMemoryBus>,
    checkpoints: Arc<CheckpointRecorder>,
}

#[async_trait]
impl ChangeNotifier for ObservingNotifier {
    async fn notify_changed(&self, _operation: OperationId) {
        let state = self.db.snapshot().await;
        self.checkpoints
            .checkpoint(format!("visible:{}", state.deliveries.len()));
        self.checkpoints.checkpoint(format!(
            "offset:{}",
            self.bus.committed(GROUP, "intel-deliveries")
        ));
        self.checkpoints.checkpoint("hint");
    }
}

#[tokio::test(start_paused = true)]
async fn hint_sees_committed_state_and_precedes_offset_commit() {
    let db = Db::default();
    let bus = InMemoryBus::arc();
    let checkpoints = Arc::new(CheckpointRecorder::new());
    let notifier = Arc::new(ObservingNotifier {
        db: db.clone(),
        bus: bus.clone(),
        checkpoints: checkpoints.clone(),
    });
    let dispatcher = Arc::new(Dispatcher::new(db.clone(), notifier));
    let consumer = Arc::new(bus.consumer(GROUP, &["intel", "intel-deliveries"]));
    let consumer_loop = ConsumerLoop::new(consumer, dispatcher, ConsumerConfig::default());
    let cancel = CancellationToken::new();

    let o1 = OperationId::new();
    let i1 = intel(o1);
    bus.append("intel", "k", &mds_events::inbound::encode(&InboundEvent::IntelCreated(i1.clone())).unwrap());
    consumer_loop.poll_once(&cancel).await.unwrap();

    // Slow commits must still complete before the hint goes out.
    db.delay_commits(Duration::from_millis(300));
    let d1 = delivery(&i1, AddressBookEntryId::new());
    bus.append(
        "intel-deliveries",
        "k",
        &mds_events::inbound::encode(&InboundEvent::DeliveryCreated(d1)).unwrap(),
    );
    let outcome = consumer_loop.poll_once(&cancel).await.unwrap();
    assert_eq!(outcome.handled, 1);
    checkpoints.checkpoint("offset-committed");

    assert!(checkpoints.includes_ordered(&["visible:1", "offset:0", "hint", "offset-committed"]));
    assert!(!checkpoints.includes("offset:1"));
    assert_eq!(bus.committed(GROUP, "intel-deliveries"), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_commit_sends_no_hint_and_keeps_the_offset() {
    let db = Db::default();
    let bus = InMemoryBus::arc();
    let checkpoints = Arc::new(CheckpointRecorder::new());
    let notifier = Arc::new(ObservingNotifier {
        db: db.clone(),
        bus: bus.clone(),
        checkpoints: checkpoints.clone(),
    });
    let dispatcher = Arc::new(Dispatcher::new(db.clone(), notifier));
    let consumer = Arc::new(bus.consumer(GROUP, &["intel"]));
    let consumer_loop = ConsumerLoop::new(consumer, dispatcher, ConsumerConfig::default());
    let cancel = CancellationToken::new();

    let i1 = intel(OperationId::new());
    bus.append("intel", "k", &mds_events::inbound::encode(&InboundEvent::IntelCreated(i1)).unwrap());

    db.fail_next_commits(1);
    let outcome = consumer_loop.poll_once(&cancel).await.unwrap();
    assert!(outcome.failed);
    assert!(!checkpoints.includes("hint"));
    assert_eq!(bus.committed(GROUP, "intel"), 0);

    // Redelivered and applied on the next poll.
    let outcome = consumer_loop.poll_once(&cancel).await.unwrap();
    assert_eq!(outcome.handled, 1);
    assert_eq!(checkpoints.count("hint"), 1);
    assert_eq!(bus.committed(GROUP, "intel"), 1);
}
