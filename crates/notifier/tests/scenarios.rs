//! End-to-end behaviour of the notifier over the in-memory database and bus.

mod common;

use std::time::Duration;

use mds_core::{ActiveIntelDeliveryAttempt, AddressBookEntryId, ErrorKind, IntelDeliveryAttemptId, OperationId};
use mds_events::inbound::{AutoDeliveryToggled, DeliveryRemoved};
use mds_events::InboundEvent;
use mds_notifier::ws::protocol::{ServerMessage, Subscriptions};
use mds_testkit::TokenBuilder;

use common::*;

const SETTLE: Duration = Duration::from_millis(400);

#[tokio::test(start_paused = true)]
async fn s1_subscribe_then_change() {
    let h = Harness::start();
    let (conn, peer) = h.connect();
    let o1 = OperationId::new();

    let raw = serde_json::json!({"type": "subscribe-open-intel-deliveries", "payload": {"operation": o1}});
    conn.handle_message(&raw.to_string()).await.unwrap();
    assert!(eventually(SETTLE, || peer.snapshots(o1).len() == 1).await);

    let messages = peer.messages();
    assert_eq!(
        messages[0],
        ServerMessage::SubscribedOpenIntelDeliveries(Subscriptions { operations: vec![o1] })
    );
    assert_eq!(peer.snapshots(o1), vec![Vec::new()]);

    let i1 = intel(o1);
    let d1 = delivery(&i1, AddressBookEntryId::new());
    h.publish(&InboundEvent::IntelCreated(i1.clone()));
    h.publish(&InboundEvent::DeliveryCreated(d1.clone()));

    assert!(eventually(NOTIFY_DELAY + SETTLE, || peer.snapshots(o1).len() == 2).await);
    let entries = peer.last_snapshot(o1).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].delivery.id, d1.id);
    assert_eq!(entries[0].intel.id, i1.id);

    // A quiet period brings no further snapshot, periodic refreshes included.
    tokio::time::sleep(Duration::from_secs(12)).await;
    assert_eq!(peer.snapshots(o1).len(), 2);

    conn.teardown().await;
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn s2_attempt_suppresses_openness() {
    let h = Harness::start();
    let (conn, peer) = h.connect();
    let o1 = OperationId::new();
    conn.subscribe(o1).await.unwrap();

    let i1 = intel(o1);
    let d1 = delivery(&i1, AddressBookEntryId::new());
    h.publish(&InboundEvent::IntelCreated(i1));
    h.publish(&InboundEvent::DeliveryCreated(d1.clone()));
    assert!(eventually(SETTLE, || peer.last_snapshot(o1).is_some_and(|e| e.len() == 1)).await);

    h.publish(&InboundEvent::AttemptCreated(ActiveIntelDeliveryAttempt {
        id: IntelDeliveryAttemptId::new(),
        delivery: d1.id,
    }));
    assert!(eventually(SETTLE, || peer.snapshots(o1).len() == 3).await);
    assert_eq!(peer.last_snapshot(o1), Some(Vec::new()));

    conn.teardown().await;
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn s3_auto_delivery_flag_removes_deliveries_to_entry() {
    let h = Harness::start();
    let (conn, peer) = h.connect();
    let (o1, o2) = (OperationId::new(), OperationId::new());
    let (e1, e2) = (AddressBookEntryId::new(), AddressBookEntryId::new());

    let i1 = intel(o1);
    let i2 = intel(o2);
    let to_e1_in_o1 = delivery(&i1, e1);
    let to_e2_in_o1 = delivery(&i1, e2);
    let to_e1_in_o2 = delivery(&i2, e1);
    for event in [
        InboundEvent::IntelCreated(i1.clone()),
        InboundEvent::IntelCreated(i2.clone()),
        InboundEvent::DeliveryCreated(to_e1_in_o1.clone()),
        InboundEvent::DeliveryCreated(to_e2_in_o1.clone()),
        InboundEvent::DeliveryCreated(to_e1_in_o2.clone()),
    ] {
        h.publish(&event);
    }
    assert!(eventually(SETTLE, || h.bus.committed(GROUP, "intel-deliveries") == 3).await);

    conn.subscribe(o1).await.unwrap();
    conn.subscribe(o2).await.unwrap();
    assert!(
        eventually(SETTLE, || {
            peer.last_snapshot(o1).is_some_and(|e| e.len() == 2) && peer.last_snapshot(o2).is_some_and(|e| e.len() == 1)
        })
        .await
    );
    let (before_o1, before_o2) = (peer.snapshots(o1).len(), peer.snapshots(o2).len());

    h.publish(&InboundEvent::AutoDeliveryToggled(AutoDeliveryToggled { entry: e1, enabled: true }));
    assert!(
        eventually(SETTLE, || {
            peer.snapshots(o1).len() == before_o1 + 1 && peer.snapshots(o2).len() == before_o2 + 1
        })
        .await
    );
    assert_eq!(delivery_ids(&peer.last_snapshot(o1).unwrap()), vec![to_e2_in_o1.id]);
    assert_eq!(peer.last_snapshot(o2), Some(Vec::new()));

    conn.teardown().await;
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn s4_many_listeners_coalesce_a_burst() {
    let h = Harness::start();
    let o1 = OperationId::new();
    let i1 = intel(o1);
    h.publish(&InboundEvent::IntelCreated(i1.clone()));
    assert!(eventually(SETTLE, || h.bus.committed(GROUP, "intel") == 1).await);

    let mut peers = Vec::new();
    for _ in 0..100 {
        let (conn, peer) = h.connect();
        conn.subscribe(o1).await.unwrap();
        peers.push((conn, peer));
    }
    assert!(eventually(SETTLE, || peers.iter().all(|(_, p)| p.snapshots(o1).len() == 1)).await);
    assert_eq!(h.app.controller().watcher_count().await, 1);

    for _ in 0..50 {
        h.publish(&InboundEvent::DeliveryCreated(delivery(&i1, AddressBookEntryId::new())));
    }
    assert!(
        eventually(NOTIFY_DELAY + SETTLE, || {
            peers
                .iter()
                .all(|(_, p)| p.last_snapshot(o1).is_some_and(|e| e.len() == 50))
        })
        .await
    );
    for (_, peer) in &peers {
        assert!(peer.snapshots(o1).len() <= 2);
    }

    for (conn, _) in &peers {
        conn.teardown().await;
    }
    assert_eq!(h.app.controller().watcher_count().await, 0);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn s5_failing_subscriber_does_not_hold_back_others() {
    let h = Harness::start();
    let o1 = OperationId::new();
    let (conn_a, a) = h.connect();
    let (conn_b, b) = h.connect();
    conn_a.subscribe(o1).await.unwrap();
    conn_b.subscribe(o1).await.unwrap();
    assert!(eventually(SETTLE, || a.snapshots(o1).len() == 1 && b.snapshots(o1).len() == 1).await);

    b.fail(true);
    let i1 = intel(o1);
    h.publish(&InboundEvent::IntelCreated(i1.clone()));
    h.publish(&InboundEvent::DeliveryCreated(delivery(&i1, AddressBookEntryId::new())));
    assert!(eventually(SETTLE, || a.snapshots(o1).len() == 2).await);
    assert_eq!(b.snapshots(o1).len(), 1);

    h.publish(&InboundEvent::DeliveryCreated(delivery(&i1, AddressBookEntryId::new())));
    assert!(eventually(NOTIFY_DELAY + Duration::from_millis(50), || a.snapshots(o1).len() == 3).await);
    assert_eq!(b.snapshots(o1).len(), 1);

    b.fail(false);
    assert!(eventually(SETTLE, || b.last_snapshot(o1).is_some_and(|e| e.len() == 2)).await);
    // Intermediate snapshots are skipped, the latest is delivered once.
    assert_eq!(b.snapshots(o1).len(), 2);

    conn_a.teardown().await;
    conn_b.teardown().await;
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn s6_closing_the_connection_removes_the_watcher() {
    let h = Harness::start();
    let o1 = OperationId::new();
    let (conn, peer) = h.connect();
    conn.subscribe(o1).await.unwrap();
    assert!(eventually(SETTLE, || peer.snapshots(o1).len() == 1).await);
    assert!(h.app.controller().is_watching(o1).await);

    conn.teardown().await;
    assert!(!h.app.controller().is_watching(o1).await);
    assert_eq!(h.app.controller().watcher_count().await, 0);

    // Closed connections refuse new subscriptions.
    let err = conn.subscribe(o1).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert_eq!(h.app.controller().watcher_count().await, 0);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn s7_redelivered_intel_is_stored_once() {
    let h = Harness::start();
    let o1 = OperationId::new();
    let i1 = intel(o1);
    h.publish(&InboundEvent::IntelCreated(i1.clone()));
    h.publish(&InboundEvent::IntelCreated(i1.clone()));
    assert!(eventually(SETTLE, || h.bus.committed(GROUP, "intel") == 2).await);

    let state = h.db.snapshot().await;
    assert_eq!(state.intel.len(), 1);
    assert_eq!(state.intel.get(&i1.id), Some(&i1));
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn recreating_a_delivery_restores_the_snapshot() {
    let h = Harness::start();
    let (conn, peer) = h.connect();
    let o1 = OperationId::new();
    conn.subscribe(o1).await.unwrap();

    let i1 = intel(o1);
    let d1 = delivery(&i1, AddressBookEntryId::new());
    h.publish(&InboundEvent::IntelCreated(i1));
    h.publish(&InboundEvent::DeliveryCreated(d1.clone()));
    assert!(eventually(SETTLE, || peer.last_snapshot(o1).is_some_and(|e| e.len() == 1)).await);
    let original = peer.last_snapshot(o1).unwrap();

    h.publish(&InboundEvent::DeliveryRemoved(DeliveryRemoved { id: d1.id }));
    assert!(eventually(SETTLE, || peer.last_snapshot(o1) == Some(Vec::new())).await);

    h.publish(&InboundEvent::DeliveryCreated(d1));
    assert!(eventually(SETTLE, || peer.last_snapshot(o1).is_some_and(|e| e.len() == 1)).await);
    assert_eq!(peer.last_snapshot(o1).unwrap(), original);

    conn.teardown().await;
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn subscribing_twice_keeps_one_subscription() {
    let h = Harness::start();
    let (conn, peer) = h.connect();
    let o1 = OperationId::new();
    conn.subscribe(o1).await.unwrap();
    conn.subscribe(o1).await.unwrap();
    assert!(eventually(SETTLE, || peer.snapshots(o1).len() == 1).await);
    tokio::time::sleep(SETTLE).await;

    assert_eq!(peer.snapshots(o1).len(), 1);
    assert_eq!(conn.subscriptions(), vec![o1]);
    assert_eq!(h.app.controller().watcher_count().await, 1);

    conn.unsubscribe(o1).await.unwrap();
    assert_eq!(
        peer.messages().last(),
        Some(&ServerMessage::SubscribedOpenIntelDeliveries(Subscriptions { operations: vec![] }))
    );

    conn.teardown().await;
    assert_eq!(h.app.controller().watcher_count().await, 0);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn subscribing_requires_manage_intel_delivery() {
    let h = Harness::start();
    let principal = mds_auth::Principal::from_claims(TokenBuilder::new().claims());
    let (conn, peer) = h.connect_as(principal);

    let err = conn.subscribe(OperationId::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    assert!(peer.messages().is_empty());
    assert_eq!(h.app.controller().watcher_count().await, 0);

    let admin = mds_auth::Principal::from_claims(TokenBuilder::new().admin().claims());
    let (admin_conn, _) = h.connect_as(admin);
    admin_conn.subscribe(OperationId::new()).await.unwrap();
    admin_conn.teardown().await;
    conn.teardown().await;
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn heartbeat_is_answered() {
    let h = Harness::start();
    let (conn, peer) = h.connect();
    conn.handle_message(r#"{"type":"heartbeat"}"#).await.unwrap();
    assert_eq!(peer.messages(), vec![ServerMessage::Heartbeat]);

    let err = conn.handle_message(r#"{"type":"bogus"}"#).await.unwrap_err();
    assert!(err.is_bad_input());
    conn.teardown().await;
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_ends_every_subscription() {
    let h = Harness::start();
    let (conn, peer) = h.connect();
    let o1 = OperationId::new();
    conn.subscribe(o1).await.unwrap();
    assert!(eventually(SETTLE, || peer.snapshots(o1).len() == 1).await);

    h.shutdown.cancel();
    conn.teardown().await;
    assert_eq!(h.app.controller().watcher_count().await, 0);
    h.stop().await;
}
