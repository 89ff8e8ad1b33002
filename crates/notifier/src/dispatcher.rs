//! Applies inbound bus events to the read model.
//!
//! Each message is handled in one transaction that applies the mutation and
//! resolves the operations whose open deliveries may have changed. The change
//! hints go out only after the commit returned; the consumer loop commits the
//! bus offset only after `handle` returned.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use mds_core::{ErrorKind, IntelDeliveryAttemptId, OperationId, Result};
use mds_events::{BusMessage, InboundEvent};
use mds_infra::{run_in_tx, MessageHandler};

use crate::controller::ChangeNotifier;
use crate::store::NotifierStore;

pub struct Dispatcher<D, N: ?Sized> {
    db: D,
    notifier: Arc<N>,
}

impl<D, N> Dispatcher<D, N>
where
    D: NotifierStore,
    N: ChangeNotifier + ?Sized,
{
    pub fn new(db: D, notifier: Arc<N>) -> Self {
        Self { db, notifier }
    }

    /// Apply `event` and hint every affected operation once committed.
    #[instrument(skip(self, cancel, event), fields(event = event.type_name()), err)]
    pub async fn dispatch(&self, cancel: &CancellationToken, event: InboundEvent) -> Result<()> {
        let store = &self.db;
        let affected = run_in_tx(cancel, &self.db, |mut tx| async move {
            let out = apply(store, &mut tx, &event).await;
            (tx, out)
        })
        .await?;

        for operation in affected {
            debug!(%operation, "operation changed");
            self.notifier.notify_changed(operation).await;
        }
        Ok(())
    }
}

#[async_trait]
impl<D, N> MessageHandler for Dispatcher<D, N>
where
    D: NotifierStore,
    N: ChangeNotifier + ?Sized,
{
    async fn handle(&self, cancel: &CancellationToken, message: &BusMessage) -> Result<()> {
        match InboundEvent::from_message(message)? {
            Some(event) => self.dispatch(cancel, event).await,
            None => {
                debug!(topic = %message.topic, "ignoring unrelated event");
                Ok(())
            }
        }
    }
}

/// `NotFound` is expected under at-least-once, cross-topic delivery; anything
/// else aborts the transaction.
fn tolerate_not_found<T>(what: &str, res: Result<T>) -> Result<Option<T>> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!(error = %err, "{what}: not found, skipping");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// Resolve the operation an attempt belongs to; a missing link only costs the hint.
async fn attempt_operation<D: NotifierStore>(
    store: &D,
    tx: &mut D::Tx,
    attempt: IntelDeliveryAttemptId,
) -> Result<Option<OperationId>> {
    match store.intel_operation_by_attempt(tx, attempt).await {
        Ok(op) => Ok(Some(op)),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            warn!(%attempt, error = %err, "operation of attempt unknown; skipping notification");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

async fn apply<D: NotifierStore>(
    store: &D,
    tx: &mut D::Tx,
    event: &InboundEvent,
) -> Result<Vec<OperationId>> {
    let affected = match event {
        InboundEvent::OperationCreated(operation) => {
            store.create_operation(tx, operation).await?;
            Vec::new()
        }
        InboundEvent::OperationUpdated(operation) => {
            tolerate_not_found("update operation", store.update_operation(tx, operation).await)?;
            Vec::new()
        }
        InboundEvent::OperationMembersUpdated(update) => {
            store
                .update_operation_members(tx, update.operation, &update.members)
                .await?;
            Vec::new()
        }
        InboundEvent::UserCreated(user) => {
            store.create_user(tx, user).await?;
            Vec::new()
        }
        InboundEvent::UserUpdated(user) => {
            store.update_user(tx, user).await?;
            Vec::new()
        }
        InboundEvent::UserDeleted(deleted) => {
            store.delete_user(tx, deleted.id).await?;
            Vec::new()
        }
        InboundEvent::IntelCreated(intel) => {
            // Deliveries may have arrived before their intel.
            store.create_intel(tx, intel).await?;
            vec![intel.operation]
        }
        InboundEvent::IntelInvalidated(invalidated) => {
            let operation = tolerate_not_found(
                "resolve intel operation",
                store.intel_operation(tx, invalidated.id).await,
            )?;
            tolerate_not_found("invalidate intel", store.invalidate_intel(tx, invalidated.id).await)?;
            operation.into_iter().collect()
        }
        InboundEvent::DeliveryCreated(delivery) => {
            store.create_active_delivery(tx, delivery).await?;
            tolerate_not_found(
                "resolve delivery operation",
                store.intel_operation(tx, delivery.intel).await,
            )?
            .into_iter()
            .collect()
        }
        InboundEvent::DeliveryRemoved(removed) => {
            let operation = tolerate_not_found(
                "resolve delivery operation",
                store.intel_operation_by_delivery(tx, removed.id).await,
            )?;
            tolerate_not_found(
                "delete active delivery",
                store.delete_active_delivery(tx, removed.id).await,
            )?;
            operation.into_iter().collect()
        }
        InboundEvent::AttemptCreated(attempt) => {
            tolerate_not_found("create active attempt", store.create_active_attempt(tx, attempt).await)?;
            attempt_operation(store, tx, attempt.id).await?.into_iter().collect()
        }
        InboundEvent::AttemptRemoved(removed) => {
            let operation = attempt_operation(store, tx, removed.id).await?;
            tolerate_not_found(
                "delete active attempt",
                store.delete_active_attempt(tx, removed.id).await,
            )?;
            operation.into_iter().collect()
        }
        InboundEvent::AutoDeliveryToggled(toggle) => {
            store
                .set_auto_intel_delivery_enabled(tx, toggle.entry, toggle.enabled)
                .await?;
            store.operations_with_deliveries_to(tx, toggle.entry).await?
        }
    };
    Ok(affected)
}
