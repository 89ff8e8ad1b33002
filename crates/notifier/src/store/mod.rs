//! Read model of the notifier.
//!
//! Mutations are applied by the dispatcher only, inside the transaction that
//! handles one bus message, and are idempotent with respect to that message:
//! creates of existing rows are no-ops, deletes report `NotFound`.

mod memory;
mod postgres;

use async_trait::async_trait;

use mds_core::{
    ActiveIntelDelivery, ActiveIntelDeliveryAttempt, AddressBookEntryId, Intel, IntelDeliveryAttemptId,
    IntelDeliveryId, IntelId, OpenIntelDeliverySummary, Operation, OperationId, Result, User, UserId,
};
use mds_infra::Transactional;

pub use memory::NotifierState;

/// Migrations of the notifier's read model.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[async_trait]
pub trait NotifierStore: Transactional {
    /// No-op if the user exists.
    async fn create_user(&self, tx: &mut Self::Tx, user: &User) -> Result<()>;

    /// Insert or replace.
    async fn update_user(&self, tx: &mut Self::Tx, user: &User) -> Result<()>;

    /// No-op if the user is absent. Also drops the user's operation memberships.
    async fn delete_user(&self, tx: &mut Self::Tx, id: UserId) -> Result<()>;

    /// No-op if the operation exists.
    async fn create_operation(&self, tx: &mut Self::Tx, operation: &Operation) -> Result<()>;

    /// `NotFound` if the operation is absent.
    async fn update_operation(&self, tx: &mut Self::Tx, operation: &Operation) -> Result<()>;

    /// Replace the member set of `operation`.
    async fn update_operation_members(
        &self,
        tx: &mut Self::Tx,
        operation: OperationId,
        members: &[UserId],
    ) -> Result<()>;

    /// No-op if the intel exists.
    async fn create_intel(&self, tx: &mut Self::Tx, intel: &Intel) -> Result<()>;

    /// Set `is_valid = false`; `NotFound` if absent.
    async fn invalidate_intel(&self, tx: &mut Self::Tx, id: IntelId) -> Result<()>;

    /// No-op if the delivery exists.
    async fn create_active_delivery(&self, tx: &mut Self::Tx, delivery: &ActiveIntelDelivery) -> Result<()>;

    /// `NotFound` if absent. Active attempts of the delivery go with it.
    async fn delete_active_delivery(&self, tx: &mut Self::Tx, id: IntelDeliveryId) -> Result<()>;

    /// No-op if the attempt exists; `NotFound` if its delivery is absent.
    async fn create_active_attempt(&self, tx: &mut Self::Tx, attempt: &ActiveIntelDeliveryAttempt) -> Result<()>;

    /// `NotFound` if absent.
    async fn delete_active_attempt(&self, tx: &mut Self::Tx, id: IntelDeliveryAttemptId) -> Result<()>;

    /// Add `entry` to (or remove it from) the auto-delivery set.
    async fn set_auto_intel_delivery_enabled(
        &self,
        tx: &mut Self::Tx,
        entry: AddressBookEntryId,
        enabled: bool,
    ) -> Result<()>;

    /// Deliveries of `operation` needing manual dispatch, ordered by intel
    /// importance (descending), intel creation time, delivery id.
    async fn open_deliveries_by_operation(
        &self,
        tx: &mut Self::Tx,
        operation: OperationId,
    ) -> Result<Vec<OpenIntelDeliverySummary>>;

    /// `NotFound` if the intel is absent.
    async fn intel_operation(&self, tx: &mut Self::Tx, intel: IntelId) -> Result<OperationId>;

    /// `NotFound` if the delivery or its intel is absent.
    async fn intel_operation_by_delivery(&self, tx: &mut Self::Tx, delivery: IntelDeliveryId) -> Result<OperationId>;

    /// `NotFound` if the attempt, its delivery, or the intel is absent.
    async fn intel_operation_by_attempt(
        &self,
        tx: &mut Self::Tx,
        attempt: IntelDeliveryAttemptId,
    ) -> Result<OperationId>;

    /// Distinct operations having active deliveries to `entry`.
    async fn operations_with_deliveries_to(
        &self,
        tx: &mut Self::Tx,
        entry: AddressBookEntryId,
    ) -> Result<Vec<OperationId>>;
}

/// Order of [`NotifierStore::open_deliveries_by_operation`].
pub fn sort_open_deliveries(entries: &mut [OpenIntelDeliverySummary]) {
    entries.sort_by(|a, b| {
        b.intel
            .importance
            .cmp(&a.intel.importance)
            .then(a.intel.created_at.cmp(&b.intel.created_at))
            .then(a.delivery.id.cmp(&b.delivery.id))
    });
}
