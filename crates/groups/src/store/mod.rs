//! Persistence of groups and of the users and operation members they are
//! validated against.

mod memory;
mod postgres;

use std::collections::BTreeSet;

use async_trait::async_trait;

use mds_core::{Group, GroupId, OperationId, Result, User, UserId};
use mds_infra::outbox::OutboxWriter;
use mds_infra::search::SearchActionQueue;

pub use memory::GroupState;

/// Migrations of the group service.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Every group mutation runs in a transaction that can also emit outbox
/// events and enqueue search actions.
#[async_trait]
pub trait GroupStore: OutboxWriter + SearchActionQueue {
    /// No-op if the user exists.
    async fn create_user(&self, tx: &mut Self::Tx, user: &User) -> Result<()>;

    /// Insert or replace.
    async fn update_user(&self, tx: &mut Self::Tx, user: &User) -> Result<()>;

    /// No-op if the user is absent. Also drops the user's operation memberships.
    async fn delete_user(&self, tx: &mut Self::Tx, id: UserId) -> Result<()>;

    /// Ids of `users` unknown to the store, in input order.
    async fn unknown_users(&self, tx: &mut Self::Tx, users: &[UserId]) -> Result<Vec<UserId>>;

    /// Replace the member set of `operation`.
    async fn update_operation_members(
        &self,
        tx: &mut Self::Tx,
        operation: OperationId,
        members: &[UserId],
    ) -> Result<()>;

    async fn operation_members(&self, tx: &mut Self::Tx, operation: OperationId) -> Result<BTreeSet<UserId>>;

    /// `BadInput` if a group with the same id exists.
    async fn create_group(&self, tx: &mut Self::Tx, group: &Group) -> Result<()>;

    /// `NotFound` if absent.
    async fn group_by_id(&self, tx: &mut Self::Tx, id: GroupId) -> Result<Group>;

    /// `NotFound` if absent.
    async fn update_group(&self, tx: &mut Self::Tx, group: &Group) -> Result<()>;

    /// `NotFound` if absent.
    async fn delete_group(&self, tx: &mut Self::Tx, id: GroupId) -> Result<()>;

    /// Groups listing `user` as a member, ordered by id.
    async fn groups_by_member(&self, tx: &mut Self::Tx, user: UserId) -> Result<Vec<Group>>;

    /// All groups ordered by id: skip `offset`, return at most `limit`.
    async fn groups(&self, tx: &mut Self::Tx, offset: usize, limit: usize) -> Result<Vec<Group>>;
}
