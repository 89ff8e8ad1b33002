use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;

use mds_core::{Error, Group, GroupId, OperationId, Result, User, UserId};
use mds_infra::outbox::{HasOutbox, OutboxTable};
use mds_infra::search::{HasSearchActions, SearchActionTable};
use mds_infra::{MemDatabase, MemTx};

use super::GroupStore;

/// Whole group service state held in memory.
#[derive(Debug, Clone, Default)]
pub struct GroupState {
    pub users: HashMap<UserId, User>,
    pub operation_members: HashMap<OperationId, BTreeSet<UserId>>,
    pub groups: BTreeMap<GroupId, Group>,
    pub outbox: OutboxTable,
    pub search_actions: SearchActionTable,
}

impl HasOutbox for GroupState {
    fn outbox(&self) -> &OutboxTable {
        &self.outbox
    }

    fn outbox_mut(&mut self) -> &mut OutboxTable {
        &mut self.outbox
    }
}

impl HasSearchActions for GroupState {
    fn search_actions(&self) -> &SearchActionTable {
        &self.search_actions
    }

    fn search_actions_mut(&mut self) -> &mut SearchActionTable {
        &mut self.search_actions
    }
}

type Tx = MemTx<GroupState>;

#[async_trait]
impl GroupStore for MemDatabase<GroupState> {
    async fn create_user(&self, tx: &mut Tx, user: &User) -> Result<()> {
        tx.users.entry(user.id).or_insert_with(|| user.clone());
        Ok(())
    }

    async fn update_user(&self, tx: &mut Tx, user: &User) -> Result<()> {
        tx.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn delete_user(&self, tx: &mut Tx, id: UserId) -> Result<()> {
        tx.users.remove(&id);
        for members in tx.operation_members.values_mut() {
            members.remove(&id);
        }
        Ok(())
    }

    async fn unknown_users(&self, tx: &mut Tx, users: &[UserId]) -> Result<Vec<UserId>> {
        Ok(users
            .iter()
            .filter(|u| !tx.users.contains_key(u))
            .copied()
            .collect())
    }

    async fn update_operation_members(&self, tx: &mut Tx, operation: OperationId, members: &[UserId]) -> Result<()> {
        tx.operation_members
            .insert(operation, members.iter().copied().collect());
        Ok(())
    }

    async fn operation_members(&self, tx: &mut Tx, operation: OperationId) -> Result<BTreeSet<UserId>> {
        Ok(tx.operation_members.get(&operation).cloned().unwrap_or_default())
    }

    async fn create_group(&self, tx: &mut Tx, group: &Group) -> Result<()> {
        if tx.groups.contains_key(&group.id) {
            return Err(Error::bad_input(format!("group {} already exists", group.id)));
        }
        tx.groups.insert(group.id, group.clone());
        Ok(())
    }

    async fn group_by_id(&self, tx: &mut Tx, id: GroupId) -> Result<Group> {
        tx.groups
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("group {id}")))
    }

    async fn update_group(&self, tx: &mut Tx, group: &Group) -> Result<()> {
        match tx.groups.get_mut(&group.id) {
            Some(current) => {
                *current = group.clone();
                Ok(())
            }
            None => Err(Error::not_found(format!("group {}", group.id))),
        }
    }

    async fn delete_group(&self, tx: &mut Tx, id: GroupId) -> Result<()> {
        tx.groups
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(format!("group {id}")))
    }

    async fn groups_by_member(&self, tx: &mut Tx, user: UserId) -> Result<Vec<Group>> {
        Ok(tx
            .groups
            .values()
            .filter(|g| g.members.contains(&user))
            .cloned()
            .collect())
    }

    async fn groups(&self, tx: &mut Tx, offset: usize, limit: usize) -> Result<Vec<Group>> {
        Ok(tx.groups.values().skip(offset).take(limit).cloned().collect())
    }
}
