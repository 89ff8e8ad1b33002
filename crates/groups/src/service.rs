//! Group mutations.
//!
//! Each mutation runs in one transaction that also emits the matching event on
//! the `groups` topic through the outbox and enqueues the search update, so the
//! bus and the index only ever see committed state.

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use mds_auth::permissions::MANAGE_GROUPS;
use mds_auth::{authorize, Principal};
use mds_core::{Error, Group, GroupId, OperationId, Result, UserId};
use mds_events::{GroupDeleted, GroupEvent};
use mds_infra::outbox::OutboxEvent;
use mds_infra::run_in_tx;
use mds_infra::search::{safe_add_or_update_document, safe_delete_document_by_id, safe_rebuild_index};

use crate::search::{group_document, GROUPS_INDEX};
use crate::store::GroupStore;

/// Caller-supplied fields of a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDraft {
    pub title: String,
    pub description: String,
    pub operation: Option<OperationId>,
    pub members: Vec<UserId>,
}

impl GroupDraft {
    /// Trimmed title, members deduplicated in first-seen order.
    fn normalized(self) -> Result<Self> {
        let title = self.title.trim().to_string();
        if title.is_empty() {
            return Err(Error::bad_input("group title must not be empty"));
        }
        let mut members: Vec<UserId> = Vec::with_capacity(self.members.len());
        for member in self.members {
            if !members.contains(&member) {
                members.push(member);
            }
        }
        Ok(Self {
            title,
            description: self.description,
            operation: self.operation,
            members,
        })
    }

    fn into_group(self, id: GroupId) -> Group {
        Group {
            id,
            title: self.title,
            description: self.description,
            operation: self.operation,
            members: self.members,
        }
    }
}

pub struct GroupService<D> {
    db: D,
}

impl<D: GroupStore> GroupService<D> {
    pub fn new(db: D) -> Self {
        Self { db }
    }

    #[instrument(skip_all, fields(user = %principal.user_id), err)]
    pub async fn create_group(
        &self,
        cancel: &CancellationToken,
        principal: &Principal,
        draft: GroupDraft,
    ) -> Result<Group> {
        authorize(principal, &MANAGE_GROUPS)?;
        let group = draft.normalized()?.into_group(GroupId::new());
        let db = &self.db;
        run_in_tx(cancel, &self.db, |mut tx| async move {
            let out: Result<Group> = async {
                validate_members(db, &mut tx, &group).await?;
                db.create_group(&mut tx, &group).await?;
                publish(db, &mut tx, GroupEvent::Created(group.clone())).await?;
                Ok(group)
            }
            .await;
            (tx, out)
        })
        .await
    }

    #[instrument(skip(self, cancel, principal, draft), err)]
    pub async fn update_group(
        &self,
        cancel: &CancellationToken,
        principal: &Principal,
        id: GroupId,
        draft: GroupDraft,
    ) -> Result<Group> {
        authorize(principal, &MANAGE_GROUPS)?;
        let group = draft.normalized()?.into_group(id);
        let db = &self.db;
        run_in_tx(cancel, &self.db, |mut tx| async move {
            let out: Result<Group> = async {
                validate_members(db, &mut tx, &group).await?;
                db.update_group(&mut tx, &group).await?;
                publish(db, &mut tx, GroupEvent::Updated(group.clone())).await?;
                Ok(group)
            }
            .await;
            (tx, out)
        })
        .await
    }

    #[instrument(skip(self, cancel, principal), err)]
    pub async fn delete_group(&self, cancel: &CancellationToken, principal: &Principal, id: GroupId) -> Result<()> {
        authorize(principal, &MANAGE_GROUPS)?;
        let db = &self.db;
        run_in_tx(cancel, &self.db, |mut tx| async move {
            let out = async {
                db.delete_group(&mut tx, id).await?;
                publish(db, &mut tx, GroupEvent::Deleted(GroupDeleted { id })).await
            }
            .await;
            (tx, out)
        })
        .await
    }

    pub async fn group(&self, cancel: &CancellationToken, id: GroupId) -> Result<Group> {
        let db = &self.db;
        run_in_tx(cancel, &self.db, |mut tx| async move {
            let out = db.group_by_id(&mut tx, id).await;
            (tx, out)
        })
        .await
    }

    /// Remove `user` from every group listing it, then delete the user.
    ///
    /// One `group-updated` event and one index update per touched group, all in
    /// the same transaction. Returns the touched groups. Running it again for
    /// the same user touches nothing.
    #[instrument(skip(self, cancel), err)]
    pub async fn delete_user(&self, cancel: &CancellationToken, user: UserId) -> Result<Vec<GroupId>> {
        let db = &self.db;
        let touched = run_in_tx(cancel, &self.db, |mut tx| async move {
            let out: Result<Vec<GroupId>> = async {
                let mut groups = db.groups_by_member(&mut tx, user).await?;
                for group in &mut groups {
                    remove_member(group, user)?;
                    db.update_group(&mut tx, group).await?;
                }
                db.delete_user(&mut tx, user).await?;
                let mut touched = Vec::with_capacity(groups.len());
                for group in groups {
                    touched.push(group.id);
                    publish(db, &mut tx, GroupEvent::Updated(group)).await?;
                }
                Ok(touched)
            }
            .await;
            (tx, out)
        })
        .await?;

        if !touched.is_empty() {
            info!(%user, groups = touched.len(), "removed deleted user from groups");
        }
        Ok(touched)
    }

    /// Enqueue a full rebuild of the groups index.
    pub async fn rebuild_search_index(&self, cancel: &CancellationToken) -> Result<()> {
        let db = &self.db;
        run_in_tx(cancel, &self.db, |mut tx| async move {
            let out = safe_rebuild_index(db, &mut tx, GROUPS_INDEX).await;
            (tx, out)
        })
        .await?;
        info!(index = GROUPS_INDEX, "search index rebuild enqueued");
        Ok(())
    }
}

/// Members must be known users and, for an operation's group, members of it.
async fn validate_members<D: GroupStore>(db: &D, tx: &mut D::Tx, group: &Group) -> Result<()> {
    let unknown = db.unknown_users(tx, &group.members).await?;
    if !unknown.is_empty() {
        return Err(unknown
            .iter()
            .fold(Error::bad_input("group lists unknown users"), |err, u| {
                err.with_detail(format!("unknown user {u}"))
            }));
    }

    if let Some(operation) = group.operation {
        let allowed = db.operation_members(tx, operation).await?;
        let outsiders: Vec<&UserId> = group.members.iter().filter(|m| !allowed.contains(m)).collect();
        if !outsiders.is_empty() {
            return Err(outsiders.iter().fold(
                Error::bad_input(format!("group members must be members of operation {operation}")),
                |err, u| err.with_detail(format!("user {u} is not a member")),
            ));
        }
    }
    Ok(())
}

/// A group returned by `groups_by_member` must list the user.
fn remove_member(group: &mut Group, user: UserId) -> Result<()> {
    let position = group.members.iter().position(|m| *m == user).ok_or_else(|| {
        Error::internal(format!("user {user} was listed as member of group {} but is missing", group.id))
    })?;
    group.members.remove(position);
    Ok(())
}

/// Emit `event` through the outbox and mirror it into the search index.
async fn publish<D: GroupStore>(db: &D, tx: &mut D::Tx, event: GroupEvent) -> Result<()> {
    let envelope = event.to_envelope()?;
    db.emit_event(
        tx,
        OutboxEvent::new(event.topic(), event.key(), envelope.event_type, envelope.payload),
    )
    .await?;

    match &event {
        GroupEvent::Created(group) | GroupEvent::Updated(group) => {
            safe_add_or_update_document(db, tx, GROUPS_INDEX, group_document(group)?).await
        }
        GroupEvent::Deleted(deleted) => {
            safe_delete_document_by_id(db, tx, GROUPS_INDEX, &deleted.id.to_string()).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(members: Vec<UserId>) -> Group {
        Group {
            id: GroupId::new(),
            title: "Logistics".to_string(),
            description: String::new(),
            operation: None,
            members,
        }
    }

    #[test]
    fn remove_member_keeps_order_of_the_others() {
        let (a, b, c) = (UserId::new(), UserId::new(), UserId::new());
        let mut g = group(vec![a, b, c]);
        remove_member(&mut g, b).unwrap();
        assert_eq!(g.members, vec![a, c]);
    }

    #[test]
    fn removing_a_missing_member_is_internal() {
        let mut g = group(vec![UserId::new()]);
        let err = remove_member(&mut g, UserId::new()).unwrap_err();
        assert_eq!(err.kind(), mds_core::ErrorKind::Internal);
    }

    #[test]
    fn draft_is_trimmed_and_deduplicated() {
        let (a, b) = (UserId::new(), UserId::new());
        let draft = GroupDraft {
            title: "  Scouts ".to_string(),
            description: String::new(),
            operation: None,
            members: vec![a, b, a],
        }
        .normalized()
        .unwrap();
        assert_eq!(draft.title, "Scouts");
        assert_eq!(draft.members, vec![a, b]);
    }

    #[test]
    fn blank_title_is_bad_input() {
        let err = GroupDraft {
            title: "   ".to_string(),
            description: String::new(),
            operation: None,
            members: Vec::new(),
        }
        .normalized()
        .unwrap_err();
        assert!(err.is_bad_input());
    }
}
