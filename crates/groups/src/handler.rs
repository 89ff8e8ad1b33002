//! Applies `users` and `operations` events to the group service.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use mds_core::Result;
use mds_events::{topics, BusMessage, InboundEvent};
use mds_infra::{run_in_tx, MessageHandler};

use crate::service::GroupService;
use crate::store::GroupStore;

/// Topics the group service follows.
pub const CONSUMED_TOPICS: [&str; 2] = [topics::USERS, topics::OPERATIONS];

pub struct GroupEventHandler<D> {
    db: D,
    service: Arc<GroupService<D>>,
}

impl<D: GroupStore> GroupEventHandler<D> {
    pub fn new(db: D, service: Arc<GroupService<D>>) -> Self {
        Self { db, service }
    }

    #[instrument(skip(self, cancel, event), fields(event = event.type_name()), err)]
    pub async fn apply(&self, cancel: &CancellationToken, event: InboundEvent) -> Result<()> {
        let db = &self.db;
        match event {
            InboundEvent::UserDeleted(deleted) => {
                self.service.delete_user(cancel, deleted.id).await?;
            }
            InboundEvent::UserCreated(user) => {
                run_in_tx(cancel, &self.db, |mut tx| async move {
                    let out = db.create_user(&mut tx, &user).await;
                    (tx, out)
                })
                .await?;
            }
            InboundEvent::UserUpdated(user) => {
                run_in_tx(cancel, &self.db, |mut tx| async move {
                    let out = db.update_user(&mut tx, &user).await;
                    (tx, out)
                })
                .await?;
            }
            InboundEvent::OperationMembersUpdated(update) => {
                run_in_tx(cancel, &self.db, |mut tx| async move {
                    let out = db
                        .update_operation_members(&mut tx, update.operation, &update.members)
                        .await;
                    (tx, out)
                })
                .await?;
            }
            other => debug!(event = other.type_name(), "not relevant to groups"),
        }
        Ok(())
    }
}

#[async_trait]
impl<D: GroupStore> MessageHandler for GroupEventHandler<D> {
    async fn handle(&self, cancel: &CancellationToken, message: &BusMessage) -> Result<()> {
        match InboundEvent::from_message(message)? {
            Some(event) => self.apply(cancel, event).await,
            None => {
                debug!(topic = %message.topic, "ignoring unrelated event");
                Ok(())
            }
        }
    }
}
