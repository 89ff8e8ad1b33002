//! Events published by the group service on the `groups` topic.

use serde::{Deserialize, Serialize};

use mds_core::{Group, GroupId, Result};

use crate::bus::BusMessage;
use crate::envelope::EventEnvelope;
use crate::topics;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDeleted {
    pub id: GroupId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEvent {
    Created(Group),
    Updated(Group),
    Deleted(GroupDeleted),
}

impl GroupEvent {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Created(_) => "group-created",
            Self::Updated(_) => "group-updated",
            Self::Deleted(_) => "group-deleted",
        }
    }

    pub fn topic(&self) -> &'static str {
        topics::GROUPS
    }

    pub fn group_id(&self) -> GroupId {
        match self {
            Self::Created(g) | Self::Updated(g) => g.id,
            Self::Deleted(d) => d.id,
        }
    }

    /// Partition key: events of one group stay ordered.
    pub fn key(&self) -> String {
        self.group_id().to_string()
    }

    pub fn to_envelope(&self) -> Result<EventEnvelope> {
        let name = self.type_name();
        match self {
            Self::Created(g) | Self::Updated(g) => EventEnvelope::wrap(name, g),
            Self::Deleted(d) => EventEnvelope::wrap(name, d),
        }
    }

    /// `Ok(None)` for other topics and unknown types.
    pub fn from_message(message: &BusMessage) -> Result<Option<Self>> {
        if message.topic != topics::GROUPS {
            return Ok(None);
        }
        let env = EventEnvelope::parse(&message.value)?;
        let event = match env.event_type.as_str() {
            "group-created" => Self::Created(env.payload_as()?),
            "group-updated" => Self::Updated(env.payload_as()?),
            "group-deleted" => Self::Deleted(env.payload_as()?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }
}
