//! Events consumed by the open-intel-delivery notifier.

use serde::{Deserialize, Serialize};

use mds_core::{
    ActiveIntelDelivery, ActiveIntelDeliveryAttempt, AddressBookEntryId, Error, Intel,
    IntelDeliveryAttemptId, IntelDeliveryId, IntelId, Operation, OperationId, Result, User, UserId,
};

use crate::bus::BusMessage;
use crate::envelope::EventEnvelope;
use crate::topics;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationMembersUpdated {
    pub operation: OperationId,
    pub members: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDeleted {
    pub id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntelInvalidated {
    pub id: IntelId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRemoved {
    pub id: IntelDeliveryId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRemoved {
    pub id: IntelDeliveryAttemptId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoDeliveryToggled {
    pub entry: AddressBookEntryId,
    pub enabled: bool,
}

/// A parsed inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    OperationCreated(Operation),
    OperationUpdated(Operation),
    OperationMembersUpdated(OperationMembersUpdated),
    UserCreated(User),
    UserUpdated(User),
    UserDeleted(UserDeleted),
    IntelCreated(Intel),
    IntelInvalidated(IntelInvalidated),
    DeliveryCreated(ActiveIntelDelivery),
    DeliveryRemoved(DeliveryRemoved),
    AttemptCreated(ActiveIntelDeliveryAttempt),
    AttemptRemoved(AttemptRemoved),
    AutoDeliveryToggled(AutoDeliveryToggled),
}

impl InboundEvent {
    /// Parse a bus message.
    ///
    /// Returns `Ok(None)` for event types this service does not care about and
    /// `BadInput` for malformed envelopes or payloads.
    pub fn from_message(message: &BusMessage) -> Result<Option<Self>> {
        let envelope = EventEnvelope::parse(&message.value)?;
        Self::from_envelope(&message.topic, &envelope)
    }

    pub fn from_envelope(topic: &str, env: &EventEnvelope) -> Result<Option<Self>> {
        let event = match (topic, env.event_type.as_str()) {
            (topics::OPERATIONS, "operation-created") => Self::OperationCreated(env.payload_as()?),
            (topics::OPERATIONS, "operation-updated") => Self::OperationUpdated(env.payload_as()?),
            (topics::OPERATIONS, "operation-members-updated") => {
                Self::OperationMembersUpdated(env.payload_as()?)
            }
            (topics::USERS, "user-created") => Self::UserCreated(env.payload_as()?),
            (topics::USERS, "user-updated") => Self::UserUpdated(env.payload_as()?),
            (topics::USERS, "user-deleted") => Self::UserDeleted(env.payload_as()?),
            (topics::INTEL, "intel-created") => Self::IntelCreated(env.payload_as()?),
            (topics::INTEL, "intel-invalidated") => Self::IntelInvalidated(env.payload_as()?),
            (topics::INTEL_DELIVERIES, "delivery-created") => {
                Self::DeliveryCreated(env.payload_as()?)
            }
            (topics::INTEL_DELIVERIES, "delivery-removed") => {
                Self::DeliveryRemoved(env.payload_as()?)
            }
            (topics::INTEL_DELIVERIES, "attempt-created") => {
                Self::AttemptCreated(env.payload_as()?)
            }
            (topics::INTEL_DELIVERIES, "attempt-removed") => {
                Self::AttemptRemoved(env.payload_as()?)
            }
            (topics::ADDRESS_BOOK, "auto-intel-delivery-toggled") => {
                Self::AutoDeliveryToggled(env.payload_as()?)
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    /// Wire name of the event type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::OperationCreated(_) => "operation-created",
            Self::OperationUpdated(_) => "operation-updated",
            Self::OperationMembersUpdated(_) => "operation-members-updated",
            Self::UserCreated(_) => "user-created",
            Self::UserUpdated(_) => "user-updated",
            Self::UserDeleted(_) => "user-deleted",
            Self::IntelCreated(_) => "intel-created",
            Self::IntelInvalidated(_) => "intel-invalidated",
            Self::DeliveryCreated(_) => "delivery-created",
            Self::DeliveryRemoved(_) => "delivery-removed",
            Self::AttemptCreated(_) => "attempt-created",
            Self::AttemptRemoved(_) => "attempt-removed",
            Self::AutoDeliveryToggled(_) => "auto-intel-delivery-toggled",
        }
    }

    /// Topic the event belongs on.
    pub fn topic(&self) -> &'static str {
        match self {
            Self::OperationCreated(_)
            | Self::OperationUpdated(_)
            | Self::OperationMembersUpdated(_) => topics::OPERATIONS,
            Self::UserCreated(_) | Self::UserUpdated(_) | Self::UserDeleted(_) => topics::USERS,
            Self::IntelCreated(_) | Self::IntelInvalidated(_) => topics::INTEL,
            Self::DeliveryCreated(_)
            | Self::DeliveryRemoved(_)
            | Self::AttemptCreated(_)
            | Self::AttemptRemoved(_) => topics::INTEL_DELIVERIES,
            Self::AutoDeliveryToggled(_) => topics::ADDRESS_BOOK,
        }
    }

    /// Encode as an envelope; used by producers and tests.
    pub fn to_envelope(&self) -> Result<EventEnvelope> {
        let name = self.type_name();
        match self {
            Self::OperationCreated(p) | Self::OperationUpdated(p) => EventEnvelope::wrap(name, p),
            Self::OperationMembersUpdated(p) => EventEnvelope::wrap(name, p),
            Self::UserCreated(p) | Self::UserUpdated(p) => EventEnvelope::wrap(name, p),
            Self::UserDeleted(p) => EventEnvelope::wrap(name, p),
            Self::IntelCreated(p) => EventEnvelope::wrap(name, p),
            Self::IntelInvalidated(p) => EventEnvelope::wrap(name, p),
            Self::DeliveryCreated(p) => EventEnvelope::wrap(name, p),
            Self::DeliveryRemoved(p) => EventEnvelope::wrap(name, p),
            Self::AttemptCreated(p) => EventEnvelope::wrap(name, p),
            Self::AttemptRemoved(p) => EventEnvelope::wrap(name, p),
            Self::AutoDeliveryToggled(p) => EventEnvelope::wrap(name, p),
        }
    }
}

/// Convenience for tests and tools: the JSON text of an inbound event.
pub fn encode(event: &InboundEvent) -> Result<String> {
    event
        .to_envelope()?
        .to_json()
        .map_err(|e| Error::internal(format!("encode {}: {e}", event.type_name())))
}
