//! Records of the event-sourced read models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{
    AddressBookEntryId, GroupId, IntelDeliveryAttemptId, IntelDeliveryId, IntelId, OperationId,
    UserId,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub title: String,
    pub description: String,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub is_archived: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intel {
    pub id: IntelId,
    pub created_at: DateTime<Utc>,
    pub created_by: UserId,
    pub operation: OperationId,
    pub importance: i32,
    pub is_valid: bool,
}

/// A delivery that is still outstanding. The row exists iff the delivery is active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveIntelDelivery {
    pub id: IntelDeliveryId,
    pub intel: IntelId,
    pub to: AddressBookEntryId,
    pub note: Option<String>,
}

/// An attempt currently in progress for its parent delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveIntelDeliveryAttempt {
    pub id: IntelDeliveryAttemptId,
    pub delivery: IntelDeliveryId,
}

/// Derived view: an active delivery that needs manual dispatch, joined with its intel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenIntelDeliverySummary {
    pub delivery: ActiveIntelDelivery,
    pub intel: Intel,
}

/// A named set of users, optionally scoped to one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub title: String,
    pub description: String,
    pub operation: Option<OperationId>,
    pub members: Vec<UserId>,
}
