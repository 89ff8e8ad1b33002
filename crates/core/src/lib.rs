//! `mds-core` — shared foundation of the mobile-directing services.
//!
//! This crate contains **pure** building blocks (no infrastructure concerns):
//! the error taxonomy every layer maps into, strongly typed identifiers and
//! the records of the read models.

pub mod error;
pub mod id;
pub mod model;

pub use error::{Error, ErrorKind, Result};
pub use id::{
    AddressBookEntryId, GroupId, IntelDeliveryAttemptId, IntelDeliveryId, IntelId, OperationId,
    UserId,
};
pub use model::{
    ActiveIntelDelivery, ActiveIntelDeliveryAttempt, Group, Intel, OpenIntelDeliverySummary, Operation,
    User,
};
