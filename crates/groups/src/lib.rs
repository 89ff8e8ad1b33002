//! Group service.
//!
//! Keeps groups of users, mirrors `users` and `operations` events into the
//! local state it validates against, and publishes every group change on the
//! `groups` topic and into the `groups` search index.

pub mod app;
pub mod config;
pub mod handler;
pub mod search;
pub mod service;
pub mod store;

pub use app::{health_router, GroupApp};
pub use config::{ConfigError, GroupConfig};
pub use handler::{GroupEventHandler, CONSUMED_TOPICS};
pub use search::{group_document, groups_index_spec, GroupIndexRebuilder, GROUPS_INDEX};
pub use service::{GroupDraft, GroupService};
pub use store::{GroupState, GroupStore, MIGRATOR};
