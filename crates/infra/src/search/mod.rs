//! Safe search-index ingestion.
//!
//! Search writes never happen on the request / message path. Inside the
//! transaction that changes the source data, callers enqueue an action into
//! `__search_actions` through one of the `safe_*` functions. The
//! [`SearchDrainer`] applies actions to the search engine in the background:
//! per `(index, document_id)` in enqueue order, across documents in parallel.

mod client;
mod drainer;
mod meili;
mod memory;
mod postgres;

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use mds_core::{Error, Result};

use crate::db::Transactional;

pub use client::{IndexSpec, SearchClient};
pub use drainer::{IndexRebuilder, SearchDrainer, SearchDrainerConfig, SearchStep};
pub use meili::MeiliSearchClient;
pub use memory::{HasSearchActions, InMemorySearchClient, SearchActionTable};

/// A search document; must carry a string or numeric `"id"`.
pub type Document = serde_json::Map<String, JsonValue>;

/// Tries a new action starts with.
pub const DEFAULT_SEARCH_TRIES: i32 = 5;

/// Minimum pause between two tries of the same action.
pub const DEFAULT_RETRY_COOLDOWN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchActionType {
    AddOrUpdateDocument,
    DeleteDocument,
    RebuildIndex,
}

impl SearchActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            SearchActionType::AddOrUpdateDocument => "add_or_update_document",
            SearchActionType::DeleteDocument => "delete_document",
            SearchActionType::RebuildIndex => "rebuild_index",
        }
    }
}

impl FromStr for SearchActionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "add_or_update_document" => Ok(SearchActionType::AddOrUpdateDocument),
            "delete_document" => Ok(SearchActionType::DeleteDocument),
            "rebuild_index" => Ok(SearchActionType::RebuildIndex),
            other => Err(Error::fatal(format!("unknown search action type '{other}'"))),
        }
    }
}

/// One row of `__search_actions`.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchAction {
    pub id: i64,
    pub created: DateTime<Utc>,
    pub index: String,
    pub document_id: Option<String>,
    pub action_type: SearchActionType,
    pub options: JsonValue,
    pub remaining_tries: i32,
    pub retry_cooldown: Duration,
    pub processing_ts: Option<DateTime<Utc>>,
    pub err_message: Option<String>,
}

impl SearchAction {
    pub fn is_open(&self) -> bool {
        self.remaining_tries > 0
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.processing_ts {
            None => true,
            Some(ts) => {
                let cooldown = chrono::Duration::from_std(self.retry_cooldown).unwrap_or_default();
                ts + cooldown < now
            }
        }
    }
}

/// An action to enqueue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSearchAction {
    pub index: String,
    pub document_id: Option<String>,
    pub action_type: SearchActionType,
    pub options: JsonValue,
}

/// Write side of the action queue; callable only within a transaction.
#[async_trait]
pub trait SearchActionQueue: Transactional {
    async fn enqueue_search_action(&self, tx: &mut Self::Tx, action: NewSearchAction) -> Result<()>;
}

/// Drainer side of the action queue.
#[async_trait]
pub trait SearchActionStore: Transactional {
    /// Lock the lowest-id due action among the oldest open action of each
    /// `(index, document_id)` group. Actions locked elsewhere are skipped.
    async fn claim_next_search_action(
        &self,
        tx: &mut Self::Tx,
        now: DateTime<Utc>,
    ) -> Result<Option<SearchAction>>;

    async fn complete_search_action(&self, tx: &mut Self::Tx, id: i64, now: DateTime<Utc>) -> Result<()>;

    /// Consume one try and record `error`; the action stays open while tries remain.
    async fn fail_search_action(
        &self,
        tx: &mut Self::Tx,
        id: i64,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<SearchAction>;
}

/// Extract the `"id"` of a document as a string.
pub fn document_id(document: &Document) -> Result<String> {
    match document.get("id") {
        Some(JsonValue::String(id)) if !id.is_empty() => Ok(id.clone()),
        Some(JsonValue::Number(n)) => Ok(n.to_string()),
        _ => Err(Error::bad_input("search document has no usable \"id\" field")),
    }
}

/// Enqueue an add-or-update of `document` in `index`.
pub async fn safe_add_or_update_document<D: SearchActionQueue>(
    db: &D,
    tx: &mut D::Tx,
    index: &str,
    document: Document,
) -> Result<()> {
    let id = document_id(&document)?;
    db.enqueue_search_action(
        tx,
        NewSearchAction {
            index: index.to_string(),
            document_id: Some(id),
            action_type: SearchActionType::AddOrUpdateDocument,
            options: JsonValue::Object(document),
        },
    )
    .await
}

/// Enqueue the deletion of document `id` from `index`.
pub async fn safe_delete_document_by_id<D: SearchActionQueue>(
    db: &D,
    tx: &mut D::Tx,
    index: &str,
    id: &str,
) -> Result<()> {
    db.enqueue_search_action(
        tx,
        NewSearchAction {
            index: index.to_string(),
            document_id: Some(id.to_string()),
            action_type: SearchActionType::DeleteDocument,
            options: JsonValue::String(id.to_string()),
        },
    )
    .await
}

/// Enqueue a full rebuild of `index`.
pub async fn safe_rebuild_index<D: SearchActionQueue>(db: &D, tx: &mut D::Tx, index: &str) -> Result<()> {
    db.enqueue_search_action(
        tx,
        NewSearchAction {
            index: index.to_string(),
            document_id: None,
            action_type: SearchActionType::RebuildIndex,
            options: JsonValue::Null,
        },
    )
    .await
}
