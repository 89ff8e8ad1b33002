use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use mds_core::{Error, Result};

use super::client::{IndexSpec, SearchClient};
use super::{
    document_id, Document, NewSearchAction, SearchAction, SearchActionQueue, SearchActionStore,
    DEFAULT_RETRY_COOLDOWN, DEFAULT_SEARCH_TRIES,
};
use crate::db::{MemDatabase, MemTx};

/// In-memory `__search_actions`.
#[derive(Debug, Clone, Default)]
pub struct SearchActionTable {
    next_id: i64,
    actions: Vec<SearchAction>,
}

impl SearchActionTable {
    pub fn actions(&self) -> &[SearchAction] {
        &self.actions
    }

    pub fn open(&self) -> impl Iterator<Item = &SearchAction> {
        self.actions.iter().filter(|a| a.is_open())
    }

    #[cfg(test)]
    pub(crate) fn actions_mut(&mut self) -> &mut [SearchAction] {
        &mut self.actions
    }

    fn get_mut(&mut self, id: i64) -> Result<&mut SearchAction> {
        self.actions
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| Error::not_found(format!("search action {id}")))
    }

    fn is_group_head(&self, action: &SearchAction) -> bool {
        !self.actions.iter().any(|a| {
            a.id < action.id && a.is_open() && a.index == action.index && a.document_id == action.document_id
        })
    }
}

/// State types that carry a search action table.
pub trait HasSearchActions {
    fn search_actions(&self) -> &SearchActionTable;
    fn search_actions_mut(&mut self) -> &mut SearchActionTable;
}

impl HasSearchActions for SearchActionTable {
    fn search_actions(&self) -> &SearchActionTable {
        self
    }

    fn search_actions_mut(&mut self) -> &mut SearchActionTable {
        self
    }
}

#[async_trait]
impl<S> SearchActionQueue for MemDatabase<S>
where
    S: HasSearchActions + Clone + Send + Sync + 'static,
{
    async fn enqueue_search_action(&self, tx: &mut MemTx<S>, action: NewSearchAction) -> Result<()> {
        let table = tx.search_actions_mut();
        table.next_id += 1;
        let id = table.next_id;
        table.actions.push(SearchAction {
            id,
            created: Utc::now(),
            index: action.index,
            document_id: action.document_id,
            action_type: action.action_type,
            options: action.options,
            remaining_tries: DEFAULT_SEARCH_TRIES,
            retry_cooldown: DEFAULT_RETRY_COOLDOWN,
            processing_ts: None,
            err_message: None,
        });
        Ok(())
    }
}

#[async_trait]
impl<S> SearchActionStore for MemDatabase<S>
where
    S: HasSearchActions + Clone + Send + Sync + 'static,
{
    async fn claim_next_search_action(
        &self,
        tx: &mut MemTx<S>,
        now: DateTime<Utc>,
    ) -> Result<Option<SearchAction>> {
        let table = tx.search_actions();
        Ok(table
            .actions
            .iter()
            .filter(|a| a.is_open() && table.is_group_head(a))
            .find(|a| a.is_due(now))
            .cloned())
    }

    async fn complete_search_action(&self, tx: &mut MemTx<S>, id: i64, now: DateTime<Utc>) -> Result<()> {
        let action = tx.search_actions_mut().get_mut(id)?;
        action.remaining_tries = 0;
        action.processing_ts = Some(now);
        action.err_message = None;
        Ok(())
    }

    async fn fail_search_action(
        &self,
        tx: &mut MemTx<S>,
        id: i64,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<SearchAction> {
        let action = tx.search_actions_mut().get_mut(id)?;
        action.remaining_tries = (action.remaining_tries - 1).max(0);
        action.processing_ts = Some(now);
        action.err_message = Some(error.to_string());
        Ok(action.clone())
    }
}

#[derive(Debug, Clone, Default)]
struct MemIndex {
    spec: Option<IndexSpec>,
    documents: BTreeMap<String, Document>,
}

/// Search engine kept in memory (tests, dev).
#[derive(Debug, Default)]
pub struct InMemorySearchClient {
    indexes: Mutex<HashMap<String, MemIndex>>,
    failing_calls: AtomicUsize,
}

impl InMemorySearchClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` mutating calls fail with `Internal`.
    pub fn fail_next_calls(&self, n: usize) {
        self.failing_calls.store(n, Ordering::SeqCst);
    }

    fn indexes(&self) -> Result<MutexGuard<'_, HashMap<String, MemIndex>>> {
        self.indexes
            .lock()
            .map_err(|_| Error::fatal("in-memory search indexes poisoned"))
    }

    pub fn document(&self, index: &str, id: &str) -> Option<Document> {
        let indexes = self.indexes().ok()?;
        indexes.get(index).and_then(|i| i.documents.get(id).cloned())
    }

    /// All documents of `index` ordered by id.
    pub fn documents(&self, index: &str) -> Vec<Document> {
        self.indexes()
            .ok()
            .and_then(|indexes| {
                indexes
                    .get(index)
                    .map(|i| i.documents.values().cloned().collect())
            })
            .unwrap_or_default()
    }

    pub fn index_spec(&self, index: &str) -> Option<IndexSpec> {
        let indexes = self.indexes().ok()?;
        indexes.get(index).and_then(|i| i.spec.clone())
    }

    fn check_fault(&self, what: &str) -> Result<()> {
        let failing = self
            .failing_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match failing {
            Ok(_) => Err(Error::internal(format!("search {what} failed (injected)"))),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl SearchClient for InMemorySearchClient {
    async fn add_or_update_documents(&self, index: &str, documents: &[Document]) -> Result<()> {
        self.check_fault("add_or_update_documents")?;
        let mut indexes = self.indexes()?;
        let target = indexes.entry(index.to_string()).or_default();
        for document in documents {
            target.documents.insert(document_id(document)?, document.clone());
        }
        Ok(())
    }

    async fn delete_document(&self, index: &str, id: &str) -> Result<()> {
        self.check_fault("delete_document")?;
        let mut indexes = self.indexes()?;
        if let Some(target) = indexes.get_mut(index) {
            target.documents.remove(id);
        }
        Ok(())
    }

    async fn delete_index(&self, index: &str) -> Result<()> {
        self.check_fault("delete_index")?;
        self.indexes()?.remove(index);
        Ok(())
    }

    async fn apply_index_schema(&self, spec: &IndexSpec) -> Result<()> {
        self.check_fault("apply_index_schema")?;
        let mut indexes = self.indexes()?;
        indexes.entry(spec.uid.clone()).or_default().spec = Some(spec.clone());
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        Ok(())
    }
}
