use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use mds_core::{Error, Result};

use super::client::{IndexSpec, SearchClient};
use super::{Document, SearchAction, SearchActionStore, SearchActionType};
use crate::db::{run_in_tx, Transactional};

const APPLY_SAVEPOINT: &str = "search_action_apply";

/// Source of all documents of one index, used by `rebuild_index`.
#[async_trait]
pub trait IndexRebuilder<D: Transactional>: Send + Sync {
    fn index_spec(&self) -> IndexSpec;

    /// Documents in a stable order: skip `offset`, return at most `limit`.
    async fn documents(&self, tx: &mut D::Tx, offset: usize, limit: usize) -> Result<Vec<Document>>;
}

#[derive(Debug, Clone)]
pub struct SearchDrainerConfig {
    /// Pause when no action is due.
    pub idle_interval: Duration,
    /// Pause after a database failure.
    pub error_interval: Duration,
    pub rebuild_batch_size: usize,
}

impl Default for SearchDrainerConfig {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_millis(500),
            error_interval: Duration::from_secs(2),
            rebuild_batch_size: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStep {
    Applied,
    Failed,
}

/// Applies queued search actions to the search engine.
pub struct SearchDrainer<D: Transactional> {
    db: D,
    client: Arc<dyn SearchClient>,
    rebuilders: HashMap<String, Arc<dyn IndexRebuilder<D>>>,
    config: SearchDrainerConfig,
}

impl<D: SearchActionStore> SearchDrainer<D> {
    pub fn new(db: D, client: Arc<dyn SearchClient>, config: SearchDrainerConfig) -> Self {
        Self {
            db,
            client,
            rebuilders: HashMap::new(),
            config,
        }
    }

    pub fn with_rebuilder(mut self, rebuilder: Arc<dyn IndexRebuilder<D>>) -> Self {
        self.rebuilders.insert(rebuilder.index_spec().uid, rebuilder);
        self
    }

    /// Apply at most one due action. `None` when nothing was due.
    #[instrument(skip_all, err)]
    pub async fn drain_once(&self, cancel: &CancellationToken) -> Result<Option<SearchStep>> {
        let this = self;
        run_in_tx(cancel, &self.db, |mut tx| async move {
            let out: Result<Option<SearchStep>> = async {
                let Some(action) = this.db.claim_next_search_action(&mut tx, Utc::now()).await? else {
                    return Ok(None);
                };
                // The action runs behind a savepoint: a failed query inside a
                // rebuild must not poison the bookkeeping below.
                this.db.savepoint(&mut tx, APPLY_SAVEPOINT).await?;
                let applied = this.apply(&mut tx, &action).await;
                match applied {
                    Ok(()) => {
                        this.db.release_savepoint(&mut tx, APPLY_SAVEPOINT).await?;
                        this.db.complete_search_action(&mut tx, action.id, Utc::now()).await?;
                        debug!(
                            id = action.id,
                            index = %action.index,
                            action = action.action_type.as_str(),
                            "search action applied"
                        );
                        Ok(Some(SearchStep::Applied))
                    }
                    Err(err) => {
                        this.db.rollback_to_savepoint(&mut tx, APPLY_SAVEPOINT).await?;
                        let updated = this
                            .db
                            .fail_search_action(&mut tx, action.id, &err.to_string(), Utc::now())
                            .await?;
                        if updated.is_open() {
                            warn!(
                                id = action.id,
                                index = %action.index,
                                remaining_tries = updated.remaining_tries,
                                error = %err,
                                "search action failed"
                            );
                        } else {
                            error!(id = action.id, index = %action.index, error = %err, "search action exhausted its tries");
                        }
                        Ok(Some(SearchStep::Failed))
                    }
                }
            }
            .await;
            (tx, out)
        })
        .await
    }

    async fn apply(&self, tx: &mut D::Tx, action: &SearchAction) -> Result<()> {
        match action.action_type {
            SearchActionType::AddOrUpdateDocument => {
                let document = action
                    .options
                    .as_object()
                    .cloned()
                    .ok_or_else(|| Error::fatal(format!("search action {} has no document", action.id)))?;
                self.client.add_or_update_documents(&action.index, &[document]).await
            }
            SearchActionType::DeleteDocument => {
                let id = action
                    .options
                    .as_str()
                    .map(str::to_string)
                    .or_else(|| action.document_id.clone())
                    .ok_or_else(|| Error::fatal(format!("search action {} has no document id", action.id)))?;
                self.client.delete_document(&action.index, &id).await
            }
            SearchActionType::RebuildIndex => self.rebuild(tx, &action.index).await,
        }
    }

    async fn rebuild(&self, tx: &mut D::Tx, index: &str) -> Result<()> {
        let rebuilder = self
            .rebuilders
            .get(index)
            .ok_or_else(|| Error::internal(format!("no rebuilder registered for index '{index}'")))?;
        let batch_size = self.config.rebuild_batch_size.max(1);

        self.client.delete_index(index).await?;
        self.client.apply_index_schema(&rebuilder.index_spec()).await?;

        let mut offset = 0;
        loop {
            let batch = rebuilder.documents(tx, offset, batch_size).await?;
            let n = batch.len();
            self.client.add_or_update_documents(index, &batch).await?;
            offset += n;
            if n < batch_size {
                break;
            }
        }
        info!(index, documents = offset, "search index rebuilt");
        Ok(())
    }

    /// Drain until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        info!("search drainer started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let pause = match self.drain_once(&cancel).await {
                Ok(Some(_)) => continue,
                Ok(None) => self.config.idle_interval,
                Err(err) => {
                    warn!(error = %err, "search drain step failed");
                    self.config.error_interval
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        info!("search drainer stopped");
    }
}
