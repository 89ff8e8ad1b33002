use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use mds_core::Result;

use super::Document;

/// Schema of one search index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub uid: String,
    pub primary_key: String,
    pub searchable_attributes: Vec<String>,
    pub filterable_attributes: Vec<String>,
    pub sortable_attributes: Vec<String>,
}

impl IndexSpec {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            primary_key: "id".to_string(),
            searchable_attributes: vec!["*".to_string()],
            filterable_attributes: Vec::new(),
            sortable_attributes: Vec::new(),
        }
    }

    pub fn searchable(mut self, attributes: &[&str]) -> Self {
        self.searchable_attributes = attributes.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn filterable(mut self, attributes: &[&str]) -> Self {
        self.filterable_attributes = attributes.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn sortable(mut self, attributes: &[&str]) -> Self {
        self.sortable_attributes = attributes.iter().map(|a| a.to_string()).collect();
        self
    }
}

/// Search engine operations used by the drainer.
///
/// Every call returns once the engine has applied the change.
#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn add_or_update_documents(&self, index: &str, documents: &[Document]) -> Result<()>;

    /// Deleting an absent document succeeds.
    async fn delete_document(&self, index: &str, id: &str) -> Result<()>;

    /// Deleting an absent index succeeds.
    async fn delete_index(&self, index: &str) -> Result<()>;

    /// Create the index if needed and apply its settings.
    async fn apply_index_schema(&self, spec: &IndexSpec) -> Result<()>;

    async fn health(&self) -> Result<()>;
}
