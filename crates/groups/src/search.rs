//! The `groups` search index.

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use mds_core::{Error, Group, Result};
use mds_infra::search::{Document, IndexRebuilder, IndexSpec};

use crate::store::GroupStore;

pub const GROUPS_INDEX: &str = "groups";

pub fn groups_index_spec() -> IndexSpec {
    IndexSpec::new(GROUPS_INDEX)
        .searchable(&["title", "description"])
        .filterable(&["operation", "members"])
        .sortable(&["title"])
}

/// Search document of a group.
pub fn group_document(group: &Group) -> Result<Document> {
    match json!({
        "id": group.id.to_string(),
        "title": group.title,
        "description": group.description,
        "operation": group.operation.map(|o| o.to_string()),
        "members": group.members.iter().map(|m| m.to_string()).collect::<Vec<_>>(),
    }) {
        JsonValue::Object(document) => Ok(document),
        other => Err(Error::internal(format!("group document is not an object: {other}"))),
    }
}

/// Feeds every stored group into a rebuild of [`GROUPS_INDEX`].
pub struct GroupIndexRebuilder<D> {
    db: D,
}

impl<D> GroupIndexRebuilder<D> {
    pub fn new(db: D) -> Self {
        Self { db }
    }
}

#[async_trait]
impl<D: GroupStore> IndexRebuilder<D> for GroupIndexRebuilder<D> {
    fn index_spec(&self) -> IndexSpec {
        groups_index_spec()
    }

    async fn documents(&self, tx: &mut D::Tx, offset: usize, limit: usize) -> Result<Vec<Document>> {
        self.db
            .groups(tx, offset, limit)
            .await?
            .iter()
            .map(group_document)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use mds_core::{GroupId, OperationId, UserId};

    use super::*;

    #[test]
    fn document_is_keyed_by_group_id() {
        let group = Group {
            id: GroupId::new(),
            title: "Medics".to_string(),
            description: "first aid".to_string(),
            operation: Some(OperationId::new()),
            members: vec![UserId::new(), UserId::new()],
        };
        let doc = group_document(&group).unwrap();
        assert_eq!(doc["id"], json!(group.id.to_string()));
        assert_eq!(doc["members"].as_array().map(Vec::len), Some(2));
        assert_eq!(mds_infra::search::document_id(&doc).unwrap(), group.id.to_string());
    }

    #[test]
    fn group_without_operation_has_null_operation() {
        let group = Group {
            id: GroupId::new(),
            title: "All".to_string(),
            description: String::new(),
            operation: None,
            members: Vec::new(),
        };
        assert_eq!(group_document(&group).unwrap()["operation"], JsonValue::Null);
    }
}
