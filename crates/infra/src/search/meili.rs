//! Meilisearch client over its HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, instrument};

use mds_core::{Error, Result};

use super::client::{IndexSpec, SearchClient};
use super::Document;

/// Upper bound for waiting on one engine task.
const TASK_TIMEOUT: Duration = Duration::from_secs(30);
const TASK_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct MeiliSearchClient {
    http: reqwest::Client,
    host: String,
    master_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnqueuedTask {
    task_uid: u64,
}

#[derive(Debug, Deserialize)]
struct TaskError {
    code: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct Task {
    status: String,
    error: Option<TaskError>,
}

impl MeiliSearchClient {
    pub fn new(host: impl Into<String>, master_key: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::internal(format!("search client: {e}")))?;
        Ok(Self {
            http,
            host: host.into().trim_end_matches('/').to_string(),
            master_key: master_key.into(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.host, path))
            .bearer_auth(&self.master_key)
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::internal(format!("search {what}: {e}")))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::internal(format!("search {what}: HTTP {status}: {body}")))
    }

    /// Send a request that enqueues an engine task and wait for the task.
    /// Task failures whose code is in `tolerated` count as success.
    async fn run_task(&self, request: RequestBuilder, what: &str, tolerated: &[&str]) -> Result<()> {
        let enqueued: EnqueuedTask = self
            .send(request, what)
            .await?
            .json()
            .await
            .map_err(|e| Error::internal(format!("search {what}: {e}")))?;
        self.wait_for_task(enqueued.task_uid, what, tolerated).await
    }

    async fn wait_for_task(&self, uid: u64, what: &str, tolerated: &[&str]) -> Result<()> {
        let deadline = tokio::time::Instant::now() + TASK_TIMEOUT;
        loop {
            let task: Task = self
                .send(self.request(Method::GET, &format!("/tasks/{uid}")), what)
                .await?
                .json()
                .await
                .map_err(|e| Error::internal(format!("search {what}: {e}")))?;
            match task.status.as_str() {
                "succeeded" => return Ok(()),
                "failed" | "canceled" => {
                    return match task.error {
                        Some(err) if tolerated.contains(&err.code.as_str()) => {
                            debug!(task = uid, code = %err.code, "tolerated search task failure");
                            Ok(())
                        }
                        Some(err) => Err(Error::internal(format!(
                            "search {what}: task {uid} {}: {}",
                            err.code, err.message
                        ))),
                        None => Err(Error::internal(format!("search {what}: task {uid} {}", task.status))),
                    };
                }
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::internal(format!("search {what}: task {uid} did not finish in time")));
            }
            tokio::time::sleep(TASK_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl SearchClient for MeiliSearchClient {
    #[instrument(skip(self, documents), fields(count = documents.len()), err)]
    async fn add_or_update_documents(&self, index: &str, documents: &[Document]) -> Result<()> {
        if documents.is_empty() {
            return Ok(());
        }
        let request = self
            .request(Method::PUT, &format!("/indexes/{index}/documents"))
            .query(&[("primaryKey", "id")])
            .json(documents);
        self.run_task(request, "add_or_update_documents", &[]).await
    }

    #[instrument(skip(self), err)]
    async fn delete_document(&self, index: &str, id: &str) -> Result<()> {
        let request = self.request(Method::DELETE, &format!("/indexes/{index}/documents/{id}"));
        self.run_task(request, "delete_document", &["index_not_found"]).await
    }

    #[instrument(skip(self), err)]
    async fn delete_index(&self, index: &str) -> Result<()> {
        let request = self.request(Method::DELETE, &format!("/indexes/{index}"));
        self.run_task(request, "delete_index", &["index_not_found"]).await
    }

    #[instrument(skip(self, spec), fields(index = %spec.uid), err)]
    async fn apply_index_schema(&self, spec: &IndexSpec) -> Result<()> {
        let create = self
            .request(Method::POST, "/indexes")
            .json(&json!({ "uid": spec.uid, "primaryKey": spec.primary_key }));
        self.run_task(create, "create_index", &["index_already_exists"]).await?;

        let settings: JsonValue = json!({
            "searchableAttributes": spec.searchable_attributes,
            "filterableAttributes": spec.filterable_attributes,
            "sortableAttributes": spec.sortable_attributes,
        });
        let update = self
            .request(Method::PATCH, &format!("/indexes/{}/settings", spec.uid))
            .json(&settings);
        self.run_task(update, "update_settings", &[]).await
    }

    async fn health(&self) -> Result<()> {
        let response = self
            .http
            .get(format!("{}/health", self.host))
            .send()
            .await
            .map_err(|e| Error::internal(format!("search health: {e}")))?;
        match response.status() {
            StatusCode::OK => Ok(()),
            status => Err(Error::internal(format!("search health: HTTP {status}"))),
        }
    }
}
