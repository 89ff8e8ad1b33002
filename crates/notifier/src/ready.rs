//! Ready probe: 200 iff the database answers and every consumed topic exists.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tracing::warn;

use mds_core::Result;
use mds_events::TopicAdmin;
use mds_infra::{MemDatabase, PgDatabase};

#[async_trait]
pub trait DatabaseProbe: Send + Sync {
    async fn ping(&self) -> Result<()>;
}

#[async_trait]
impl DatabaseProbe for PgDatabase {
    async fn ping(&self) -> Result<()> {
        PgDatabase::ping(self).await
    }
}

#[async_trait]
impl<S: Clone + Send + Sync + 'static> DatabaseProbe for MemDatabase<S> {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct ReadyState {
    pub database: Arc<dyn DatabaseProbe>,
    pub topics: Arc<dyn TopicAdmin>,
    pub required_topics: Vec<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReadyReport {
    pub database: bool,
    pub topics: bool,
}

impl ReadyReport {
    pub fn is_ready(&self) -> bool {
        self.database && self.topics
    }
}

impl ReadyState {
    pub async fn check(&self) -> ReadyReport {
        let database = match self.database.ping().await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "ready: database unreachable");
                false
            }
        };
        let topics = match self.topics.topics_exist(&self.required_topics).await {
            Ok(exist) => exist,
            Err(err) => {
                warn!(error = %err, "ready: topic check failed");
                false
            }
        };
        ReadyReport { database, topics }
    }
}

async fn ready(State(state): State<ReadyState>) -> (StatusCode, Json<ReadyReport>) {
    let report = state.check().await;
    let status = if report.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

pub fn router(state: ReadyState) -> Router {
    Router::new().route("/ready", get(ready)).with_state(state)
}

#[cfg(test)]
mod tests {
    use mds_events::InMemoryBus;

    use super::*;

    fn state(bus: Arc<InMemoryBus>) -> ReadyState {
        ReadyState {
            database: Arc::new(MemDatabase::new(())),
            topics: bus,
            required_topics: vec!["intel", "users"],
        }
    }

    #[tokio::test]
    async fn missing_topics_are_not_ready() {
        let bus = InMemoryBus::arc();
        bus.create_topic("intel");
        let report = state(bus).check().await;
        assert_eq!(report, ReadyReport { database: true, topics: false });
        assert!(!report.is_ready());
    }

    #[tokio::test]
    async fn ready_once_topics_exist() {
        let bus = InMemoryBus::arc();
        bus.create_topic("intel");
        bus.create_topic("users");
        let (status, Json(report)) = ready(State(state(bus))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(report.is_ready());
    }

    #[tokio::test]
    async fn route_answers_503_until_ready() {
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let response = router(state(InMemoryBus::arc()))
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
