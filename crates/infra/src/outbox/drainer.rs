use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use mds_core::Result;
use mds_events::{BusPublisher, EventEnvelope};

use super::{OutboxStore, DEFAULT_OUTBOX_TRIES};
use crate::backoff::backoff;
use crate::db::run_in_tx;

#[derive(Debug, Clone)]
pub struct OutboxDrainerConfig {
    /// Pause when nothing is due.
    pub idle_interval: Duration,
    /// Pause after a database failure.
    pub error_interval: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for OutboxDrainerConfig {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_millis(200),
            error_interval: Duration::from_secs(1),
            base_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Result of one drain step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStep {
    Published,
    Failed,
}

/// Publishes outbox rows to the bus.
pub struct OutboxDrainer<D> {
    db: D,
    publisher: Arc<dyn BusPublisher>,
    config: OutboxDrainerConfig,
}

impl<D: OutboxStore> OutboxDrainer<D> {
    pub fn new(db: D, publisher: Arc<dyn BusPublisher>, config: OutboxDrainerConfig) -> Self {
        Self {
            db,
            publisher,
            config,
        }
    }

    /// Publish at most one due row. `None` when nothing was due.
    #[instrument(skip_all, err)]
    pub async fn drain_once(&self, cancel: &CancellationToken) -> Result<Option<DrainStep>> {
        let db = &self.db;
        let publisher = &self.publisher;
        let config = &self.config;

        run_in_tx(cancel, db, |mut tx| async move {
            let out: Result<Option<DrainStep>> = async {
                let Some(record) = db.claim_next_outbox_record(&mut tx, Utc::now()).await? else {
                    return Ok(None);
                };
                let event = &record.event;
                let value = EventEnvelope::new(event.event_type.clone(), event.payload.clone()).to_json()?;

                match publisher.publish(&event.topic, &event.key, &value).await {
                    Ok(()) => {
                        db.mark_outbox_published(&mut tx, record.id, Utc::now()).await?;
                        debug!(id = record.id, topic = %event.topic, key = %event.key, "outbox event published");
                        Ok(Some(DrainStep::Published))
                    }
                    Err(err) => {
                        let attempt = (DEFAULT_OUTBOX_TRIES - record.remaining_tries + 1).max(1) as u32;
                        let delay = backoff(config.base_backoff, attempt, config.max_backoff);
                        let retry_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
                        let updated = db
                            .record_outbox_failure(&mut tx, record.id, &err.to_string(), retry_at)
                            .await?;
                        if updated.failed {
                            error!(
                                id = record.id,
                                topic = %event.topic,
                                key = %event.key,
                                error = %err,
                                "outbox event exhausted its tries; key is blocked until requeued"
                            );
                        } else {
                            warn!(
                                id = record.id,
                                topic = %event.topic,
                                remaining_tries = updated.remaining_tries,
                                error = %err,
                                "outbox publish failed"
                            );
                        }
                        Ok(Some(DrainStep::Failed))
                    }
                }
            }
            .await;
            (tx, out)
        })
        .await
    }

    /// Drain until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        info!("outbox drainer started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let pause = match self.drain_once(&cancel).await {
                Ok(Some(DrainStep::Published)) => continue,
                Ok(Some(DrainStep::Failed)) | Ok(None) => self.config.idle_interval,
                Err(err) => {
                    warn!(error = %err, "outbox drain step failed");
                    self.config.error_interval
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        info!("outbox drainer stopped");
    }
}
