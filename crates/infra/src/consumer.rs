//! At-least-once bus consumer loop.
//!
//! The loop owns offset handling only. Everything between "message received"
//! and "offset may advance" (transaction, mutation, post-commit hooks) belongs
//! to the [`MessageHandler`]:
//!
//! - handler `Ok`: the offset is committed
//! - handler `BadInput`: the message is poison; logged, offset committed
//! - any other error: fetched-but-uncommitted messages are rewound and the
//!   loop backs off exponentially before polling again

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mds_core::{ErrorKind, Result};
use mds_events::{BusConsumer, BusMessage};

use crate::backoff::backoff;

/// Applies one bus message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, cancel: &CancellationToken, message: &BusMessage) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub name: &'static str,
    pub batch_size: usize,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            name: "consumer",
            batch_size: 16,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// What happened to one polled batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchOutcome {
    pub handled: usize,
    pub skipped: usize,
    /// The batch stopped at a transient failure and was rewound.
    pub failed: bool,
}

pub struct ConsumerLoop<C: ?Sized, H: ?Sized> {
    consumer: Arc<C>,
    handler: Arc<H>,
    config: ConsumerConfig,
}

impl<C, H> ConsumerLoop<C, H>
where
    C: BusConsumer + ?Sized,
    H: MessageHandler + ?Sized,
{
    pub fn new(consumer: Arc<C>, handler: Arc<H>, config: ConsumerConfig) -> Self {
        Self {
            consumer,
            handler,
            config,
        }
    }

    /// Poll once and process the batch in order.
    pub async fn poll_once(&self, cancel: &CancellationToken) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        let batch = self.consumer.poll(self.config.batch_size).await?;

        for message in batch {
            if cancel.is_cancelled() {
                self.consumer.rewind().await;
                break;
            }
            match self.handler.handle(cancel, &message).await {
                Ok(()) => outcome.handled += 1,
                Err(err) if err.kind() == ErrorKind::BadInput => {
                    warn!(
                        consumer = self.config.name,
                        topic = %message.topic,
                        offset = %message.offset,
                        error = %err,
                        "skipping malformed message"
                    );
                    outcome.skipped += 1;
                }
                Err(err) => {
                    if err.kind() == ErrorKind::Fatal {
                        error!(consumer = self.config.name, topic = %message.topic, offset = %message.offset, error = %err, "message handling failed");
                    } else {
                        warn!(consumer = self.config.name, topic = %message.topic, offset = %message.offset, error = %err, "message handling failed; will redeliver");
                    }
                    self.consumer.rewind().await;
                    outcome.failed = true;
                    return Ok(outcome);
                }
            }

            if let Err(err) = self.consumer.commit(&message).await {
                warn!(consumer = self.config.name, topic = %message.topic, error = %err, "offset commit failed; will redeliver");
                self.consumer.rewind().await;
                outcome.failed = true;
                return Ok(outcome);
            }
            debug!(consumer = self.config.name, topic = %message.topic, offset = %message.offset, "message committed");
        }
        Ok(outcome)
    }

    /// Consume until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        info!(consumer = self.config.name, "consumer started");
        let mut failures: u32 = 0;
        loop {
            let step = tokio::select! {
                _ = cancel.cancelled() => break,
                step = self.poll_once(&cancel) => step,
            };
            let failed = match step {
                Ok(outcome) => outcome.failed,
                Err(err) => {
                    warn!(consumer = self.config.name, error = %err, "bus poll failed");
                    true
                }
            };
            if !failed {
                failures = 0;
                continue;
            }
            failures = failures.saturating_add(1);
            let delay = backoff(self.config.base_backoff, failures, self.config.max_backoff);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!(consumer = self.config.name, "consumer stopped");
    }
}
