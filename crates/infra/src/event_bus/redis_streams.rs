//! Redis Streams-backed bus (durable, at-least-once delivery).
//!
//! - **Topic**: one stream per topic, key = topic name
//! - **Entry**: fields `key` (partition key) and `payload` (envelope JSON)
//! - **Consumer groups**: one per service (`MDS_CONSUMER_GROUP`), created at
//!   the start of the stream so a fresh group sees the whole history
//! - **Offsets**: `XACK` marks an entry processed; unacknowledged entries stay
//!   in the consumer's pending list and are read again after a rewind or a
//!   restart

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::StreamReadReply;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use mds_core::{Error, Result};
use mds_events::{BusConsumer, BusMessage, BusPublisher, MessageOffset, TopicAdmin};

/// How long a read for new entries blocks.
const BLOCK_MS: usize = 1000;

fn redis_error(operation: &str, err: redis::RedisError) -> Error {
    Error::internal(format!("redis {operation} failed: {err}"))
}

/// Publisher and topic admin over one multiplexed connection.
#[derive(Clone)]
pub struct RedisStreamsBus {
    client: Arc<redis::Client>,
    conn: MultiplexedConnection,
}

impl RedisStreamsBus {
    /// Connect to `redis_url` (e.g. `redis://localhost:6379`).
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(|e| redis_error("open", e))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| redis_error("connect", e))?;
        Ok(Self {
            client: Arc::new(client),
            conn,
        })
    }

    /// Create `topics` that do not exist yet (empty streams).
    pub async fn create_topics(&self, topics: &[&str]) -> Result<()> {
        let mut conn = self.conn.clone();
        for topic in topics {
            ensure_group(&mut conn, topic, "__admin").await?;
        }
        Ok(())
    }

    /// Join `group` on `topics` with a dedicated connection.
    ///
    /// The first poll re-reads this consumer's pending entries, so messages
    /// fetched but not acknowledged before a restart are redelivered first.
    pub async fn consumer(&self, group: &str, consumer: &str, topics: &[&str]) -> Result<RedisStreamsConsumer> {
        let mut conn = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| redis_error("connect", e))?;
        for topic in topics {
            ensure_group(&mut conn, topic, group).await?;
        }
        Ok(RedisStreamsConsumer {
            conn: Mutex::new(conn),
            group: group.to_string(),
            consumer: consumer.to_string(),
            topics: topics.iter().map(|t| t.to_string()).collect(),
            read_pending: AtomicBool::new(true),
        })
    }
}

/// `XGROUP CREATE ... MKSTREAM`; an existing group is fine.
async fn ensure_group(conn: &mut MultiplexedConnection, topic: &str, group: &str) -> Result<()> {
    let created: redis::RedisResult<String> = redis::cmd("XGROUP")
        .arg("CREATE")
        .arg(topic)
        .arg(group)
        .arg("0")
        .arg("MKSTREAM")
        .query_async(conn)
        .await;
    match created {
        Ok(_) => Ok(()),
        Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
        Err(err) => Err(redis_error("XGROUP CREATE", err)),
    }
}

#[async_trait]
impl BusPublisher for RedisStreamsBus {
    #[instrument(skip(self, value), err)]
    async fn publish(&self, topic: &str, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("XADD")
            .arg(topic)
            .arg("*")
            .arg("key")
            .arg(key)
            .arg("payload")
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("XADD", e))?;
        Ok(())
    }
}

#[async_trait]
impl TopicAdmin for RedisStreamsBus {
    async fn topics_exist(&self, topics: &[&str]) -> Result<bool> {
        let mut conn = self.conn.clone();
        for topic in topics {
            let exists: bool = redis::cmd("EXISTS")
                .arg(*topic)
                .query_async(&mut conn)
                .await
                .map_err(|e| redis_error("EXISTS", e))?;
            if !exists {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Consumer-group member reading several topics.
pub struct RedisStreamsConsumer {
    conn: Mutex<MultiplexedConnection>,
    group: String,
    consumer: String,
    topics: Vec<String>,
    /// Read the pending list (`0`) instead of new entries (`>`).
    read_pending: AtomicBool,
}

impl RedisStreamsConsumer {
    async fn read(&self, max: usize, pending: bool) -> Result<ReadBatch> {
        let mut conn = self.conn.lock().await;
        let ids: Vec<&str> = self
            .topics
            .iter()
            .map(|_| if pending { "0" } else { ">" })
            .collect();

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(&self.group).arg(&self.consumer).arg("COUNT").arg(max);
        if !pending {
            cmd.arg("BLOCK").arg(BLOCK_MS);
        }
        cmd.arg("STREAMS").arg(&self.topics).arg(&ids);

        let reply: Option<StreamReadReply> = cmd
            .query_async(&mut *conn)
            .await
            .map_err(|e| redis_error("XREADGROUP", e))?;

        let batch = split_reply(reply);
        for (topic, id) in &batch.trimmed {
            debug!(%topic, %id, "acknowledging trimmed stream entry");
            let _: u64 = redis::cmd("XACK")
                .arg(topic)
                .arg(&self.group)
                .arg(id)
                .query_async(&mut *conn)
                .await
                .map_err(|e| redis_error("XACK", e))?;
        }
        Ok(batch)
    }
}

#[derive(Debug, Default)]
struct ReadBatch {
    messages: Vec<BusMessage>,
    /// `(topic, id)` of entries trimmed from the stream while pending; they
    /// come back without fields.
    trimmed: Vec<(String, String)>,
}

fn split_reply(reply: Option<StreamReadReply>) -> ReadBatch {
    let mut batch = ReadBatch::default();
    for stream in reply.map(|r| r.keys).unwrap_or_default() {
        for entry in stream.ids {
            match (entry.get::<String>("key"), entry.get::<String>("payload")) {
                (Some(key), Some(value)) => batch.messages.push(BusMessage {
                    topic: stream.key.clone(),
                    key,
                    value,
                    offset: MessageOffset(entry.id),
                }),
                _ => batch.trimmed.push((stream.key.clone(), entry.id)),
            }
        }
    }
    batch
}

#[async_trait]
impl BusConsumer for RedisStreamsConsumer {
    async fn poll(&self, max: usize) -> Result<Vec<BusMessage>> {
        if self.read_pending.load(Ordering::SeqCst) {
            loop {
                let pending = self.read(max, true).await?;
                if !pending.messages.is_empty() {
                    return Ok(pending.messages);
                }
                // Only trimmed entries: they are acknowledged now, look again.
                if pending.trimmed.is_empty() {
                    break;
                }
            }
            self.read_pending.store(false, Ordering::SeqCst);
        }
        Ok(self.read(max, false).await?.messages)
    }

    async fn commit(&self, message: &BusMessage) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let _: u64 = redis::cmd("XACK")
            .arg(&message.topic)
            .arg(&self.group)
            .arg(&message.offset.0)
            .query_async(&mut *conn)
            .await
            .map_err(|e| redis_error("XACK", e))?;
        Ok(())
    }

    async fn rewind(&self) {
        self.read_pending.store(true, Ordering::SeqCst);
    }
}
