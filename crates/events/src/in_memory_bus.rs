//! In-memory bus for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use mds_core::{Error, Result};

use crate::bus::{BusConsumer, BusMessage, BusPublisher, MessageOffset, TopicAdmin};

/// How long an empty poll waits for new messages.
const POLL_BLOCK: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct BusState {
    /// Append-only log per topic: `(key, value)`.
    topics: HashMap<String, Vec<(String, String)>>,
    /// Committed position per `(group, topic)`; everything below is processed.
    committed: HashMap<(String, String), usize>,
    /// Publications forced to fail (tests).
    failing_publishes: usize,
}

/// In-memory log-structured bus.
///
/// - Per-topic append order
/// - Consumer groups with committed offsets (at-least-once on rewind)
/// - No persistence
#[derive(Debug, Default)]
pub struct InMemoryBus {
    state: Mutex<BusState>,
    appended: Notify,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn state(&self) -> Result<MutexGuard<'_, BusState>> {
        self.state
            .lock()
            .map_err(|_| Error::fatal("in-memory bus state poisoned"))
    }

    /// Create a topic without publishing to it.
    ///
    /// A poisoned bus ignores this and every other test helper below.
    pub fn create_topic(&self, topic: &str) {
        if let Ok(mut state) = self.state() {
            state.topics.entry(topic.to_string()).or_default();
        }
    }

    /// Append a message, bypassing the failure injection.
    pub fn append(&self, topic: &str, key: &str, value: &str) {
        if let Ok(mut state) = self.state() {
            push(&mut state, topic, key, value);
        }
        self.appended.notify_waiters();
    }

    /// All `(key, value)` pairs published to `topic`, in order.
    pub fn messages(&self, topic: &str) -> Vec<(String, String)> {
        self.state()
            .ok()
            .and_then(|state| state.topics.get(topic).cloned())
            .unwrap_or_default()
    }

    /// Committed position of `group` on `topic`.
    pub fn committed(&self, group: &str, topic: &str) -> usize {
        self.state()
            .ok()
            .and_then(|state| {
                state
                    .committed
                    .get(&(group.to_string(), topic.to_string()))
                    .copied()
            })
            .unwrap_or(0)
    }

    /// Make the next `n` publications fail with `Internal`.
    pub fn fail_next_publishes(&self, n: usize) {
        if let Ok(mut state) = self.state() {
            state.failing_publishes = n;
        }
    }

    /// Join a consumer group on the given topics.
    pub fn consumer(self: &Arc<Self>, group: &str, topics: &[&str]) -> InMemoryConsumer {
        for topic in topics {
            self.create_topic(topic);
        }
        InMemoryConsumer {
            bus: self.clone(),
            group: group.to_string(),
            topics: topics.iter().map(|t| t.to_string()).collect(),
            cursors: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl BusPublisher for InMemoryBus {
    async fn publish(&self, topic: &str, key: &str, value: &str) -> Result<()> {
        {
            let mut state = self.state()?;
            if state.failing_publishes > 0 {
                state.failing_publishes -= 1;
                return Err(Error::internal(format!("publish to {topic} failed (injected)")));
            }
            push(&mut state, topic, key, value);
        }
        self.appended.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl TopicAdmin for InMemoryBus {
    async fn topics_exist(&self, topics: &[&str]) -> Result<bool> {
        let state = self.state()?;
        Ok(topics.iter().all(|t| state.topics.contains_key(*t)))
    }
}

fn push(state: &mut BusState, topic: &str, key: &str, value: &str) {
    state
        .topics
        .entry(topic.to_string())
        .or_default()
        .push((key.to_string(), value.to_string()));
}

/// Consumer-group member of an [`InMemoryBus`].
#[derive(Debug)]
pub struct InMemoryConsumer {
    bus: Arc<InMemoryBus>,
    group: String,
    topics: Vec<String>,
    /// Read position per topic (>= committed position).
    cursors: Mutex<HashMap<String, usize>>,
}

impl InMemoryConsumer {
    fn take_available(&self, max: usize) -> Result<Vec<BusMessage>> {
        let state = self.bus.state()?;
        let mut cursors = self
            .cursors
            .lock()
            .map_err(|_| Error::fatal("in-memory consumer cursors poisoned"))?;
        let mut out = Vec::new();

        for topic in &self.topics {
            let committed = state
                .committed
                .get(&(self.group.clone(), topic.clone()))
                .copied()
                .unwrap_or(0);
            let cursor = cursors.entry(topic.clone()).or_insert(committed);
            if *cursor < committed {
                *cursor = committed;
            }
            let log = match state.topics.get(topic) {
                Some(log) => log,
                None => continue,
            };
            while *cursor < log.len() && out.len() < max {
                let (key, value) = &log[*cursor];
                out.push(BusMessage {
                    topic: topic.clone(),
                    key: key.clone(),
                    value: value.clone(),
                    offset: MessageOffset(cursor.to_string()),
                });
                *cursor += 1;
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl BusConsumer for InMemoryConsumer {
    async fn poll(&self, max: usize) -> Result<Vec<BusMessage>> {
        let appended = self.bus.appended.notified();
        tokio::pin!(appended);
        appended.as_mut().enable();

        let batch = self.take_available(max)?;
        if !batch.is_empty() {
            return Ok(batch);
        }

        let _ = tokio::time::timeout(POLL_BLOCK, appended).await;
        self.take_available(max)
    }

    async fn commit(&self, message: &BusMessage) -> Result<()> {
        let position: usize = message
            .offset
            .0
            .parse()
            .map_err(|_| Error::internal(format!("foreign offset {}", message.offset)))?;
        let mut state = self.bus.state()?;
        let committed = state
            .committed
            .entry((self.group.clone(), message.topic.clone()))
            .or_insert(0);
        if *committed < position + 1 {
            *committed = position + 1;
        }
        Ok(())
    }

    async fn rewind(&self) {
        if let Ok(mut cursors) = self.cursors.lock() {
            cursors.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn uncommitted_messages_are_redelivered_after_rewind() {
        let bus = InMemoryBus::arc();
        let consumer = bus.consumer("g", &["t"]);
        bus.append("t", "a", "1");
        bus.append("t", "a", "2");

        let first = consumer.poll(10).await.unwrap();
        assert_eq!(first.len(), 2);
        consumer.commit(&first[0]).await.unwrap();

        assert!(consumer.poll(10).await.unwrap().is_empty());

        consumer.rewind().await;
        let again = consumer.poll(10).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].value, "2");
        assert_eq!(bus.committed("g", "t"), 1);
    }

    #[tokio::test]
    async fn groups_are_independent() {
        let bus = InMemoryBus::arc();
        let a = bus.consumer("a", &["t"]);
        let b = bus.consumer("b", &["t"]);
        bus.append("t", "k", "v");

        let got = a.poll(10).await.unwrap();
        a.commit(&got[0]).await.unwrap();
        assert_eq!(b.poll(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn injected_publish_failures_are_internal() {
        let bus = InMemoryBus::new();
        bus.fail_next_publishes(1);
        let err = bus.publish("t", "k", "v").await.unwrap_err();
        assert_eq!(err.kind(), mds_core::ErrorKind::Internal);
        bus.publish("t", "k", "v").await.unwrap();
        assert_eq!(bus.messages("t").len(), 1);
    }

    #[tokio::test]
    async fn poisoned_state_fails_calls_instead_of_panicking() {
        let bus = InMemoryBus::arc();
        let consumer = bus.consumer("g", &["t"]);
        let held = bus.clone();
        let _ = std::thread::spawn(move || {
            let _guard = held.state.lock();
            panic!("writer died holding the lock");
        })
        .join();

        let err = bus.publish("t", "k", "v").await.unwrap_err();
        assert_eq!(err.kind(), mds_core::ErrorKind::Fatal);
        assert_eq!(consumer.poll(10).await.unwrap_err().kind(), mds_core::ErrorKind::Fatal);
        assert!(bus.messages("t").is_empty());
    }
}
