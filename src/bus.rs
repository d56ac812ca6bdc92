// =============================================================================
// Signal Bus — topic-keyed publish/subscribe seam
// =============================================================================
//
// The engine only depends on these traits. `InMemoryBus` backs tests and
// offline runs; `RedisBus` (see `redis_bus`) is the production transport.
//
// Topic patterns support a single trailing `*` wildcard (`signals:*`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

/// Capacity of the in-memory broadcast ring.
const IN_MEMORY_CAPACITY: usize = 4_096;

/// One message as delivered by the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub topic: String,
    pub payload: String,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

#[async_trait]
pub trait BusPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: String) -> anyhow::Result<()>;
}

#[async_trait]
pub trait BusSubscription: Send {
    /// Next message, or `None` once the subscription is closed for good.
    async fn next_message(&mut self) -> Option<BusMessage>;
}

/// Whether `topic` matches `pattern` (exact, or prefix before a trailing `*`).
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => topic.starts_with(prefix),
        None => pattern == topic,
    }
}

// =============================================================================
// InMemoryBus
// =============================================================================

#[derive(Clone)]
pub struct InMemoryBus {
    tx: broadcast::Sender<BusMessage>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(IN_MEMORY_CAPACITY);
        Self { tx }
    }

    /// Subscribe to every topic matching any of `patterns`.
    pub fn subscribe(&self, patterns: &[&str]) -> InMemorySubscription {
        InMemorySubscription {
            rx: self.tx.subscribe(),
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// Publish without awaiting. Messages with no subscriber are dropped.
    pub fn send(&self, topic: impl Into<String>, payload: impl Into<String>) {
        let _ = self.tx.send(BusMessage::new(topic, payload));
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BusPublisher for InMemoryBus {
    async fn publish(&self, topic: &str, payload: String) -> anyhow::Result<()> {
        self.send(topic, payload);
        Ok(())
    }
}

pub struct InMemorySubscription {
    rx: broadcast::Receiver<BusMessage>,
    patterns: Vec<String>,
}

impl InMemorySubscription {
    /// Non-blocking receive of the next matching message, if one is queued.
    pub fn try_next(&mut self) -> Option<BusMessage> {
        loop {
            match self.rx.try_recv() {
                Ok(msg) if self.matches(&msg.topic) => return Some(msg),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "in-memory subscription lagged");
                }
                Err(_) => return None,
            }
        }
    }

    fn matches(&self, topic: &str) -> bool {
        self.patterns.iter().any(|p| topic_matches(p, topic))
    }
}

#[async_trait]
impl BusSubscription for InMemorySubscription {
    async fn next_message(&mut self) -> Option<BusMessage> {
        loop {
            match self.rx.recv().await {
                Ok(msg) if self.matches(&msg.topic) => return Some(msg),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "in-memory subscription lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
