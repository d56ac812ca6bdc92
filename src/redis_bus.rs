// =============================================================================
// Redis Bus — production transport for signals and audit records
// =============================================================================
//
// Producers publish to `signals:<producer>:<instrument>` and the status
// topics; the engine pattern-subscribes to the signal wildcard and
// subscribes to each status topic on a dedicated pub/sub connection.
// Audit records go out over a multiplexed connection.

use std::pin::Pin;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{info, warn};

use crate::bus::{BusMessage, BusPublisher, BusSubscription};

pub struct RedisBus {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisBus {
    /// Open a client and a multiplexed connection for publishing.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .with_context(|| format!("invalid redis url {url}"))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .with_context(|| format!("failed to connect to redis at {url}"))?;
        info!(url, "connected to redis");
        Ok(Self { client, conn })
    }

    /// Round-trip a PING.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("redis PING failed")?;
        if pong != "PONG" {
            anyhow::bail!("unexpected PING reply {pong}");
        }
        Ok(())
    }

    /// Subscribe to `patterns` (entries containing `*`) and `topics`.
    pub async fn subscribe(&self, patterns: &[String], topics: &[String]) -> Result<RedisSubscription> {
        let mut pubsub = self
            .client
            .get_async_connection()
            .await
            .context("failed to open redis pub/sub connection")?
            .into_pubsub();

        for pattern in patterns {
            pubsub
                .psubscribe(pattern.as_str())
                .await
                .with_context(|| format!("PSUBSCRIBE {pattern} failed"))?;
        }
        for topic in topics {
            pubsub
                .subscribe(topic.as_str())
                .await
                .with_context(|| format!("SUBSCRIBE {topic} failed"))?;
        }
        info!(?patterns, ?topics, "redis subscription active");

        Ok(RedisSubscription {
            stream: Box::pin(pubsub.into_on_message()),
        })
    }
}

#[async_trait]
impl BusPublisher for RedisBus {
    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(topic, payload)
            .await
            .with_context(|| format!("PUBLISH to {topic} failed"))?;
        Ok(())
    }
}

pub struct RedisSubscription {
    stream: Pin<Box<dyn Stream<Item = redis::Msg> + Send>>,
}

#[async_trait]
impl BusSubscription for RedisSubscription {
    async fn next_message(&mut self) -> Option<BusMessage> {
        loop {
            let msg = self.stream.next().await?;
            let topic = msg.get_channel_name().to_string();
            match msg.get_payload::<String>() {
                Ok(payload) => return Some(BusMessage { topic, payload }),
                Err(e) => {
                    warn!(topic = %topic, error = %e, "dropping non-UTF-8 redis payload");
                }
            }
        }
    }
}
