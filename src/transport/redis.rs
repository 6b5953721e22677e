use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, Context};
use async_trait::async_trait;
use redis::{Client, aio::MultiplexedConnection};
use serde::{Serialize, Deserialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cli::config::QueueSettings;
use super::{AckHandle, Delivery, QueueDepth, TaskTransport};

/// Message envelope as stored in Redis
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    id: String,
    payload: String,
    delivery_count: u32,
}

/// Redis-backed task transport.
///
/// Each queue is a list of JSON envelopes plus two bookkeeping structures:
/// a hash of in-flight envelopes keyed by message id, and a sorted set of
/// lease deadlines (epoch seconds). Receiving first requeues any envelope
/// whose deadline has passed, which gives the at-least-once redelivery the
/// coordinator relies on.
pub struct RedisTransport {
    /// Lease duration before an unacked message becomes visible again
    visibility_timeout: Duration,

    /// Delivery budget before a message is dropped
    max_deliveries: u32,

    /// Connection pool
    conn_pool: Arc<Mutex<MultiplexedConnection>>,
}

impl RedisTransport {
    /// Connect to Redis using the queue settings
    pub async fn new(config: &QueueSettings) -> Result<Self> {
        let client = Client::open(config.redis_url.clone())
            .context(format!("Failed to connect to Redis at {}", config.redis_url))?;

        let conn = client.get_multiplexed_async_connection().await
            .context("Failed to get Redis connection")?;

        Ok(Self {
            visibility_timeout: Duration::from_secs(config.visibility_timeout_secs),
            max_deliveries: config.max_deliveries,
            conn_pool: Arc::new(Mutex::new(conn)),
        })
    }

    fn queue_key(queue: &str) -> String {
        format!("webtrawl:queue:{}", queue)
    }

    fn inflight_key(queue: &str) -> String {
        format!("webtrawl:inflight:{}", queue)
    }

    fn deadline_key(queue: &str) -> String {
        format!("webtrawl:deadlines:{}", queue)
    }

    /// Move expired leases back onto the visible list, dropping envelopes
    /// that have exhausted their delivery budget
    async fn reclaim_expired(&self, conn: &mut MultiplexedConnection, queue: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        let expired: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(Self::deadline_key(queue))
            .arg(0)
            .arg(now)
            .query_async(conn)
            .await
            .context("Failed to scan expired leases")?;

        for id in expired {
            let envelope_json: Option<String> = redis::cmd("HGET")
                .arg(Self::inflight_key(queue))
                .arg(&id)
                .query_async(conn)
                .await
                .context("Failed to read in-flight envelope")?;

            // Remove the lease bookkeeping regardless of what happens next
            redis::cmd("ZREM")
                .arg(Self::deadline_key(queue))
                .arg(&id)
                .query_async::<_, ()>(conn)
                .await
                .context("Failed to remove lease deadline")?;
            redis::cmd("HDEL")
                .arg(Self::inflight_key(queue))
                .arg(&id)
                .query_async::<_, ()>(conn)
                .await
                .context("Failed to remove in-flight envelope")?;

            let Some(envelope_json) = envelope_json else {
                continue;
            };
            let envelope: Envelope = match serde_json::from_str(&envelope_json) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!("Discarding undecodable envelope on '{}': {}", queue, e);
                    continue;
                }
            };

            if envelope.delivery_count >= self.max_deliveries {
                warn!(
                    "Dropping message from '{}' after {} deliveries",
                    queue, envelope.delivery_count
                );
            } else {
                debug!("Requeueing expired lease on '{}': {}", queue, envelope.id);
                let requeued = serde_json::to_string(&envelope)
                    .context("Failed to serialize requeued envelope")?;
                redis::cmd("LPUSH")
                    .arg(Self::queue_key(queue))
                    .arg(requeued)
                    .query_async::<_, ()>(conn)
                    .await
                    .context("Failed to requeue expired message")?;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl TaskTransport for RedisTransport {
    async fn send(&self, queue: &str, payload: &str) -> Result<()> {
        let envelope = Envelope {
            id: Uuid::new_v4().to_string(),
            payload: payload.to_string(),
            delivery_count: 0,
        };
        let envelope_json = serde_json::to_string(&envelope)
            .context("Failed to serialize envelope")?;

        let mut conn = self.conn_pool.lock().await;

        redis::cmd("LPUSH")
            .arg(Self::queue_key(queue))
            .arg(envelope_json)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to push message to Redis queue")?;

        debug!("Pushed message to '{}'", queue);

        Ok(())
    }

    async fn receive(&self, queue: &str) -> Result<Option<Delivery>> {
        let mut conn = self.conn_pool.lock().await;

        self.reclaim_expired(&mut conn, queue).await?;

        let envelope_json: Option<String> = redis::cmd("RPOP")
            .arg(Self::queue_key(queue))
            .query_async(&mut *conn)
            .await
            .context("Failed to pop message from Redis queue")?;

        let Some(envelope_json) = envelope_json else {
            return Ok(None);
        };

        let mut envelope: Envelope = serde_json::from_str(&envelope_json)
            .context("Failed to deserialize envelope")?;
        envelope.delivery_count += 1;

        let leased = serde_json::to_string(&envelope)
            .context("Failed to serialize leased envelope")?;
        let deadline = chrono::Utc::now().timestamp()
            + self.visibility_timeout.as_secs() as i64;

        redis::cmd("HSET")
            .arg(Self::inflight_key(queue))
            .arg(&envelope.id)
            .arg(leased)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to record in-flight envelope")?;
        redis::cmd("ZADD")
            .arg(Self::deadline_key(queue))
            .arg(deadline)
            .arg(&envelope.id)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to record lease deadline")?;

        debug!("Leased message {} from '{}'", envelope.id, queue);

        Ok(Some(Delivery {
            payload: envelope.payload,
            handle: AckHandle { id: envelope.id },
            delivery_count: envelope.delivery_count,
        }))
    }

    async fn ack(&self, queue: &str, handle: &AckHandle) -> Result<()> {
        let mut conn = self.conn_pool.lock().await;

        redis::cmd("HDEL")
            .arg(Self::inflight_key(queue))
            .arg(&handle.id)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to remove acked envelope")?;
        redis::cmd("ZREM")
            .arg(Self::deadline_key(queue))
            .arg(&handle.id)
            .query_async::<_, ()>(&mut *conn)
            .await
            .context("Failed to remove acked lease deadline")?;

        debug!("Acked message {} on '{}'", handle.id, queue);

        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<QueueDepth> {
        let mut conn = self.conn_pool.lock().await;

        let visible: usize = redis::cmd("LLEN")
            .arg(Self::queue_key(queue))
            .query_async(&mut *conn)
            .await
            .context("Failed to get queue length")?;

        let in_flight: usize = redis::cmd("HLEN")
            .arg(Self::inflight_key(queue))
            .query_async(&mut *conn)
            .await
            .context("Failed to get in-flight count")?;

        Ok(QueueDepth { visible, in_flight })
    }
}
