pub mod memory;
pub mod redis;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

pub use memory::MemoryTransport;
pub use self::redis::RedisTransport;

/// Queue carrying crawl tasks from the coordinator to crawl workers
pub const CRAWL_QUEUE: &str = "crawler";

/// Queue carrying content handoffs from crawl workers to index workers
pub const INDEX_QUEUE: &str = "indexer";

/// Queue carrying crawl results back to the coordinator
pub const RESULT_QUEUE: &str = "results";

/// Handle used to acknowledge a delivered message
#[derive(Debug, Clone)]
pub struct AckHandle {
    pub(crate) id: String,
}

/// A message leased to a consumer until acked or until its visibility
/// timeout expires
#[derive(Debug, Clone)]
pub struct Delivery {
    /// JSON payload as sent
    pub payload: String,

    /// Handle to ack this delivery
    pub handle: AckHandle,

    /// Number of times this message has been delivered, including this one
    pub delivery_count: u32,
}

/// Approximate queue backlog, for operator-facing progress display only
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueDepth {
    pub visible: usize,
    pub in_flight: usize,
}

/// At-least-once message transport with per-message visibility timeout.
///
/// A received message stays invisible to other consumers until acked; if the
/// consumer dies without acking, the message becomes visible again after the
/// visibility timeout. Messages that exhaust their delivery budget are
/// dropped with a logged warning rather than redelivered forever. The queue
/// technology is swappable behind this trait without touching frontier logic.
#[async_trait]
pub trait TaskTransport: Send + Sync {
    /// Enqueue a payload on the named queue
    async fn send(&self, queue: &str, payload: &str) -> Result<()>;

    /// Lease the next visible message, if any. Non-blocking: returns None
    /// when the queue is empty so callers can interleave other work.
    async fn receive(&self, queue: &str) -> Result<Option<Delivery>>;

    /// Acknowledge a delivery, removing the message permanently
    async fn ack(&self, queue: &str, handle: &AckHandle) -> Result<()>;

    /// Approximate visible and in-flight counts; not used for correctness
    async fn depth(&self, queue: &str) -> Result<QueueDepth>;
}

/// Serialize a message and send it in one step
pub async fn send_json<T: Serialize + Sync>(
    transport: &Arc<dyn TaskTransport>,
    queue: &str,
    message: &T,
) -> Result<()> {
    let payload = serde_json::to_string(message)?;
    transport.send(queue, &payload).await
}
