use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{AckHandle, Delivery, QueueDepth, TaskTransport};

/// A queued message together with its delivery history
#[derive(Debug, Clone)]
struct Message {
    id: String,
    payload: String,
    delivery_count: u32,
}

/// A leased message awaiting ack
#[derive(Debug, Clone)]
struct Lease {
    message: Message,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    visible: VecDeque<Message>,
    in_flight: HashMap<String, Lease>,
}

/// In-process transport used for single-node runs and tests. Provides the
/// same lease/redeliver semantics as the Redis backend: unacked messages
/// reappear after the visibility timeout, and messages that exhaust their
/// delivery budget are dropped with a warning.
pub struct MemoryTransport {
    queues: Mutex<HashMap<String, QueueState>>,
    visibility_timeout: Duration,
    max_deliveries: u32,
}

impl MemoryTransport {
    pub fn new(visibility_timeout: Duration, max_deliveries: u32) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            visibility_timeout,
            max_deliveries,
        }
    }

    /// Return expired leases to the visible queue, dropping messages that
    /// have been delivered too many times
    fn reclaim_expired(state: &mut QueueState, queue: &str, max_deliveries: u32) {
        let now = Instant::now();
        let expired: Vec<String> = state
            .in_flight
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            if let Some(lease) = state.in_flight.remove(&id) {
                if lease.message.delivery_count >= max_deliveries {
                    warn!(
                        "Dropping message from '{}' after {} deliveries: {}",
                        queue,
                        lease.message.delivery_count,
                        truncate(&lease.message.payload)
                    );
                } else {
                    debug!("Requeueing expired lease on '{}': {}", queue, id);
                    state.visible.push_back(lease.message);
                }
            }
        }
    }
}

fn truncate(payload: &str) -> &str {
    match payload.char_indices().nth(120) {
        Some((idx, _)) => &payload[..idx],
        None => payload,
    }
}

#[async_trait]
impl TaskTransport for MemoryTransport {
    async fn send(&self, queue: &str, payload: &str) -> Result<()> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();

        state.visible.push_back(Message {
            id: Uuid::new_v4().to_string(),
            payload: payload.to_string(),
            delivery_count: 0,
        });

        Ok(())
    }

    async fn receive(&self, queue: &str) -> Result<Option<Delivery>> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();

        Self::reclaim_expired(state, queue, self.max_deliveries);

        let Some(mut message) = state.visible.pop_front() else {
            return Ok(None);
        };

        message.delivery_count += 1;
        let delivery = Delivery {
            payload: message.payload.clone(),
            handle: AckHandle {
                id: message.id.clone(),
            },
            delivery_count: message.delivery_count,
        };

        state.in_flight.insert(
            message.id.clone(),
            Lease {
                message,
                deadline: Instant::now() + self.visibility_timeout,
            },
        );

        Ok(Some(delivery))
    }

    async fn ack(&self, queue: &str, handle: &AckHandle) -> Result<()> {
        let mut queues = self.queues.lock().await;
        if let Some(state) = queues.get_mut(queue) {
            state.in_flight.remove(&handle.id);
        }
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<QueueDepth> {
        let queues = self.queues.lock().await;
        let depth = queues
            .get(queue)
            .map(|state| QueueDepth {
                visible: state.visible.len(),
                in_flight: state.in_flight.len(),
            })
            .unwrap_or_default();
        Ok(depth)
    }
}
