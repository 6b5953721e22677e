use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::cli::config::CrawlerConfig;
use crate::coordinator::frontier::Frontier;
use crate::crawler::task::{CrawlResult, CrawlStatus, CrawlTask, ScopeConfig};
use crate::storage::ContentStore;
use crate::transport::{send_json, TaskTransport, CRAWL_QUEUE, RESULT_QUEUE};
use crate::utils::stats::CrawlStats;

/// Bookkeeping for one worker capacity unit.
///
/// Slots model capacity, not processes: the coordinator never talks to a
/// worker directly, it only tracks how many tasks may be outstanding at once.
#[derive(Debug)]
struct WorkerSlot {
    /// Canonical URL of the in-flight task, None when idle
    assigned_url: Option<String>,

    /// When the current task was dispatched
    dispatched_at: Option<Instant>,
}

impl WorkerSlot {
    fn idle() -> Self {
        Self {
            assigned_url: None,
            dispatched_at: None,
        }
    }

    fn is_idle(&self) -> bool {
        self.assigned_url.is_none()
    }

    fn release(&mut self) {
        self.assigned_url = None;
        self.dispatched_at = None;
    }
}

/// The single-writer crawl coordinator.
///
/// Owns the frontier, the worker slots and the session counters. Drives the
/// crawl by dispatching frontier entries to the task queue, ingesting results
/// from the result queue, and deciding when the session is finished.
pub struct Coordinator {
    frontier: Frontier,

    transport: Arc<dyn TaskTransport>,

    store: Arc<dyn ContentStore>,

    /// Scope snapshot embedded in every dispatched task
    scope: ScopeConfig,

    slots: Vec<WorkerSlot>,

    stats: CrawlStats,

    /// How long the empty-and-idle state must persist before termination
    stabilization_window: Duration,

    /// Busy slots older than this are reclaimed; set past the queue
    /// visibility timeout so redelivery happens first
    slot_timeout: Duration,

    poll_interval: Duration,

    progress_interval: Duration,

    /// Start of the current uninterrupted empty-and-idle stretch
    idle_since: Option<Instant>,
}

impl Coordinator {
    pub fn new(
        config: &CrawlerConfig,
        transport: Arc<dyn TaskTransport>,
        store: Arc<dyn ContentStore>,
    ) -> Self {
        let slots = (0..config.crawler.num_crawlers)
            .map(|_| WorkerSlot::idle())
            .collect();

        Self {
            frontier: Frontier::new(config.crawler.clone()),
            transport,
            store,
            scope: config.scope(),
            slots,
            stats: CrawlStats::new(),
            stabilization_window: Duration::from_secs(config.coordinator.stabilization_window_secs),
            slot_timeout: Duration::from_secs(config.queue.visibility_timeout_secs + 30),
            poll_interval: Duration::from_millis(config.coordinator.poll_interval_ms),
            progress_interval: Duration::from_secs(config.coordinator.progress_interval_secs),
            idle_since: None,
        }
    }

    /// Replay the content store into the seen set so a restarted session
    /// does not refetch pages it already has. Returns how many URLs were
    /// restored.
    pub async fn rebuild_seen_from_store(&mut self) -> Result<usize> {
        let keys = self.store.list_keys().await?;
        let mut restored = 0;

        for key in keys {
            match self.store.get(&key).await {
                Ok(Some(record)) => {
                    self.frontier.mark_seen(&record.url);
                    restored += 1;
                }
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable content record {}: {}", key, e),
            }
        }

        Ok(restored)
    }

    /// Offer seed URLs to the frontier at depth zero. Returns the canonical
    /// forms that were accepted.
    pub fn submit(&mut self, seeds: &[String]) -> Vec<String> {
        let mut accepted = Vec::new();

        for seed in seeds {
            if let Some(canonical) = self.frontier.offer(seed, 0) {
                self.stats.queued += 1;
                accepted.push(canonical);
            }
        }

        accepted
    }

    /// Fill idle slots from the frontier, one task per slot.
    async fn dispatch_ready(&mut self) -> Result<usize> {
        let mut dispatched = 0;

        for slot in self.slots.iter_mut().filter(|s| s.is_idle()) {
            let Some(entry) = self.frontier.pop() else {
                break;
            };

            let task = CrawlTask {
                url: entry.url.clone(),
                depth: entry.depth,
                scope: self.scope.clone(),
            };
            send_json(&self.transport, CRAWL_QUEUE, &task).await?;

            debug!(
                "Dispatched {} at depth {} ({})",
                entry.url, entry.depth, entry.domain
            );
            slot.assigned_url = Some(entry.url);
            slot.dispatched_at = Some(Instant::now());
            self.stats.dispatched += 1;
            dispatched += 1;
        }

        Ok(dispatched)
    }

    /// Fold one worker result into the frontier and counters, and release
    /// the slot that was holding its URL.
    fn ingest(&mut self, result: &CrawlResult) {
        if let Some(slot) = self
            .slots
            .iter_mut()
            .find(|s| s.assigned_url.as_deref() == Some(result.url.as_str()))
        {
            slot.release();
        } else {
            // Redelivered result for a slot already reclaimed; still safe to
            // fold in because frontier operations are idempotent.
            debug!("Result for {} arrived without a matching slot", result.url);
        }

        match &result.status {
            CrawlStatus::Success => {
                self.frontier.mark_seen(&result.url);
                self.stats.crawled += 1;

                let child_depth = result.depth + 1;
                for link in &result.extracted_links {
                    if self.frontier.offer(link, child_depth).is_some() {
                        self.stats.queued += 1;
                    }
                }
            }
            CrawlStatus::Disallowed | CrawlStatus::NotHtml => {
                self.frontier.mark_seen(&result.url);
                self.stats.rejected += 1;
            }
            CrawlStatus::HttpError(code) => {
                self.frontier.mark_seen(&result.url);
                self.stats.errored += 1;
                debug!("HTTP {} for {}", code, result.url);
            }
            CrawlStatus::NetworkError => {
                self.frontier.mark_seen(&result.url);
                self.stats.errored += 1;
            }
            CrawlStatus::SkippedDuplicate => {
                // Already stored in an earlier session; no frontier change
                self.stats.skipped += 1;
            }
        }
    }

    /// Reclaim slots whose task has been outstanding longer than the queue
    /// visibility timeout. The queue's redelivery budget owns the retry; the
    /// coordinator only frees the capacity.
    fn reap_stale_slots(&mut self) {
        for slot in &mut self.slots {
            let Some(dispatched_at) = slot.dispatched_at else {
                continue;
            };
            if dispatched_at.elapsed() >= self.slot_timeout {
                if let Some(url) = &slot.assigned_url {
                    warn!("Reclaiming stale slot for {} after {:?}", url, self.slot_timeout);
                }
                slot.release();
            }
        }
    }

    fn all_slots_idle(&self) -> bool {
        self.slots.iter().all(|s| s.is_idle())
    }

    /// Track the empty-and-idle stretch. Any activity resets the clock.
    fn observe_idle(&mut self) {
        if self.frontier.is_empty() && self.all_slots_idle() {
            self.idle_since.get_or_insert_with(Instant::now);
        } else {
            self.idle_since = None;
        }
    }

    /// True once the frontier has been empty and every slot idle for one
    /// uninterrupted stabilization window.
    pub fn is_terminal(&self) -> bool {
        self.idle_since
            .map(|since| since.elapsed() >= self.stabilization_window)
            .unwrap_or(false)
    }

    /// Drive the session to completion. Consumes the coordinator and returns
    /// the final counters.
    ///
    /// When shutdown is signalled, dispatching stops, in-flight tasks are
    /// allowed to finish, and the loop exits once every slot is idle.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<CrawlStats> {
        info!(
            "Coordinator started with {} worker slots, {} URLs queued",
            self.slots.len(),
            self.frontier.len()
        );
        let mut last_progress = Instant::now();

        loop {
            let draining = *shutdown.borrow();
            if !draining {
                self.dispatch_ready().await?;
            }

            let mut drained_any = false;
            while let Some(delivery) = self.transport.receive(RESULT_QUEUE).await? {
                drained_any = true;
                match serde_json::from_str::<CrawlResult>(&delivery.payload) {
                    Ok(result) => self.ingest(&result),
                    Err(e) => warn!("Discarding malformed result message: {}", e),
                }
                self.transport.ack(RESULT_QUEUE, &delivery.handle).await?;
            }

            self.reap_stale_slots();
            self.observe_idle();

            if self.is_terminal() {
                info!("Frontier drained and workers idle, crawl complete");
                break;
            }
            if draining && self.all_slots_idle() {
                info!("Shutdown drain complete, {} URLs left in frontier", self.frontier.len());
                break;
            }

            if last_progress.elapsed() >= self.progress_interval {
                info!(
                    "Progress: {}, {} in frontier, {} seen",
                    self.stats.summary(),
                    self.frontier.len(),
                    self.frontier.seen_count()
                );
                last_progress = Instant::now();
            }

            if !drained_any {
                tokio::select! {
                    _ = sleep(self.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        info!("Crawl finished: {}", self.stats.summary());
        Ok(self.stats)
    }
}
