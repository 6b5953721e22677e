use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::crawler::task::IndexRequest;
use crate::search::SearchIndex;
use crate::storage::ContentStore;
use crate::transport::{TaskTransport, INDEX_QUEUE};

/// Drains the indexer queue: persists crawled content and mirrors it into
/// the search index.
///
/// Storage is the source of truth. If the search index rejects a document
/// the request is still acknowledged, leaving the content store-only until
/// the URL is crawled again. Only a storage failure leaves the message on
/// the queue for redelivery.
pub struct IndexWorker {
    id: String,

    transport: Arc<dyn TaskTransport>,

    store: Arc<dyn ContentStore>,

    /// None when indexing is disabled; content is still persisted
    index: Option<Arc<dyn SearchIndex>>,

    /// Sleep between polls when the indexer queue is empty
    poll_interval: Duration,
}

impl IndexWorker {
    pub fn new(
        transport: Arc<dyn TaskTransport>,
        store: Arc<dyn ContentStore>,
        index: Option<Arc<dyn SearchIndex>>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            transport,
            store,
            index,
            poll_interval,
        }
    }

    /// Pull and process index requests until shutdown is signalled
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Index worker {} started", self.id);

        loop {
            if *shutdown.borrow() {
                info!("Index worker {} shutting down", self.id);
                return Ok(());
            }

            let delivery = match self.transport.receive(INDEX_QUEUE).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    tokio::select! {
                        _ = sleep(self.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
                Err(e) => {
                    warn!("Index worker {} failed to poll the queue: {}", self.id, e);
                    sleep(self.poll_interval).await;
                    continue;
                }
            };

            let request: IndexRequest = match serde_json::from_str(&delivery.payload) {
                Ok(request) => request,
                Err(e) => {
                    warn!("Discarding malformed index request: {}", e);
                    self.transport.ack(INDEX_QUEUE, &delivery.handle).await?;
                    continue;
                }
            };

            match self.handle(&request).await {
                Ok(_) => {
                    self.transport.ack(INDEX_QUEUE, &delivery.handle).await?;
                }
                Err(e) => {
                    // No ack: the visibility timeout will redeliver, up to
                    // the queue's delivery budget
                    warn!(
                        "Index worker {} failed on {} (delivery {}): {}",
                        self.id, request.url, delivery.delivery_count, e
                    );
                }
            }
        }
    }

    /// Process one index request: persist the record, then mirror it into
    /// the search index. Returns Err only on a storage failure, which is
    /// the one case worth a redelivery.
    pub async fn handle(&self, request: &IndexRequest) -> Result<()> {
        let record = &request.record;

        self.store
            .put(record)
            .await
            .with_context(|| format!("Failed to persist content for {}", record.url))?;

        if let Some(index) = &self.index {
            if let Err(e) = index.upsert(record).await {
                // Store-only degradation: content is safe on disk, search
                // just lags behind
                warn!("Search index rejected {}: {}", record.url, e);
            } else {
                debug!("Indexed {} as {}", record.url, record.content_key);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::task::{content_key, ContentRecord};
    use crate::storage::content::FsContentStore;
    use crate::transport::memory::MemoryTransport;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Records upserts; optionally fails every call.
    struct FakeIndex {
        docs: Mutex<HashMap<String, String>>,
        fail: bool,
    }

    impl FakeIndex {
        fn new(fail: bool) -> Self {
            Self {
                docs: Mutex::new(HashMap::new()),
                fail,
            }
        }
    }

    #[async_trait]
    impl SearchIndex for FakeIndex {
        async fn upsert(&self, record: &ContentRecord) -> Result<()> {
            if self.fail {
                anyhow::bail!("index unavailable");
            }
            self.docs
                .lock()
                .unwrap()
                .insert(record.content_key.clone(), record.url.clone());
            Ok(())
        }

        async fn is_reachable(&self) -> bool {
            !self.fail
        }
    }

    fn record_for(url: &str) -> ContentRecord {
        ContentRecord {
            url: url.to_string(),
            title: "Title".to_string(),
            description: "No description".to_string(),
            text_content: "some text".to_string(),
            html: None,
            crawl_timestamp: 1_700_000_000,
            depth: 0,
            content_key: content_key(url),
        }
    }

    async fn worker_with(
        index: Option<Arc<FakeIndex>>,
    ) -> (IndexWorker, Arc<FsContentStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsContentStore::new(dir.path().to_path_buf()).await.unwrap());
        let transport = Arc::new(MemoryTransport::new(Duration::from_secs(300), 3));
        let worker = IndexWorker::new(
            transport as Arc<dyn TaskTransport>,
            store.clone() as Arc<dyn ContentStore>,
            index.map(|ix| ix as Arc<dyn SearchIndex>),
            Duration::from_millis(10),
        );
        (worker, store, dir)
    }

    fn request_for(record: ContentRecord) -> IndexRequest {
        IndexRequest {
            url: record.url.clone(),
            content_key: record.content_key.clone(),
            depth: record.depth,
            record,
        }
    }

    #[tokio::test]
    async fn record_is_persisted_and_indexed() {
        let index = Arc::new(FakeIndex::new(false));
        let (worker, store, _dir) = worker_with(Some(index.clone())).await;

        let record = record_for("https://a.test/page");
        let key = record.content_key.clone();
        let url = record.url.clone();

        worker.handle(&request_for(record)).await.unwrap();

        assert!(store.exists(&key).await.unwrap());
        let docs = index.docs.lock().unwrap();
        assert_eq!(docs.get(&key).unwrap(), &url);
    }

    #[tokio::test]
    async fn index_failure_degrades_to_store_only() {
        let index = Arc::new(FakeIndex::new(true));
        let (worker, store, _dir) = worker_with(Some(index)).await;

        let record = record_for("https://a.test/degraded");
        let key = record.content_key.clone();

        // Still Ok: the content landed in the store
        worker.handle(&request_for(record)).await.unwrap();
        assert!(store.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn indexing_disabled_still_persists_content() {
        let (worker, store, _dir) = worker_with(None).await;

        let record = record_for("https://a.test/noindex");
        let key = record.content_key.clone();

        worker.handle(&request_for(record)).await.unwrap();
        assert!(store.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn redelivered_request_keeps_one_document() {
        let index = Arc::new(FakeIndex::new(false));
        let (worker, _store, _dir) = worker_with(Some(index.clone())).await;

        let request = request_for(record_for("https://a.test/again"));

        // At-least-once delivery: the same request may arrive twice
        worker.handle(&request).await.unwrap();
        worker.handle(&request).await.unwrap();
        assert_eq!(index.docs.lock().unwrap().len(), 1);
    }
}
