use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, Context, anyhow};
use scraper::{Html, Selector};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::storage::ContentStore;
use crate::transport::{self, TaskTransport, CRAWL_QUEUE, INDEX_QUEUE, RESULT_QUEUE};
use super::robots::RobotsCache;
use super::task::{
    canonicalize, content_key, ContentRecord, CrawlResult, CrawlStatus, CrawlTask, IndexRequest,
};

/// Everything extracted from a fetched page in one parsing pass
struct PageExtract {
    title: String,
    description: String,
    text: String,
    links: Vec<String>,
}

/// A crawl worker: pulls tasks from the crawl queue, fetches and parses the
/// page, hands the crawled record to the index worker, and reports exactly
/// one result per attempt back to the coordinator.
///
/// Workers are stateless with respect to the frontier; every scope decision
/// beyond robots compliance belongs to the coordinator.
pub struct CrawlWorker {
    /// Worker id, used only in logs
    id: String,

    client: reqwest::Client,
    robots: RobotsCache,
    transport: Arc<dyn TaskTransport>,
    store: Arc<dyn ContentStore>,

    /// Maximum links extracted per page, to bound fan-out
    links_per_page: usize,

    user_agent: String,

    /// Sleep between polls when the task queue is empty
    poll_interval: Duration,
}

impl CrawlWorker {
    pub fn new(
        transport: Arc<dyn TaskTransport>,
        store: Arc<dyn ContentStore>,
        user_agent: String,
        links_per_page: usize,
        poll_interval: Duration,
    ) -> Self {
        let client = reqwest::Client::new();

        Self {
            id: Uuid::new_v4().to_string(),
            robots: RobotsCache::new(client.clone(), user_agent.clone()),
            client,
            transport,
            store,
            links_per_page,
            user_agent,
            poll_interval,
        }
    }

    /// Pull and process tasks until shutdown is signalled
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Crawl worker {} started", self.id);

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.transport.receive(CRAWL_QUEUE).await {
                Ok(Some(delivery)) => {
                    let task: CrawlTask = match serde_json::from_str(&delivery.payload) {
                        Ok(task) => task,
                        Err(e) => {
                            warn!("Worker {} discarding malformed task: {}", self.id, e);
                            self.transport.ack(CRAWL_QUEUE, &delivery.handle).await?;
                            continue;
                        }
                    };

                    debug!(
                        "Worker {} processing {} (depth {}, attempt {})",
                        self.id, task.url, task.depth, delivery.delivery_count
                    );

                    match self.process(&task).await {
                        Ok(result) => {
                            // Report the result, then ack; if the report fails
                            // the lease expires and the task is redelivered
                            transport::send_json(&self.transport, RESULT_QUEUE, &result).await?;
                            self.transport.ack(CRAWL_QUEUE, &delivery.handle).await?;
                        }
                        Err(e) => {
                            // Queue-side failure: leave the task unacked so
                            // the queue redelivers it after the lease expires
                            error!("Worker {} failed to hand off {}: {}", self.id, task.url, e);
                        }
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    error!("Worker {} transport error: {}", self.id, e);
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        info!("Crawl worker {} shutting down", self.id);

        Ok(())
    }

    /// Process one task into exactly one result. Fetch and parse failures
    /// map onto result statuses; only a queue failure returns an error,
    /// which withholds the ack so the attempt repeats.
    pub async fn process(&self, task: &CrawlTask) -> Result<CrawlResult> {
        let Ok(url) = Url::parse(&task.url) else {
            warn!("Worker {} received unparseable URL: {}", self.id, task.url);
            return Ok(self.result(task, CrawlStatus::NetworkError, Vec::new(), None));
        };

        let canonical = canonicalize(&task.url).unwrap_or_else(|| task.url.clone());
        let key = content_key(&canonical);

        // Content already stored means a previous attempt for this URL
        // completed; at-least-once delivery makes this path routine
        if self.store.exists(&key).await.unwrap_or(false) {
            debug!("Worker {} skipping already stored URL: {}", self.id, canonical);
            return Ok(self.result(task, CrawlStatus::SkippedDuplicate, Vec::new(), Some(key)));
        }

        // Robots check happens before any page traffic
        let rules = self.robots.rules_for(&url).await;
        if !rules.is_allowed(url.path()) {
            debug!("Worker {} disallowed by robots.txt: {}", self.id, task.url);
            return Ok(self.result(task, CrawlStatus::Disallowed, Vec::new(), None));
        }

        // Politeness delay: the larger of the configured delay and the
        // domain's crawl-delay
        let delay = Duration::from_millis(task.scope.request_delay_ms).max(rules.crawl_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let response = match self
            .client
            .get(url.clone())
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .timeout(Duration::from_secs(task.scope.request_timeout_secs))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                debug!("Worker {} fetch failed for {}: {}", self.id, task.url, e);
                return Ok(self.result(task, CrawlStatus::NetworkError, Vec::new(), None));
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Ok(self.result(
                task,
                CrawlStatus::HttpError(status.as_u16()),
                Vec::new(),
                None,
            ));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !content_type.contains("text/html") && !content_type.contains("xhtml") {
            return Ok(self.result(task, CrawlStatus::NotHtml, Vec::new(), None));
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                debug!("Worker {} failed to read body for {}: {}", self.id, task.url, e);
                return Ok(self.result(task, CrawlStatus::NetworkError, Vec::new(), None));
            }
        };

        let page = match extract_page(&url, &body, self.links_per_page) {
            Ok(page) => page,
            Err(e) => {
                warn!("Worker {} failed to parse {}: {}", self.id, task.url, e);
                return Ok(self.result(task, CrawlStatus::NetworkError, Vec::new(), None));
            }
        };

        let record = ContentRecord {
            url: canonical.clone(),
            title: page.title,
            description: page.description,
            text_content: page.text,
            html: Some(body),
            crawl_timestamp: chrono::Utc::now().timestamp(),
            depth: task.depth,
            content_key: key.clone(),
        };

        // Persistence belongs to the index worker: a lost handoff is fatal
        // to this attempt, so the error propagates instead of being mapped
        // to a result status
        let handoff = IndexRequest {
            url: canonical,
            content_key: key.clone(),
            depth: task.depth,
            record,
        };
        transport::send_json(&self.transport, INDEX_QUEUE, &handoff)
            .await
            .context("Failed to hand content off to the indexer")?;

        Ok(self.result(task, CrawlStatus::Success, page.links, Some(key)))
    }

    fn result(
        &self,
        task: &CrawlTask,
        status: CrawlStatus,
        extracted_links: Vec<String>,
        content_key: Option<String>,
    ) -> CrawlResult {
        CrawlResult {
            url: task.url.clone(),
            depth: task.depth,
            status,
            extracted_links,
            content_key,
        }
    }
}

/// Parse a fetched page in one pass: title, meta description, visible text,
/// and up to `link_cap` unique canonicalized links in document order.
fn extract_page(base: &Url, body: &str, link_cap: usize) -> Result<PageExtract> {
    let document = Html::parse_document(body);

    let title_selector =
        Selector::parse("title").map_err(|e| anyhow!("invalid title selector: {}", e))?;
    let meta_selector = Selector::parse(r#"meta[name="description"]"#)
        .map_err(|e| anyhow!("invalid meta selector: {}", e))?;
    let anchor_selector =
        Selector::parse("a[href]").map_err(|e| anyhow!("invalid anchor selector: {}", e))?;

    let title = document
        .select(&title_selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "No Title".to_string());

    let description = document
        .select(&meta_selector)
        .next()
        .and_then(|el| el.value().attr("content"))
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| "No description".to_string());

    let mut raw_text = String::new();
    collect_visible_text(document.tree.root(), &mut raw_text);
    let text = raw_text.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut links = Vec::new();
    let mut in_page_seen = HashSet::new();
    for anchor in document.select(&anchor_selector) {
        if links.len() >= link_cap {
            break;
        }
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        // Resolve relative hrefs against the page URL
        let Ok(resolved) = base.join(href) else {
            continue;
        };
        let Some(canonical) = canonicalize(resolved.as_str()) else {
            continue;
        };
        if in_page_seen.insert(canonical.clone()) {
            links.push(canonical);
        }
    }

    Ok(PageExtract {
        title,
        description,
        text,
        links,
    })
}

/// Collect text nodes, skipping script and style subtrees
fn collect_visible_text(node: ego_tree::NodeRef<'_, scraper::Node>, out: &mut String) {
    match node.value() {
        scraper::Node::Text(text) => {
            out.push_str(text);
            out.push(' ');
        }
        scraper::Node::Element(element) => {
            if element.name() == "script" || element.name() == "style" {
                return;
            }
            for child in node.children() {
                collect_visible_text(child, out);
            }
        }
        _ => {
            for child in node.children() {
                collect_visible_text(child, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::task::ScopeConfig;
    use crate::storage::FsContentStore;
    use crate::transport::MemoryTransport;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PAGE: &str = r#"<html>
<head>
  <title>Test Page</title>
  <meta name="description" content="A page for tests">
  <style>body { color: red; }</style>
</head>
<body>
  <script>var hidden = "should not appear";</script>
  <p>Visible body text.</p>
  <a href="/p1">One</a>
  <a href="/p2">Two</a>
  <a href="/p2#frag">Two again</a>
  <a href="mailto:x@a.test">Mail</a>
</body>
</html>"#;

    fn scope() -> ScopeConfig {
        ScopeConfig {
            max_depth: 2,
            restricted_domains: vec![],
            request_delay_ms: 0,
            request_timeout_secs: 5,
        }
    }

    fn task(url: &str) -> CrawlTask {
        CrawlTask {
            url: url.to_string(),
            depth: 0,
            scope: scope(),
        }
    }

    async fn worker_with_store() -> (tempfile::TempDir, Arc<dyn TaskTransport>, Arc<dyn ContentStore>, CrawlWorker)
    {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ContentStore> =
            Arc::new(FsContentStore::new(dir.path().to_path_buf()).await.unwrap());
        let transport: Arc<dyn TaskTransport> =
            Arc::new(MemoryTransport::new(Duration::from_secs(30), 3));
        let worker = CrawlWorker::new(
            transport.clone(),
            store.clone(),
            "webtrawl/0.1".to_string(),
            10,
            Duration::from_millis(10),
        );
        (dir, transport, store, worker)
    }

    #[test]
    fn extracts_title_description_text_and_links() {
        let base = Url::parse("https://a.test/").unwrap();
        let page = extract_page(&base, PAGE, 10).unwrap();

        assert_eq!(page.title, "Test Page");
        assert_eq!(page.description, "A page for tests");
        assert!(page.text.contains("Visible body text."));
        // Script and style content never reaches the index
        assert!(!page.text.contains("should not appear"));
        assert!(!page.text.contains("color: red"));

        // /p2#frag collapses onto /p2; the mailto link is dropped
        assert_eq!(
            page.links,
            vec!["https://a.test/p1", "https://a.test/p2"]
        );
    }

    #[test]
    fn caps_links_per_page() {
        let anchors: String = (0..25)
            .map(|i| format!(r#"<a href="/page{}">x</a>"#, i))
            .collect();
        let body = format!("<html><body>{}</body></html>", anchors);

        let base = Url::parse("https://a.test/").unwrap();
        let page = extract_page(&base, &body, 10).unwrap();
        assert_eq!(page.links.len(), 10);
        assert_eq!(page.links[0], "https://a.test/page0");
    }

    #[test]
    fn missing_title_and_description_get_defaults() {
        let base = Url::parse("https://a.test/").unwrap();
        let page = extract_page(&base, "<html><body>hello</body></html>", 10).unwrap();

        assert_eq!(page.title, "No Title");
        assert_eq!(page.description, "No description");
    }

    #[tokio::test]
    async fn successful_crawl_hands_record_to_indexer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(PAGE, "text/html; charset=utf-8"),
            )
            .mount(&server)
            .await;

        let (_dir, transport, store, worker) = worker_with_store().await;
        let result = worker.process(&task(&format!("{}/", server.uri()))).await.unwrap();

        assert_eq!(result.status, CrawlStatus::Success);
        assert_eq!(result.extracted_links.len(), 2);

        // The full record travels on the index queue; persistence is the
        // index worker's job
        let key = result.content_key.unwrap();
        let delivery = transport.receive(INDEX_QUEUE).await.unwrap().unwrap();
        let handoff: IndexRequest = serde_json::from_str(&delivery.payload).unwrap();
        assert_eq!(handoff.content_key, key);
        assert_eq!(handoff.record.title, "Test Page");
        assert_eq!(handoff.record.depth, 0);
        assert!(handoff.record.html.is_some());
        assert!(store.list_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn robots_disallowed_path_is_never_fetched() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("User-agent: *\nDisallow: /private\n"),
            )
            .mount(&server)
            .await;
        // No mock for /private/x: a fetch attempt would fail the test below
        // with an unexpected 404 result rather than Disallowed

        let (_dir, _transport, store, worker) = worker_with_store().await;
        let result = worker
            .process(&task(&format!("{}/private/x", server.uri())))
            .await
            .unwrap();

        assert_eq!(result.status, CrawlStatus::Disallowed);
        assert!(result.extracted_links.is_empty());
        assert!(store.list_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_html_response_is_reported_not_stored() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("{}", "application/json"))
            .mount(&server)
            .await;

        let (_dir, _transport, store, worker) = worker_with_store().await;
        let result = worker
            .process(&task(&format!("{}/data", server.uri())))
            .await
            .unwrap();

        assert_eq!(result.status, CrawlStatus::NotHtml);
        assert!(store.list_keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn http_error_carries_the_status_code() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let (_dir, _transport, _store, worker) = worker_with_store().await;
        let result = worker
            .process(&task(&format!("{}/gone", server.uri())))
            .await
            .unwrap();

        assert_eq!(result.status, CrawlStatus::HttpError(404));
    }

    #[tokio::test]
    async fn connection_failure_maps_to_network_error() {
        let (_dir, _transport, _store, worker) = worker_with_store().await;

        // Port 1 refuses connections; robots fetch fails too and defaults
        // to crawl-allowed
        let result = worker.process(&task("http://127.0.0.1:1/page")).await.unwrap();

        assert_eq!(result.status, CrawlStatus::NetworkError);
    }

    #[tokio::test]
    async fn already_stored_url_is_skipped_without_fetching() {
        let (_dir, _transport, store, worker) = worker_with_store().await;

        let url = "http://127.0.0.1:1/page";
        let canonical = canonicalize(url).unwrap();
        let record = ContentRecord {
            url: canonical.clone(),
            title: "Stored".to_string(),
            description: "d".to_string(),
            text_content: "t".to_string(),
            html: None,
            crawl_timestamp: 0,
            depth: 0,
            content_key: content_key(&canonical),
        };
        store.put(&record).await.unwrap();

        // The unreachable host proves no network traffic happened: a fetch
        // attempt would have produced NetworkError
        let result = worker.process(&task(url)).await.unwrap();
        assert_eq!(result.status, CrawlStatus::SkippedDuplicate);
        assert_eq!(result.content_key, Some(record.content_key));
    }
}
