use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Result, Context};
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::cli::config::SearchSettings;
use crate::crawler::task::ContentRecord;
use super::{SearchBackend, SearchHit, SearchIndex};

/// Timeout for the cluster health probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Elasticsearch/OpenSearch-compatible search index spoken over plain REST.
///
/// Documents are upserted under their content key, so indexing is idempotent.
/// Queries weight title over description over body text.
pub struct ElasticIndex {
    client: reqwest::Client,
    endpoint: String,
    index: String,
    mapping_ensured: AtomicBool,
}

impl ElasticIndex {
    pub fn new(client: reqwest::Client, settings: &SearchSettings) -> Self {
        Self {
            client,
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
            index: settings.index.clone(),
            mapping_ensured: AtomicBool::new(false),
        }
    }

    /// Create the index with an explicit field mapping if it does not exist.
    /// Checked once per process; concurrent creation races resolve to the
    /// same mapping on the server side.
    async fn ensure_index(&self) -> Result<()> {
        if self.mapping_ensured.load(Ordering::Relaxed) {
            return Ok(());
        }

        let index_url = format!("{}/{}", self.endpoint, self.index);
        let head = self
            .client
            .head(&index_url)
            .send()
            .await
            .context("Failed to check search index existence")?;

        if head.status() == reqwest::StatusCode::NOT_FOUND {
            let mapping = json!({
                "mappings": {
                    "properties": {
                        "url": {"type": "keyword"},
                        "title": {"type": "text", "analyzer": "standard"},
                        "description": {"type": "text", "analyzer": "standard"},
                        "text_content": {"type": "text", "analyzer": "standard"},
                        "crawl_timestamp": {"type": "date", "format": "epoch_second"},
                        "depth": {"type": "integer"},
                        "content_key": {"type": "keyword"}
                    }
                }
            });

            let created = self
                .client
                .put(&index_url)
                .json(&mapping)
                .send()
                .await
                .context("Failed to create search index")?;

            // A concurrent creator may win the race; both outcomes are fine
            if created.status().is_success() {
                info!("Created search index: {}", self.index);
            } else {
                debug!(
                    "Search index creation returned {}, continuing",
                    created.status()
                );
            }
        }

        self.mapping_ensured.store(true, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl SearchIndex for ElasticIndex {
    async fn upsert(&self, record: &ContentRecord) -> Result<()> {
        self.ensure_index().await?;

        let doc = json!({
            "url": record.url,
            "title": record.title,
            "description": record.description,
            "text_content": record.text_content,
            "crawl_timestamp": record.crawl_timestamp,
            "depth": record.depth,
            "content_key": record.content_key,
        });

        let doc_url = format!("{}/{}/_doc/{}", self.endpoint, self.index, record.content_key);
        let response = self
            .client
            .put(&doc_url)
            .json(&doc)
            .send()
            .await
            .context("Failed to send index upsert")?;

        if !response.status().is_success() {
            anyhow::bail!(
                "Index upsert for {} failed with status {}",
                record.url,
                response.status()
            );
        }

        debug!("Indexed {} as document {}", record.url, record.content_key);

        Ok(())
    }

    async fn is_reachable(&self) -> bool {
        let health_url = format!("{}/_cluster/health", self.endpoint);
        match self
            .client
            .get(&health_url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!("Search index health probe failed: {}", e);
                false
            }
        }
    }
}

#[async_trait]
impl SearchBackend for ElasticIndex {
    fn name(&self) -> &'static str {
        "search-index"
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let body = json!({
            "query": {
                "multi_match": {
                    "query": query,
                    "fields": ["title^2", "description^1.5", "text_content"],
                    "type": "best_fields"
                }
            },
            "highlight": {
                "fields": {
                    "text_content": {"fragment_size": 150, "number_of_fragments": 3}
                }
            },
            "_source": ["url", "title", "description", "crawl_timestamp"],
            "size": limit
        });

        let search_url = format!("{}/{}/_search", self.endpoint, self.index);
        let response = self
            .client
            .post(&search_url)
            .json(&body)
            .send()
            .await
            .context("Failed to execute index search")?;

        // A missing index just means nothing has been indexed yet
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!("Search index {} does not exist yet", self.index);
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            anyhow::bail!("Index search failed with status {}", response.status());
        }

        let parsed: serde_json::Value = response
            .json()
            .await
            .context("Failed to parse search response")?;

        let mut hits = Vec::new();
        if let Some(raw_hits) = parsed["hits"]["hits"].as_array() {
            for raw in raw_hits {
                let source = &raw["_source"];
                let highlights = raw["highlight"]["text_content"]
                    .as_array()
                    .map(|fragments| {
                        fragments
                            .iter()
                            .filter_map(|f| f.as_str().map(|s| s.to_string()))
                            .collect()
                    })
                    .unwrap_or_default();

                hits.push(SearchHit {
                    score: raw["_score"].as_f64().unwrap_or(0.0),
                    url: source["url"].as_str().unwrap_or_default().to_string(),
                    title: source["title"].as_str().unwrap_or_default().to_string(),
                    description: source["description"].as_str().unwrap_or_default().to_string(),
                    highlights,
                });
            }
        }

        Ok(hits)
    }
}
