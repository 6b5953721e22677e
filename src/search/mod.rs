pub mod elastic;
pub mod fallback;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

pub use elastic::ElasticIndex;
pub use fallback::StoreScanBackend;

use crate::crawler::task::ContentRecord;

/// Write side of the search index: per-document upsert keyed by the content
/// key, so re-indexing a URL overwrites instead of duplicating.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Insert or overwrite the document for this record
    async fn upsert(&self, record: &ContentRecord) -> Result<()>;

    /// Cheap reachability probe, used by the health endpoint
    async fn is_reachable(&self) -> bool;
}

/// A single search result
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub score: f64,
    pub url: String,
    pub title: String,
    pub description: String,
    pub highlights: Vec<String>,
}

/// Read side of search: a backend that can answer a query
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Short name used in logs when falling through the backend list
    fn name(&self) -> &'static str;

    /// Run the query, returning up to `limit` hits ranked by score
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>>;
}

/// Try each backend in order, returning the first successful answer. An
/// empty result from a working backend is an answer, not a failure; only
/// backend errors fall through to the next strategy.
pub async fn search_tiered(
    backends: &[Arc<dyn SearchBackend>],
    query: &str,
    limit: usize,
) -> Result<Vec<SearchHit>> {
    let mut last_error = None;

    for backend in backends {
        match backend.search(query, limit).await {
            Ok(hits) => return Ok(hits),
            Err(e) => {
                warn!("Search backend '{}' failed: {}", backend.name(), e);
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(e) => Err(e.context("All search backends failed")),
        None => Ok(Vec::new()),
    }
}
