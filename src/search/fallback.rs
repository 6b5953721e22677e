use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::storage::ContentStore;
use super::{SearchBackend, SearchHit};

/// Maximum highlight fragments per hit
const MAX_HIGHLIGHTS: usize = 3;

/// Last-resort search backend that scans the plain-text sidecars in the
/// content store, scoring by term occurrence counts. Slow but dependency-free,
/// so search keeps answering while the index is down or being backfilled.
pub struct StoreScanBackend {
    store: Arc<dyn ContentStore>,
}

impl StoreScanBackend {
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self { store }
    }

    /// Score a document by counting term occurrences, case-insensitively
    fn score(text_lower: &str, terms: &[String]) -> usize {
        terms
            .iter()
            .map(|term| text_lower.matches(term.as_str()).count())
            .sum()
    }

    /// Pull the header fields back out of the sidecar format
    fn parse_header(text: &str) -> (String, String, String) {
        let mut lines = text.lines();
        let url = lines
            .next()
            .and_then(|l| l.strip_prefix("URL: "))
            .unwrap_or_default()
            .to_string();
        let title = lines
            .next()
            .and_then(|l| l.strip_prefix("Title: "))
            .unwrap_or("Unknown Title")
            .to_string();
        let description = lines
            .next()
            .and_then(|l| l.strip_prefix("Description: "))
            .unwrap_or_default()
            .to_string();
        (url, title, description)
    }

    /// Sentences from the body that contain any query term
    fn highlights(text: &str, terms: &[String]) -> Vec<String> {
        let body = text.splitn(2, "\n\n").nth(1).unwrap_or("");

        body.split('.')
            .filter(|sentence| {
                let lower = sentence.to_lowercase();
                terms.iter().any(|term| lower.contains(term.as_str()))
            })
            .map(|sentence| sentence.trim().to_string())
            .filter(|sentence| !sentence.is_empty())
            .take(MAX_HIGHLIGHTS)
            .collect()
    }
}

#[async_trait]
impl SearchBackend for StoreScanBackend {
    fn name(&self) -> &'static str {
        "store-scan"
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let terms: Vec<String> = query
            .split_whitespace()
            .map(|term| term.to_lowercase())
            .collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        info!("Falling back to content store scan for '{}'", query);

        let mut hits = Vec::new();
        for key in self.store.list_keys().await? {
            let Some(text) = self.store.read_text(&key).await? else {
                continue;
            };

            let score = Self::score(&text.to_lowercase(), &terms);
            if score == 0 {
                continue;
            }

            let (url, title, description) = Self::parse_header(&text);
            hits.push(SearchHit {
                score: score as f64,
                url,
                title,
                description,
                highlights: Self::highlights(&text, &terms),
            });
        }

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);

        Ok(hits)
    }
}
