use std::collections::{HashMap, HashSet, VecDeque};

use regex::Regex;
use tracing::{debug, warn};

use crate::cli::config::{CrawlSettings, UrlPatterns};
use crate::crawler::task::{canonicalize, domain_of};

/// A discovered URL waiting to be dispatched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontierEntry {
    /// Canonical URL
    pub url: String,

    /// Depth in the crawl tree
    pub depth: u32,

    /// Host the URL belongs to
    pub domain: String,
}

/// The URL frontier: discovered-but-not-yet-processed URLs plus the dedup
/// and scope state that decides what may join it.
///
/// Owned and mutated exclusively by the coordinator; workers never touch it.
/// The seen set only grows, and an entry is consumed exactly once into a
/// dispatched task.
pub struct Frontier {
    /// Scope configuration for the crawl
    config: CrawlSettings,

    /// FIFO queue of entries awaiting dispatch
    queue: VecDeque<FrontierEntry>,

    /// Canonical URLs currently sitting in the queue
    queued: HashSet<String>,

    /// Canonical URLs that have been dispatched or resolved; never shrinks
    seen: HashSet<String>,

    /// URLs accepted per domain, counted at enqueue time so in-flight work
    /// cannot overshoot the cap
    domain_counts: HashMap<String, u32>,

    /// Compiled regex patterns for URL inclusion
    include_patterns: Vec<Regex>,

    /// Compiled regex patterns for URL exclusion
    exclude_patterns: Vec<Regex>,
}

impl Frontier {
    /// Create an empty frontier with the given crawl settings
    pub fn new(config: CrawlSettings) -> Self {
        let include_patterns = Self::compile_patterns(&config.url_patterns.include);
        let exclude_patterns = Self::compile_patterns(&config.url_patterns.exclude);

        Self {
            config,
            queue: VecDeque::new(),
            queued: HashSet::new(),
            seen: HashSet::new(),
            domain_counts: HashMap::new(),
            include_patterns,
            exclude_patterns,
        }
    }

    fn compile_patterns(patterns: &[String]) -> Vec<Regex> {
        patterns
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    warn!("Invalid URL pattern '{}': {}", pattern, e);
                    None
                }
            })
            .collect()
    }

    /// Offer a discovered URL to the frontier. Canonicalizes, applies every
    /// scope rule, and enqueues on acceptance. Returns the canonical URL if
    /// the entry was enqueued.
    pub fn offer(&mut self, raw_url: &str, depth: u32) -> Option<String> {
        let Some(url) = canonicalize(raw_url) else {
            debug!("Skipping uncanonicalizable URL: {}", raw_url);
            return None;
        };

        if depth > self.config.max_depth {
            debug!("Skipping URL beyond max depth {}: {}", self.config.max_depth, url);
            return None;
        }

        if self.seen.contains(&url) || self.queued.contains(&url) {
            debug!("Skipping already known URL: {}", url);
            return None;
        }

        let Some(domain) = domain_of(&url) else {
            return None;
        };

        if self
            .config
            .restricted_domains
            .iter()
            .any(|restricted| domain.contains(restricted.as_str()))
        {
            debug!("Skipping URL from restricted domain: {}", domain);
            return None;
        }

        let count = self.domain_counts.get(&domain).copied().unwrap_or(0);
        if count >= self.config.max_per_domain {
            debug!("Skipping URL, domain cap reached for {}", domain);
            return None;
        }

        for pattern in &self.exclude_patterns {
            if pattern.is_match(&url) {
                debug!("Skipping URL matching exclusion pattern: {}", url);
                return None;
            }
        }

        if !self.include_patterns.is_empty()
            && !self.include_patterns.iter().any(|p| p.is_match(&url))
        {
            debug!("Skipping URL not matching any inclusion pattern: {}", url);
            return None;
        }

        self.domain_counts.insert(domain.clone(), count + 1);
        self.queued.insert(url.clone());
        self.queue.push_back(FrontierEntry {
            url: url.clone(),
            depth,
            domain,
        });

        Some(url)
    }

    /// Consume the next entry in insertion order. The URL joins the seen set
    /// here, at dispatch time, so a URL is never dispatched twice even while
    /// its first attempt is still in flight.
    pub fn pop(&mut self) -> Option<FrontierEntry> {
        let entry = self.queue.pop_front()?;
        self.queued.remove(&entry.url);
        self.seen.insert(entry.url.clone());
        Some(entry)
    }

    /// Record a URL as seen without it passing through the queue. Used for
    /// result ingestion (idempotent) and for seen-set reconstruction from
    /// the content store after a restart.
    pub fn mark_seen(&mut self, url: &str) {
        if let Some(canonical) = canonicalize(url) {
            self.seen.insert(canonical);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings() -> CrawlSettings {
        CrawlSettings {
            max_depth: 2,
            max_per_domain: 50,
            request_delay_ms: 0,
            request_timeout_secs: 10,
            restricted_domains: vec!["blocked.test".to_string()],
            url_patterns: UrlPatterns {
                include: vec![],
                exclude: vec![r"\.(jpg|png|css|js)$".to_string()],
            },
            links_per_page: 10,
            user_agent: "webtrawl/1.0".to_string(),
            num_crawlers: 2,
            num_indexers: 1,
        }
    }

    #[test]
    fn deduplicates_on_canonical_form() {
        let mut frontier = Frontier::new(test_settings());

        assert!(frontier.offer("https://a.test/p2", 0).is_some());
        // Same page, fragment and query stripped away
        assert!(frontier.offer("https://a.test/p2#frag", 0).is_none());
        assert!(frontier.offer("https://a.test/p2?utm=x", 0).is_none());
        assert_eq!(frontier.len(), 1);
    }

    #[test]
    fn seed_page_links_collapse_to_two_children() {
        // Scenario: page links to /p1, /p2 and /p2#frag at max_depth 1
        let mut settings = test_settings();
        settings.max_depth = 1;
        let mut frontier = Frontier::new(settings);

        let accepted: Vec<_> = ["https://a.test/p1", "https://a.test/p2", "https://a.test/p2#frag"]
            .iter()
            .filter_map(|link| frontier.offer(link, 1))
            .collect();

        assert_eq!(accepted, vec!["https://a.test/p1", "https://a.test/p2"]);
    }

    #[test]
    fn rejects_beyond_max_depth() {
        let mut frontier = Frontier::new(test_settings());

        assert!(frontier.offer("https://a.test/ok", 2).is_some());
        assert!(frontier.offer("https://a.test/too-deep", 3).is_none());
    }

    #[test]
    fn enforces_domain_cap_at_enqueue_time() {
        let mut settings = test_settings();
        settings.max_per_domain = 2;
        let mut frontier = Frontier::new(settings);

        let accepted = (0..5)
            .filter_map(|i| frontier.offer(&format!("https://a.test/p{}", i), 1))
            .count();

        assert_eq!(accepted, 2);
        assert!(frontier.offer("https://a.test/p5", 1).is_none());
        // Other domains are unaffected
        assert!(frontier.offer("https://b.test/p0", 1).is_some());
    }

    #[test]
    fn rejects_restricted_domains() {
        let mut frontier = Frontier::new(test_settings());

        assert!(frontier.offer("https://blocked.test/page", 0).is_none());
        assert!(frontier.offer("https://sub.blocked.test/page", 0).is_none());
        assert!(frontier.offer("https://allowed.test/page", 0).is_some());
    }

    #[test]
    fn applies_exclusion_patterns() {
        let mut frontier = Frontier::new(test_settings());

        assert!(frontier.offer("https://a.test/logo.png", 0).is_none());
        assert!(frontier.offer("https://a.test/page", 0).is_some());
    }

    #[test]
    fn pop_is_fifo_and_marks_seen() {
        let mut frontier = Frontier::new(test_settings());

        frontier.offer("https://a.test/first", 0);
        frontier.offer("https://a.test/second", 0);

        let first = frontier.pop().unwrap();
        assert_eq!(first.url, "https://a.test/first");
        assert_eq!(first.domain, "a.test");

        // Dispatched URLs may not re-enter the frontier, even before their
        // result has been ingested
        assert!(frontier.offer("https://a.test/first", 1).is_none());

        assert_eq!(frontier.pop().unwrap().url, "https://a.test/second");
        assert!(frontier.pop().is_none());
    }

    #[test]
    fn mark_seen_blocks_future_offers() {
        let mut frontier = Frontier::new(test_settings());

        frontier.mark_seen("https://a.test/done?session=1");
        assert!(frontier.offer("https://a.test/done", 0).is_none());
        assert_eq!(frontier.seen_count(), 1);
    }
}
