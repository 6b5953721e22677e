use serde::Serialize;
use std::time::Instant;

/// Running counters for a crawl session.
///
/// Counters are owned and mutated by the coordinator only, so no
/// synchronization is needed.
#[derive(Debug, Clone, Serialize)]
pub struct CrawlStats {
    /// URLs accepted into the frontier
    pub queued: u64,

    /// Tasks handed to workers
    pub dispatched: u64,

    /// Pages fetched, parsed and stored successfully
    pub crawled: u64,

    /// Attempts that ended in an HTTP or network error
    pub errored: u64,

    /// URLs rejected by robots.txt or served as non-HTML
    pub rejected: u64,

    /// Attempts short-circuited because the content was already stored
    pub skipped: u64,

    #[serde(skip)]
    started_at: Instant,
}

impl CrawlStats {
    pub fn new() -> Self {
        Self {
            queued: 0,
            dispatched: 0,
            crawled: 0,
            errored: 0,
            rejected: 0,
            skipped: 0,
            started_at: Instant::now(),
        }
    }

    /// Seconds since the session started.
    pub fn elapsed_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// One-line progress summary for periodic logging.
    pub fn summary(&self) -> String {
        format!(
            "{} queued, {} dispatched, {} crawled, {} errored, {} rejected, {} skipped ({}s elapsed)",
            self.queued,
            self.dispatched,
            self.crawled,
            self.errored,
            self.rejected,
            self.skipped,
            self.elapsed_secs()
        )
    }
}

impl Default for CrawlStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_includes_all_counters() {
        let mut stats = CrawlStats::new();
        stats.queued = 5;
        stats.crawled = 3;
        stats.errored = 1;

        let summary = stats.summary();
        assert!(summary.contains("5 queued"));
        assert!(summary.contains("3 crawled"));
        assert!(summary.contains("1 errored"));
    }
}
