use serde::{Serialize, Deserialize};
use url::Url;

/// Scope constraints carried with every task so that workers apply the same
/// limits whichever coordinator session dispatched the task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeConfig {
    /// Maximum crawl depth (seed URLs are depth 0)
    pub max_depth: u32,

    /// Domains that must never be crawled (substring match on the host)
    pub restricted_domains: Vec<String>,

    /// Minimum delay between requests in milliseconds
    pub request_delay_ms: u64,

    /// Per-request HTTP timeout in seconds
    pub request_timeout_secs: u64,
}

/// A unit of crawl work dispatched to a worker over the task transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlTask {
    /// Canonical URL to crawl
    pub url: String,

    /// Depth in the crawl tree (0 for seed URLs)
    pub depth: u32,

    /// Scope snapshot taken at dispatch time
    pub scope: ScopeConfig,
}

/// Terminal status of a single crawl attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlStatus {
    /// Page fetched and parsed; content stored
    Success,

    /// The URL path matches a robots.txt disallow rule
    Disallowed,

    /// The response was not an HTML document
    NotHtml,

    /// The server answered with a non-2xx status
    HttpError(u16),

    /// Timeout, DNS failure, connection refused, or any internal error
    NetworkError,

    /// Content for this URL already exists in the store
    SkippedDuplicate,
}

/// Result of a completed crawl attempt, reported back to the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlResult {
    /// URL that was crawled
    pub url: String,

    /// Depth at which this URL was crawled
    pub depth: u32,

    /// Terminal status of this attempt
    pub status: CrawlStatus,

    /// Canonicalized links discovered on the page, in document order
    pub extracted_links: Vec<String>,

    /// Content store key, present only on success
    pub content_key: Option<String>,
}

/// Crawled page content as persisted in the content store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentRecord {
    /// Canonical URL of the page
    pub url: String,

    /// Page title ("No Title" if absent)
    pub title: String,

    /// Meta description ("No description" if absent)
    pub description: String,

    /// Visible text with script and style content stripped
    pub text_content: String,

    /// Raw HTML of the page, kept for re-processing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,

    /// Crawl time in epoch seconds
    pub crawl_timestamp: i64,

    /// Depth at which the page was crawled
    pub depth: u32,

    /// Deterministic store key, hash of the canonical URL
    pub content_key: String,
}

impl ContentRecord {
    /// Plain-text rendering stored alongside the JSON record for inspection
    /// tooling and the file-scan search fallback
    pub fn to_plain_text(&self) -> String {
        format!(
            "URL: {}\nTitle: {}\nDescription: {}\n\n{}",
            self.url, self.title, self.description, self.text_content
        )
    }
}

/// Handoff from a crawl worker to the index worker. The full record travels
/// over the queue; the index worker owns persistence, so a store failure
/// keeps the message on the queue for redelivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexRequest {
    /// Canonical URL of the content
    pub url: String,

    /// Content store key the record will be persisted under
    pub content_key: String,

    /// Depth at which the page was crawled
    pub depth: u32,

    /// The crawled content to persist and index
    pub record: ContentRecord,
}

/// Deterministic content store key for a canonical URL
pub fn content_key(canonical_url: &str) -> String {
    let digest = xxhash_rust::xxh3::xxh3_128(canonical_url.as_bytes());
    hex::encode(digest.to_be_bytes())
}

/// Reduce a URL to its canonical dedup form: scheme + host + path, with the
/// query and fragment stripped. Trades completeness for a bounded crawl
/// space; returns None for URLs without an http(s) host.
pub fn canonicalize(raw: &str) -> Option<String> {
    let parsed = Url::parse(raw).ok()?;

    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return None;
    }

    let host = parsed.host_str()?.to_lowercase();

    let mut canonical = format!("{}://{}", parsed.scheme(), host);
    if let Some(port) = parsed.port() {
        // Url::port already hides scheme-default ports
        canonical.push_str(&format!(":{}", port));
    }
    canonical.push_str(parsed.path());

    // Avoid distinct keys for "https://a.test" vs "https://a.test/"
    if parsed.path() == "/" {
        canonical.truncate(canonical.len() - 1);
    }

    Some(canonical)
}

/// Extract the host portion of a URL, lowercased
pub fn domain_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_strips_query_and_fragment() {
        assert_eq!(
            canonicalize("https://a.test/p2?x=1#frag"),
            Some("https://a.test/p2".to_string())
        );
        // Fragment-only variants collapse onto the same canonical form
        assert_eq!(
            canonicalize("https://a.test/p2#frag"),
            canonicalize("https://a.test/p2")
        );
    }

    #[test]
    fn canonicalize_normalizes_host_and_root_path() {
        assert_eq!(
            canonicalize("https://A.TEST/path"),
            Some("https://a.test/path".to_string())
        );
        assert_eq!(
            canonicalize("https://a.test/"),
            Some("https://a.test".to_string())
        );
        assert_eq!(canonicalize("https://a.test"), canonicalize("https://a.test/"));
    }

    #[test]
    fn canonicalize_keeps_non_root_trailing_slash() {
        // "/a/" and "/a" may be different resources; only the root path
        // collapses
        assert_eq!(
            canonicalize("https://a.test/a/"),
            Some("https://a.test/a/".to_string())
        );
        assert_ne!(
            canonicalize("https://a.test/a/"),
            canonicalize("https://a.test/a")
        );
    }

    #[test]
    fn canonicalize_rejects_non_http_schemes() {
        assert_eq!(canonicalize("mailto:someone@a.test"), None);
        assert_eq!(canonicalize("ftp://a.test/file"), None);
        assert_eq!(canonicalize("not a url"), None);
    }

    #[test]
    fn content_key_is_deterministic() {
        let a = content_key("https://a.test/page");
        let b = content_key("https://a.test/page");
        let c = content_key("https://a.test/other");

        assert_eq!(a, b);
        assert_ne!(a, c);
        // Keys double as file names, so they must stay plain hex
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn status_serializes_as_snake_case() {
        let json = serde_json::to_string(&CrawlStatus::NotHtml).unwrap();
        assert_eq!(json, r#""not_html""#);

        let err: CrawlStatus = serde_json::from_str(r#"{"http_error":404}"#).unwrap();
        assert_eq!(err, CrawlStatus::HttpError(404));
    }

    #[test]
    fn plain_text_rendering_has_header_lines() {
        let record = ContentRecord {
            url: "https://a.test/page".to_string(),
            title: "A Page".to_string(),
            description: "About things".to_string(),
            text_content: "body text".to_string(),
            html: None,
            crawl_timestamp: 1_700_000_000,
            depth: 1,
            content_key: content_key("https://a.test/page"),
        };

        let text = record.to_plain_text();
        assert!(text.starts_with("URL: https://a.test/page\nTitle: A Page\n"));
        assert!(text.ends_with("body text"));
    }
}
