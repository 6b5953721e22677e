use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

/// How long to wait for a robots.txt response before assuming the default
const ROBOTS_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Fallback crawl delay applied when robots.txt is missing or unparseable
pub const DEFAULT_CRAWL_DELAY: Duration = Duration::from_secs(1);

/// Robots exclusion rules for a single domain
#[derive(Debug, Clone)]
pub struct RobotsRules {
    /// Disallowed path prefixes for our user agent
    pub disallow: Vec<String>,

    /// Minimum delay between requests to this domain
    pub crawl_delay: Duration,
}

impl Default for RobotsRules {
    fn default() -> Self {
        Self {
            disallow: Vec::new(),
            crawl_delay: DEFAULT_CRAWL_DELAY,
        }
    }
}

impl RobotsRules {
    /// Parse a robots.txt body, keeping the rule groups that apply to the
    /// given user agent (exact token or the `*` wildcard group).
    pub fn parse(content: &str, user_agent: &str) -> Self {
        let agent_token = user_agent
            .split('/')
            .next()
            .unwrap_or(user_agent)
            .to_lowercase();

        // Rule groups keyed by user-agent line, built up line by line
        let mut groups: HashMap<String, Vec<String>> = HashMap::new();
        let mut delays: HashMap<String, Duration> = HashMap::new();
        let mut current_agents: Vec<String> = Vec::new();
        let mut in_rules = false;

        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }

            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "user-agent" => {
                    // A user-agent line after rules starts a new group
                    if in_rules {
                        current_agents.clear();
                        in_rules = false;
                    }
                    current_agents.push(value.to_lowercase());
                }
                "disallow" => {
                    in_rules = true;
                    if !value.is_empty() {
                        for agent in &current_agents {
                            groups.entry(agent.clone()).or_default().push(value.to_string());
                        }
                    }
                }
                "crawl-delay" => {
                    in_rules = true;
                    if let Ok(secs) = value.parse::<f64>() {
                        if secs >= 0.0 {
                            for agent in &current_agents {
                                delays.insert(agent.clone(), Duration::from_secs_f64(secs));
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        // Specific agent group wins over the wildcard group
        fn pick<'a, V>(map: &'a HashMap<String, V>, agent: &str) -> Option<&'a V> {
            map.get(agent).or_else(|| map.get("*"))
        }

        let disallow = pick(&groups, &agent_token).cloned().unwrap_or_default();
        let crawl_delay = pick(&delays, &agent_token)
            .copied()
            .unwrap_or(DEFAULT_CRAWL_DELAY);

        Self { disallow, crawl_delay }
    }

    /// Whether the given URL path may be fetched
    pub fn is_allowed(&self, path: &str) -> bool {
        !self.disallow.iter().any(|prefix| path.starts_with(prefix.as_str()))
    }
}

/// Per-origin robots.txt cache, keyed by host plus explicit port so two
/// servers on the same host never share rules. Each origin is fetched once,
/// lazily, for the lifetime of the owning worker; failures fall back to
/// crawl-allowed with the default delay.
pub struct RobotsCache {
    client: reqwest::Client,
    user_agent: String,
    rules: Mutex<HashMap<String, Arc<RobotsRules>>>,
}

impl RobotsCache {
    pub fn new(client: reqwest::Client, user_agent: String) -> Self {
        Self {
            client,
            user_agent,
            rules: Mutex::new(HashMap::new()),
        }
    }

    /// Rules for the origin of the given URL, fetching robots.txt on first use
    pub async fn rules_for(&self, url: &Url) -> Arc<RobotsRules> {
        let Some(host) = url.host_str().map(|h| h.to_lowercase()) else {
            return Arc::new(RobotsRules::default());
        };
        let origin = match url.port() {
            // Url::port already hides scheme-default ports
            Some(port) => format!("{}:{}", host, port),
            None => host,
        };

        {
            let cache = self.rules.lock().await;
            if let Some(rules) = cache.get(&origin) {
                return rules.clone();
            }
        }

        let rules = Arc::new(self.fetch(url, &origin).await);

        let mut cache = self.rules.lock().await;
        cache.entry(origin).or_insert_with(|| rules.clone()).clone()
    }

    async fn fetch(&self, url: &Url, origin: &str) -> RobotsRules {
        let robots_url = format!("{}://{}/robots.txt", url.scheme(), origin);

        let response = self
            .client
            .get(&robots_url)
            .timeout(ROBOTS_FETCH_TIMEOUT)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => match resp.text().await {
                Ok(body) => {
                    debug!("Fetched robots.txt for {}", origin);
                    RobotsRules::parse(&body, &self.user_agent)
                }
                Err(e) => {
                    warn!("Failed to read robots.txt body for {}: {}", origin, e);
                    RobotsRules::default()
                }
            },
            Ok(resp) => {
                debug!(
                    "robots.txt for {} returned {}, assuming crawl allowed",
                    origin,
                    resp.status()
                );
                RobotsRules::default()
            }
            Err(e) => {
                warn!("Failed to fetch robots.txt for {}: {}", origin, e);
                RobotsRules::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# comment line
User-agent: *
Disallow: /private
Disallow: /tmp/
Crawl-delay: 2

User-agent: otherbot
Disallow: /
";

    #[test]
    fn parses_wildcard_group() {
        let rules = RobotsRules::parse(SAMPLE, "webtrawl/1.0");

        assert_eq!(rules.disallow, vec!["/private", "/tmp/"]);
        assert_eq!(rules.crawl_delay, Duration::from_secs(2));
    }

    #[test]
    fn specific_agent_group_overrides_wildcard() {
        let rules = RobotsRules::parse(SAMPLE, "otherbot/2.1");

        assert_eq!(rules.disallow, vec!["/"]);
        // otherbot has no crawl-delay of its own; wildcard delay applies
        assert_eq!(rules.crawl_delay, Duration::from_secs(2));
    }

    #[test]
    fn disallow_is_prefix_match() {
        let rules = RobotsRules::parse(SAMPLE, "webtrawl/1.0");

        assert!(!rules.is_allowed("/private/x"));
        assert!(!rules.is_allowed("/private"));
        assert!(rules.is_allowed("/public"));
        // "/tmp" without the trailing slash is not covered by "/tmp/"
        assert!(rules.is_allowed("/tmp"));
    }

    #[test]
    fn empty_disallow_allows_everything() {
        let rules = RobotsRules::parse("User-agent: *\nDisallow:\n", "webtrawl/1.0");

        assert!(rules.disallow.is_empty());
        assert!(rules.is_allowed("/anything"));
    }

    #[test]
    fn garbage_input_falls_back_to_defaults() {
        let rules = RobotsRules::parse("<html>not robots</html>", "webtrawl/1.0");

        assert!(rules.disallow.is_empty());
        assert_eq!(rules.crawl_delay, DEFAULT_CRAWL_DELAY);
    }

    #[tokio::test]
    async fn cache_keeps_same_host_ports_apart() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        // Two origins on 127.0.0.1, different ports, different rules
        let open = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow:\n"))
            .mount(&open)
            .await;

        let closed = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /\n"))
            .mount(&closed)
            .await;

        let cache = RobotsCache::new(reqwest::Client::new(), "webtrawl/1.0".to_string());
        let open_url = Url::parse(&format!("{}/page", open.uri())).unwrap();
        let closed_url = Url::parse(&format!("{}/page", closed.uri())).unwrap();

        let open_rules = cache.rules_for(&open_url).await;
        let closed_rules = cache.rules_for(&closed_url).await;

        assert!(open_rules.is_allowed("/page"));
        assert!(!closed_rules.is_allowed("/page"));
    }

    #[test]
    fn negative_crawl_delay_is_ignored() {
        let rules = RobotsRules::parse(
            "User-agent: *\nCrawl-delay: -3\nDisallow: /x\n",
            "webtrawl/1.0",
        );

        assert_eq!(rules.crawl_delay, DEFAULT_CRAWL_DELAY);
    }
}
