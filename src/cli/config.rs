use anyhow::{Result, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::fs;
use tracing::{info, debug, error};

use crate::crawler::task::ScopeConfig;

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CrawlerConfig {
    pub crawler: CrawlSettings,
    pub queue: QueueSettings,
    pub storage: StorageSettings,
    pub search: SearchSettings,
    pub coordinator: CoordinatorSettings,
    pub health: HealthSettings,
}

/// Crawl scope and politeness settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CrawlSettings {
    /// Maximum crawl depth (seed URLs are depth 0)
    pub max_depth: u32,

    /// Maximum URLs accepted per domain
    pub max_per_domain: u32,

    /// Minimum delay between requests in milliseconds
    pub request_delay_ms: u64,

    /// Per-request HTTP timeout in seconds
    pub request_timeout_secs: u64,

    /// Domains that must never be crawled (substring match on the host)
    pub restricted_domains: Vec<String>,

    pub url_patterns: UrlPatterns,

    /// Maximum links extracted per page, to bound fan-out
    pub links_per_page: usize,

    pub user_agent: String,

    /// Crawl worker pool size
    pub num_crawlers: usize,

    /// Index worker pool size
    pub num_indexers: usize,
}

/// URL pattern settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UrlPatterns {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

/// Task queue settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct QueueSettings {
    /// Queue backend: "redis" or "memory"
    pub backend: String,

    pub redis_url: String,

    /// Lease duration before an unacked message is redelivered, in seconds
    pub visibility_timeout_secs: u64,

    /// Delivery budget before a message is dropped
    pub max_deliveries: u32,
}

/// Content store settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StorageSettings {
    /// Content storage type: "filesystem"
    pub storage_type: String,

    /// Root directory for stored content
    pub root_dir: PathBuf,
}

/// Search index settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SearchSettings {
    /// Whether indexing is enabled; content is stored either way
    pub enabled: bool,

    /// Elasticsearch/OpenSearch-compatible endpoint
    pub endpoint: String,

    /// Index name
    pub index: String,
}

/// Coordinator loop settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CoordinatorSettings {
    /// How long the empty-and-idle state must persist before the crawl is
    /// declared finished, in seconds (10-120)
    pub stabilization_window_secs: u64,

    /// Sleep between polls when the result queue is empty, in milliseconds
    pub poll_interval_ms: u64,

    /// Interval between aggregate progress log lines, in seconds
    pub progress_interval_secs: u64,
}

/// Health endpoint settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HealthSettings {
    pub enabled: bool,
    pub port: u16,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            crawler: CrawlSettings {
                max_depth: 3,
                max_per_domain: 50,
                request_delay_ms: 1000,
                request_timeout_secs: 10,
                restricted_domains: vec![],
                url_patterns: UrlPatterns {
                    include: vec![],
                    exclude: vec![],
                },
                links_per_page: 10,
                user_agent: "webtrawl/0.1".to_string(),
                num_crawlers: 2,
                num_indexers: 1,
            },
            queue: QueueSettings {
                backend: "memory".to_string(),
                redis_url: "redis://localhost:6379".to_string(),
                visibility_timeout_secs: 300,
                max_deliveries: 3,
            },
            storage: StorageSettings {
                storage_type: "filesystem".to_string(),
                root_dir: PathBuf::from("output"),
            },
            search: SearchSettings {
                enabled: true,
                endpoint: "http://localhost:9200".to_string(),
                index: "webcrawler".to_string(),
            },
            coordinator: CoordinatorSettings {
                stabilization_window_secs: 30,
                poll_interval_ms: 100,
                progress_interval_secs: 10,
            },
            health: HealthSettings {
                enabled: true,
                port: 8080,
            },
        }
    }
}

impl CrawlerConfig {
    /// Scope snapshot sent along with every dispatched task
    pub fn scope(&self) -> ScopeConfig {
        ScopeConfig {
            max_depth: self.crawler.max_depth,
            restricted_domains: self.crawler.restricted_domains.clone(),
            request_delay_ms: self.crawler.request_delay_ms,
            request_timeout_secs: self.crawler.request_timeout_secs,
        }
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.crawler.request_timeout_secs >= self.queue.visibility_timeout_secs {
            anyhow::bail!(
                "request_timeout_secs ({}) must be smaller than visibility_timeout_secs ({})",
                self.crawler.request_timeout_secs,
                self.queue.visibility_timeout_secs
            );
        }

        let window = self.coordinator.stabilization_window_secs;
        if !(10..=120).contains(&window) {
            anyhow::bail!(
                "stabilization_window_secs ({}) must be between 10 and 120",
                window
            );
        }

        match self.queue.backend.as_str() {
            "redis" | "memory" => {}
            other => anyhow::bail!("Unsupported queue backend: {}", other),
        }

        Ok(())
    }

    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        let mut path = if let Some(proj_dirs) = directories::ProjectDirs::from("com", "webtrawl", "webtrawl") {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        };

        // Create the profiles directory if it doesn't exist
        path.push("profiles");
        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                error!("Failed to create config directory: {}", e);
            }
        }

        // Move back up to the config directory
        path.pop();
        path
    }

    /// Load the default configuration
    pub fn load_default() -> Result<Self> {
        let config_dir = Self::config_dir();
        let config_path = config_dir.join("default.yaml");

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            // Create and save the default configuration
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_as_default()?;
            Ok(config)
        }
    }

    /// Load a configuration profile
    pub fn load_profile(profile: &str) -> Result<Self> {
        if profile == "default" {
            return Self::load_default();
        }

        let config_dir = Self::config_dir();
        let profile_path = config_dir.join("profiles").join(format!("{}.yaml", profile));

        if profile_path.exists() {
            Self::load_from_file(&profile_path)
        } else {
            anyhow::bail!("Profile '{}' not found", profile)
        }
    }

    /// Load configuration from a file
    fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Save the configuration as the default
    pub fn save_as_default(&self) -> Result<()> {
        let config_dir = Self::config_dir();
        let config_path = config_dir.join("default.yaml");

        self.save_to_file(&config_path)
    }

    /// Save the configuration as a profile
    pub fn save_as_profile(&self, profile: &str) -> Result<()> {
        let config_dir = Self::config_dir();
        let profiles_dir = config_dir.join("profiles");

        if !profiles_dir.exists() {
            fs::create_dir_all(&profiles_dir)
                .context(format!("Failed to create profiles directory: {}", profiles_dir.display()))?;
        }

        let profile_path = profiles_dir.join(format!("{}.yaml", profile));
        self.save_to_file(&profile_path)
    }

    /// Save the configuration to a file
    fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self)
            .context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }

    /// List all available profiles
    pub fn list_profiles() -> Result<Vec<String>> {
        let config_dir = Self::config_dir();
        let profiles_dir = config_dir.join("profiles");

        if !profiles_dir.exists() {
            return Ok(vec![]);
        }

        let mut profiles = Vec::new();

        for entry in fs::read_dir(profiles_dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.is_file() && path.extension().map_or(false, |ext| ext == "yaml") {
                if let Some(stem) = path.file_stem() {
                    if let Some(name) = stem.to_str() {
                        profiles.push(name.to_string());
                    }
                }
            }
        }

        Ok(profiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        CrawlerConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_timeout_not_below_visibility_window() {
        let mut config = CrawlerConfig::default();
        config.crawler.request_timeout_secs = 300;
        config.queue.visibility_timeout_secs = 300;

        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_stabilization_window_out_of_range() {
        let mut config = CrawlerConfig::default();
        config.coordinator.stabilization_window_secs = 5;
        assert!(config.validate().is_err());

        config.coordinator.stabilization_window_secs = 600;
        assert!(config.validate().is_err());

        config.coordinator.stabilization_window_secs = 120;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_unknown_queue_backend() {
        let mut config = CrawlerConfig::default();
        config.queue.backend = "carrier-pigeon".to_string();

        assert!(config.validate().is_err());
    }

    #[test]
    fn config_round_trips_through_yaml() {
        let config = CrawlerConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let back: CrawlerConfig = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(back.crawler.max_depth, config.crawler.max_depth);
        assert_eq!(back.queue.visibility_timeout_secs, 300);
        assert_eq!(back.search.index, "webcrawler");
    }

    #[test]
    fn scope_snapshot_matches_crawl_settings() {
        let mut config = CrawlerConfig::default();
        config.crawler.max_depth = 5;
        config.crawler.restricted_domains = vec!["blocked.test".to_string()];

        let scope = config.scope();
        assert_eq!(scope.max_depth, 5);
        assert_eq!(scope.restricted_domains, vec!["blocked.test"]);
        assert_eq!(scope.request_timeout_secs, 10);
    }
}
