use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::cli::config::CrawlerConfig;
use crate::coordinator::Coordinator;
use crate::crawler::CrawlWorker;
use crate::health::{self, HealthState};
use crate::indexer::IndexWorker;
use crate::search::{search_tiered, ElasticIndex, SearchBackend, SearchIndex, StoreScanBackend};
use crate::storage::ContentStoreFactory;
use crate::transport::{
    MemoryTransport, RedisTransport, TaskTransport, CRAWL_QUEUE, INDEX_QUEUE, RESULT_QUEUE,
};

/// Build the task transport named in the configuration.
async fn build_transport(config: &CrawlerConfig) -> Result<Arc<dyn TaskTransport>> {
    match config.queue.backend.as_str() {
        "redis" => {
            let transport = RedisTransport::new(&config.queue).await?;
            Ok(Arc::new(transport))
        }
        "memory" => Ok(Arc::new(MemoryTransport::new(
            Duration::from_secs(config.queue.visibility_timeout_secs),
            config.queue.max_deliveries,
        ))),
        other => anyhow::bail!("Unsupported queue backend: {}", other),
    }
}

/// Build the search index when indexing is enabled.
fn build_index(config: &CrawlerConfig) -> Option<Arc<dyn SearchIndex>> {
    if !config.search.enabled {
        return None;
    }
    let index = ElasticIndex::new(reqwest::Client::new(), &config.search);
    Some(Arc::new(index))
}

/// Reject the in-process queue for commands that need a shared one.
fn require_shared_queue(config: &CrawlerConfig) -> Result<()> {
    if config.queue.backend == "memory" {
        anyhow::bail!(
            "The memory queue backend lives inside one process; standalone workers need the redis backend"
        );
    }
    Ok(())
}

/// Forward Ctrl-C into the shutdown watch so every loop drains.
fn trap_interrupt(shutdown_tx: Arc<watch::Sender<bool>>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, draining in-flight work");
            let _ = shutdown_tx.send(true);
        }
    });
}

fn spawn_health(
    config: &CrawlerConfig,
    node_type: &'static str,
    index: Option<Arc<dyn SearchIndex>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
) {
    if !config.health.enabled {
        return;
    }

    let port = config.health.port;
    let state = HealthState {
        node_type,
        started_at: Instant::now(),
        index,
        shutdown: shutdown_tx,
    };
    tokio::spawn(async move {
        if let Err(e) = health::serve(port, state).await {
            error!("Health endpoint stopped: {}", e);
        }
    });
}

/// Run a complete crawl session in this process: coordinator, crawl workers
/// and index workers wired to one transport.
pub async fn crawl(
    seeds: Vec<String>,
    profile: String,
    depth: Option<u32>,
    max_per_domain: Option<u32>,
) -> Result<()> {
    let mut config = CrawlerConfig::load_profile(&profile)
        .context(format!("Failed to load profile: {}", profile))?;

    // Override configuration with command line parameters if provided
    if let Some(d) = depth {
        config.crawler.max_depth = d;
    }
    if let Some(cap) = max_per_domain {
        config.crawler.max_per_domain = cap;
    }
    config.validate()?;

    let transport = build_transport(&config).await?;
    let store = ContentStoreFactory::create(&config.storage).await?;
    let index = build_index(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    trap_interrupt(shutdown_tx.clone());
    spawn_health(&config, "session", index.clone(), shutdown_tx.clone());

    let poll_interval = Duration::from_millis(config.coordinator.poll_interval_ms);
    let mut handles = Vec::new();

    for _ in 0..config.crawler.num_crawlers {
        let worker = CrawlWorker::new(
            transport.clone(),
            store.clone(),
            config.crawler.user_agent.clone(),
            config.crawler.links_per_page,
            poll_interval,
        );
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { worker.run(rx).await }));
    }

    for _ in 0..config.crawler.num_indexers {
        let worker = IndexWorker::new(
            transport.clone(),
            store.clone(),
            index.clone(),
            poll_interval,
        );
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { worker.run(rx).await }));
    }

    let mut coordinator = Coordinator::new(&config, transport.clone(), store.clone());

    let restored = coordinator.rebuild_seen_from_store().await?;
    if restored > 0 {
        info!("Restored {} previously crawled URLs from the content store", restored);
    }

    let accepted = coordinator.submit(&seeds);
    if accepted.is_empty() {
        anyhow::bail!("No seed URLs were accepted by the scope filter");
    }
    info!("Accepted {} of {} seed URLs", accepted.len(), seeds.len());

    let stats = coordinator.run(shutdown_rx).await?;

    // Release the worker loops and give them a moment to exit
    let _ = shutdown_tx.send(true);
    for joined in futures::future::join_all(handles).await {
        if let Ok(Err(e)) = joined {
            warn!("Worker exited with error: {}", e);
        }
    }

    println!("Crawl complete in {}s", stats.elapsed_secs());
    println!("  URLs queued:      {}", stats.queued);
    println!("  Tasks dispatched: {}", stats.dispatched);
    println!("  Pages crawled:    {}", stats.crawled);
    println!("  Errors:           {}", stats.errored);
    println!("  Rejected:         {}", stats.rejected);
    println!("  Skipped:          {}", stats.skipped);

    Ok(())
}

/// Run standalone crawl workers against a shared queue.
pub async fn worker(profile: String, count: Option<usize>) -> Result<()> {
    let config = CrawlerConfig::load_profile(&profile)
        .context(format!("Failed to load profile: {}", profile))?;
    require_shared_queue(&config)?;

    let transport = build_transport(&config).await?;
    let store = ContentStoreFactory::create(&config.storage).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    trap_interrupt(shutdown_tx.clone());
    spawn_health(&config, "crawler", None, shutdown_tx.clone());

    let count = count.unwrap_or(config.crawler.num_crawlers);
    let poll_interval = Duration::from_millis(config.coordinator.poll_interval_ms);
    info!("Running {} crawl workers", count);

    let mut handles = Vec::new();
    for _ in 0..count {
        let worker = CrawlWorker::new(
            transport.clone(),
            store.clone(),
            config.crawler.user_agent.clone(),
            config.crawler.links_per_page,
            poll_interval,
        );
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { worker.run(rx).await }));
    }

    for joined in futures::future::join_all(handles).await {
        if let Ok(Err(e)) = joined {
            warn!("Worker exited with error: {}", e);
        }
    }

    Ok(())
}

/// Run standalone index workers against a shared queue.
pub async fn indexer(profile: String, count: Option<usize>) -> Result<()> {
    let config = CrawlerConfig::load_profile(&profile)
        .context(format!("Failed to load profile: {}", profile))?;
    require_shared_queue(&config)?;

    let transport = build_transport(&config).await?;
    let store = ContentStoreFactory::create(&config.storage).await?;
    let index = build_index(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    trap_interrupt(shutdown_tx.clone());
    spawn_health(&config, "indexer", index.clone(), shutdown_tx.clone());

    let count = count.unwrap_or(config.crawler.num_indexers);
    let poll_interval = Duration::from_millis(config.coordinator.poll_interval_ms);
    info!("Running {} index workers", count);

    let mut handles = Vec::new();
    for _ in 0..count {
        let worker = IndexWorker::new(
            transport.clone(),
            store.clone(),
            index.clone(),
            poll_interval,
        );
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { worker.run(rx).await }));
    }

    for joined in futures::future::join_all(handles).await {
        if let Ok(Err(e)) = joined {
            warn!("Index worker exited with error: {}", e);
        }
    }

    Ok(())
}

/// Search crawled content, falling back from the index to a store scan.
pub async fn search(query: String, profile: String, limit: usize, format: String) -> Result<()> {
    let config = CrawlerConfig::load_profile(&profile)
        .context(format!("Failed to load profile: {}", profile))?;

    let store = ContentStoreFactory::create(&config.storage).await?;

    let mut backends: Vec<Arc<dyn SearchBackend>> = Vec::new();
    if config.search.enabled {
        backends.push(Arc::new(ElasticIndex::new(
            reqwest::Client::new(),
            &config.search,
        )));
    }
    backends.push(Arc::new(StoreScanBackend::new(store)));

    let hits = search_tiered(&backends, &query, limit).await?;

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&hits)?);
        return Ok(());
    }

    if hits.is_empty() {
        println!("No results for '{}'", query);
        return Ok(());
    }

    println!("Found {} results for '{}':", hits.len(), query);
    println!();
    for (i, hit) in hits.iter().enumerate() {
        println!("{}. {} (score: {:.2})", i + 1, hit.title, hit.score);
        println!("   {}", hit.url);
        if !hit.description.is_empty() {
            println!("   {}", hit.description);
        }
        for highlight in &hit.highlights {
            println!("   ... {}", highlight);
        }
        println!();
    }

    Ok(())
}

/// Show visible and in-flight counts for every queue.
pub async fn status(profile: String) -> Result<()> {
    let config = CrawlerConfig::load_profile(&profile)
        .context(format!("Failed to load profile: {}", profile))?;
    require_shared_queue(&config)?;

    let transport = build_transport(&config).await?;

    println!("Queue backlog ({} backend):", config.queue.backend);
    for queue in [CRAWL_QUEUE, RESULT_QUEUE, INDEX_QUEUE] {
        let depth = transport.depth(queue).await?;
        println!(
            "  {:<10} {} visible, {} in flight",
            queue, depth.visible, depth.in_flight
        );
    }

    Ok(())
}

/// List all available configuration profiles
pub async fn list_profiles() -> Result<()> {
    let profiles = CrawlerConfig::list_profiles()?;

    println!("Available configuration profiles:");
    for profile in profiles {
        println!("  - {}", profile);
    }

    Ok(())
}

/// Manage a specific configuration profile
pub async fn manage_profile(profile_name: String) -> Result<()> {
    match CrawlerConfig::load_profile(&profile_name) {
        Ok(config) => {
            println!("Profile: {}", profile_name);
            println!("{:#?}", config);
        }
        Err(_) => {
            warn!(
                "Profile '{}' does not exist. Creating a default profile.",
                profile_name
            );
            let config = CrawlerConfig::default();
            config.save_as_profile(&profile_name)?;
            println!("Created default profile: {}", profile_name);
        }
    }

    Ok(())
}

/// Show the current configuration
pub async fn show_config() -> Result<()> {
    let config = CrawlerConfig::load_default()?;
    println!("Current configuration:");
    println!("{:#?}", config);

    Ok(())
}
