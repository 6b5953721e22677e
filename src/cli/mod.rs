pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a crawl session from seed URLs
    Crawl {
        /// Seed URLs to start crawling from
        #[arg(required = true)]
        seeds: Vec<String>,

        /// Configuration profile to use
        #[arg(short, long, default_value = "default")]
        profile: String,

        /// Maximum crawling depth
        #[arg(short, long)]
        depth: Option<u32>,

        /// Maximum URLs accepted per domain
        #[arg(long)]
        max_per_domain: Option<u32>,
    },

    /// Run crawl workers against a shared task queue
    Worker {
        /// Configuration profile to use
        #[arg(short, long, default_value = "default")]
        profile: String,

        /// Number of workers to run in this process
        #[arg(short, long)]
        count: Option<usize>,
    },

    /// Run index workers against a shared indexer queue
    Indexer {
        /// Configuration profile to use
        #[arg(short, long, default_value = "default")]
        profile: String,

        /// Number of workers to run in this process
        #[arg(short, long)]
        count: Option<usize>,
    },

    /// Search crawled content
    Search {
        /// Query string
        #[arg(required = true)]
        query: String,

        /// Configuration profile to use
        #[arg(short, long, default_value = "default")]
        profile: String,

        /// Maximum number of results
        #[arg(short, long, default_value_t = 10)]
        limit: usize,

        /// Output format (text, json)
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// Show queue backlog
    Status {
        /// Configuration profile to use
        #[arg(short, long, default_value = "default")]
        profile: String,
    },

    /// Manage configuration profiles
    Config {
        /// Profile name to manage
        #[arg(required = false)]
        profile: Option<String>,

        /// List all available profiles
        #[arg(short, long)]
        list: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Crawl {
            seeds,
            profile,
            depth,
            max_per_domain,
        } => {
            info!("Starting crawl with profile {}", profile);
            commands::crawl(seeds, profile, depth, max_per_domain).await
        }
        Commands::Worker { profile, count } => {
            info!("Starting crawl workers with profile {}", profile);
            commands::worker(profile, count).await
        }
        Commands::Indexer { profile, count } => {
            info!("Starting index workers with profile {}", profile);
            commands::indexer(profile, count).await
        }
        Commands::Search {
            query,
            profile,
            limit,
            format,
        } => commands::search(query, profile, limit, format).await,
        Commands::Status { profile } => commands::status(profile).await,
        Commands::Config { profile, list } => {
            if list {
                info!("Listing all configuration profiles");
                commands::list_profiles().await
            } else if let Some(profile_name) = profile {
                info!("Managing configuration profile: {}", profile_name);
                commands::manage_profile(profile_name).await
            } else {
                info!("Showing current configuration");
                commands::show_config().await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }
}
