pub mod logging;
pub mod stats;

// Re-export common types
pub use logging::init_logging;
pub use stats::CrawlStats;
