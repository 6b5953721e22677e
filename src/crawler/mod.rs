pub mod robots;
pub mod task;
pub mod worker;

// Re-export common types
pub use robots::{RobotsCache, RobotsRules};
pub use task::{CrawlResult, CrawlStatus, CrawlTask, ContentRecord, IndexRequest, ScopeConfig};
pub use worker::CrawlWorker;
