pub mod content;

// Re-export common types
pub use content::{ContentStore, ContentStoreFactory, FsContentStore};
