pub mod frontier;
pub mod session;

// Re-export common types
pub use frontier::{Frontier, FrontierEntry};
pub use session::Coordinator;
