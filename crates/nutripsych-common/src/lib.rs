//! nutripsych-common: Shared food record types, task identifiers and the
//! confidence scale used across all Nutripsych crates.

pub mod confidence;
pub mod food;
pub mod task;

// Re-export commonly used types
pub use confidence::Direction;
pub use food::{FoodRecord, MergedEnrichment};
pub use task::TaskType;
