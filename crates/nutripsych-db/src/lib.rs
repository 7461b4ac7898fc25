//! Nutripsych food record store.
//!
//! The enrichment pipeline talks to persistence only through the
//! [`FoodStore`] trait: read one record, list ids matching a filter, and
//! commit a merged enrichment in a single all-or-nothing write guarded by
//! the record's version.
//!
//! # Example
//!
//! ```rust,no_run
//! use nutripsych_db::{FoodFilter, FoodStore, JsonDirStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = JsonDirStore::open("./data/foods").await?;
//!     let ids = store.list_food_ids(&FoodFilter::default()).await?;
//!     println!("{} records", ids.len());
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod json_dir;
pub mod memory;
pub mod store;

pub use error::{DbError, Result};
pub use json_dir::JsonDirStore;
pub use memory::MemoryFoodStore;
pub use store::{FoodFilter, FoodStore};
