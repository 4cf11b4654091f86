//! Cache Module
//!
//! Provides concurrent key/value tables whose items expire after a period of
//! inactivity.

mod item;
mod stats;
mod table;


// Re-export public types
pub use item::{AboutToExpireCallback, CacheItem};
pub use stats::CacheStats;
pub use table::{CacheTable, DataLoader, ItemCallback};
