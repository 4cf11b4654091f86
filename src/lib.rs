//! Cache Table - an in-process TTL key/value cache
//!
//! Concurrency-safe tables whose entries expire after a period of inactivity,
//! with optional miss loaders and insert/delete/expiry callbacks.

pub mod cache;
pub mod config;
pub mod error;
pub mod tasks;

pub use cache::{CacheItem, CacheStats, CacheTable};
pub use config::TableConfig;
pub use error::{CacheError, Result};
