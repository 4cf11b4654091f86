//! Error types for the cache table
//!
//! Provides unified error handling using thiserror.

use thiserror::Error;

// == Cache Error Enum ==
/// Terminal outcomes of table lookups and deletes.
///
/// Nothing is retried internally; callers decide what to do next.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    /// Key is absent (and, for lookups, no loader is configured)
    #[error("key not found in cache")]
    KeyNotFound,

    /// Key is absent and the configured loader produced nothing for it
    #[error("key not found and could not be loaded")]
    KeyNotFoundOrLoadable,
}

// == Result Type Alias ==
/// Convenience Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
