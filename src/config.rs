//! Configuration Module
//!
//! Handles loading per-table settings from environment variables.

use std::env;

use tracing::Level;

/// Environment variable selecting the diagnostic level of new tables.
pub const LOG_LEVEL_VAR: &str = "CACHE_TABLE_LOG";

/// Per-table configuration parameters.
///
/// The default is a silent table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableConfig {
    /// Level for the table's diagnostic lines, None = silent
    pub log_level: Option<Level>,
}

impl TableConfig {
    /// Creates a new TableConfig by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_TABLE_LOG` - `off`, `error`, `warn`, `info`, `debug` or `trace`
    ///   (default: off)
    pub fn from_env() -> Self {
        Self {
            log_level: env::var(LOG_LEVEL_VAR)
                .ok()
                .and_then(|v| parse_log_level(&v)),
        }
    }

    /// Sets the diagnostic level.
    pub fn with_log_level(mut self, level: Option<Level>) -> Self {
        self.log_level = level;
        self
    }
}

/// Parses a level name; `off` and anything unrecognised mean silent.
fn parse_log_level(value: &str) -> Option<Level> {
    value.trim().parse().ok()
}
