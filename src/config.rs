//! Repository configuration from environment variables

use std::env;
use std::time::Duration;

/// Configuration for the repository runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Directory holding the `*.sql` schema migrations
    pub schema_dir: String,

    /// Subscription scheduler tick interval in milliseconds
    pub tick_interval_ms: u64,

    /// Maximum subscriptions evaluated concurrently within one tick
    pub max_concurrency: usize,

    /// Command channel size of the scheduler task
    pub channel_buffer: usize,

    /// Outbound delivery timeout in milliseconds
    pub delivery_timeout_ms: u64,

    /// First retry delay for failed data-insert deliveries
    pub retry_initial_ms: u64,

    /// Upper bound of the retry delay
    pub retry_max_ms: u64,

    /// Consecutive failures after which a data-insert trigger is dropped
    /// until the next capture. `None` retries forever.
    pub retry_limit: Option<u32>,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl RepositoryConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `EPCIS_DB_PATH` (default: traceflow.db)
    /// - `EPCIS_SCHEMA_DIR` (default: sql)
    /// - `SUBSCRIPTION_TICK_INTERVAL_MS` (default: 1000)
    /// - `SUBSCRIPTION_MAX_CONCURRENCY` (default: 8)
    /// - `SUBSCRIPTION_CHANNEL_BUFFER` (default: 256)
    /// - `DELIVERY_TIMEOUT_MS` (default: 10000)
    /// - `DELIVERY_RETRY_INITIAL_MS` (default: 1000)
    /// - `DELIVERY_RETRY_MAX_MS` (default: 60000)
    /// - `DELIVERY_RETRY_LIMIT` (default: unset, unlimited)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let number = |key: &str, default: u64| -> u64 {
            lookup(key)
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(default)
        };

        Self {
            db_path: lookup("EPCIS_DB_PATH").unwrap_or_else(|| "traceflow.db".to_string()),

            schema_dir: lookup("EPCIS_SCHEMA_DIR").unwrap_or_else(|| "sql".to_string()),

            tick_interval_ms: number("SUBSCRIPTION_TICK_INTERVAL_MS", 1_000).max(1),

            max_concurrency: number("SUBSCRIPTION_MAX_CONCURRENCY", 8).max(1) as usize,

            channel_buffer: number("SUBSCRIPTION_CHANNEL_BUFFER", 256).max(1) as usize,

            delivery_timeout_ms: number("DELIVERY_TIMEOUT_MS", 10_000),

            retry_initial_ms: number("DELIVERY_RETRY_INITIAL_MS", 1_000),

            retry_max_ms: number("DELIVERY_RETRY_MAX_MS", 60_000),

            retry_limit: lookup("DELIVERY_RETRY_LIMIT").and_then(|s| s.trim().parse().ok()),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}
