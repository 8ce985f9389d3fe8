//! Application configuration with layered loading.
//!
//! Configuration is loaded with figment from multiple sources:
//!
//! 1. Environment variables (OUTPOST_*, nested with `__`)
//! 2. TOML config file (if OUTPOST_CONFIG_FILE set)
//! 3. Built-in defaults

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

mod validation;

pub use validation::ConfigError;

/// Application configuration with layered loading.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (OUTPOST_*)
/// 2. TOML config file (if OUTPOST_CONFIG_FILE set)
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Path to the SQLite database holding cached documents and tasks.
    ///
    /// Set via OUTPOST_DB_PATH environment variable.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// User-Agent string for HTTP requests.
    ///
    /// Set via OUTPOST_USER_AGENT environment variable.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// HTTP request timeout in milliseconds.
    ///
    /// Set via OUTPOST_TIMEOUT_MS environment variable.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum bytes to read per response.
    ///
    /// Set via OUTPOST_MAX_BYTES environment variable.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub crawler: CrawlerConfig,

    #[serde(default)]
    pub queue: QueueConfig,
}

/// Document cache settings (OUTPOST_CACHE__*).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// When false the cache is a pure pass-through and nothing is persisted.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between purges of expired documents.
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,

    /// Act as a shared cache, which must not serve `private` responses.
    #[serde(default)]
    pub public_mode: bool,

    /// Upper bound on how long any document is retained.
    #[serde(default = "default_max_ttl_secs")]
    pub max_ttl_secs: u64,

    /// Maximum concurrent background jobs (saves, refreshes, pre-warms).
    #[serde(default = "default_background_limit")]
    pub background_limit: usize,
}

/// Crawler settings (OUTPOST_CRAWLER__*).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Longest crawl chain, counted as the length of the visited history.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Maximum members considered per related collection.
    #[serde(default = "default_collection_limit")]
    pub collection_limit: usize,

    /// Delay before a crawl task becomes eligible.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Priority of crawl tasks (lower runs first).
    #[serde(default = "default_crawl_priority")]
    pub priority: i64,
}

/// Task queue settings (OUTPOST_QUEUE__*).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Number of worker tasks.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Capacity of the in-memory work buffer and the poller's batch size.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// How long a claimed task stays locked before it can be reclaimed.
    #[serde(default = "default_lock_secs")]
    pub lock_secs: u64,

    /// Sleep between polls that found no eligible tasks.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Whether to poll storage for eligible tasks.
    #[serde(default = "default_true")]
    pub polling: bool,

    /// Default retry budget for new tasks.
    #[serde(default = "default_retry_max")]
    pub retry_max: u32,

    /// Ceiling for the exponential retry delay.
    #[serde(default = "default_max_backoff_minutes")]
    pub max_backoff_minutes: u64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./outpost.sqlite")
}

fn default_user_agent() -> String {
    "outpost/0.1".into()
}

fn default_timeout_ms() -> u64 {
    20_000
}

fn default_max_bytes() -> usize {
    5_242_880 // 5MB
}

fn default_true() -> bool {
    true
}

fn default_purge_interval_secs() -> u64 {
    3600
}

fn default_max_ttl_secs() -> u64 {
    30 * 86_400
}

fn default_background_limit() -> usize {
    64
}

fn default_max_depth() -> usize {
    4
}

fn default_collection_limit() -> usize {
    2048
}

fn default_cooldown_secs() -> u64 {
    60
}

fn default_crawl_priority() -> i64 {
    128
}

fn default_workers() -> usize {
    16
}

fn default_buffer_size() -> usize {
    64
}

fn default_lock_secs() -> u64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_retry_max() -> u32 {
    12
}

fn default_max_backoff_minutes() -> u64 {
    4096
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            user_agent: default_user_agent(),
            timeout_ms: default_timeout_ms(),
            max_bytes: default_max_bytes(),
            cache: CacheConfig::default(),
            crawler: CrawlerConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            purge_interval_secs: default_purge_interval_secs(),
            public_mode: false,
            max_ttl_secs: default_max_ttl_secs(),
            background_limit: default_background_limit(),
        }
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_depth: default_max_depth(),
            collection_limit: default_collection_limit(),
            cooldown_secs: default_cooldown_secs(),
            priority: default_crawl_priority(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            buffer_size: default_buffer_size(),
            lock_secs: default_lock_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            polling: true,
            retry_max: default_retry_max(),
            max_backoff_minutes: default_max_backoff_minutes(),
        }
    }
}

impl AppConfig {
    /// Timeout as Duration for use with reqwest/tokio.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Load configuration from all sources with layered precedence.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the config file or environment cannot be
    /// parsed, or if validation fails after loading.
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("OUTPOST_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(
            Env::prefixed("OUTPOST_")
                .ignore(&["config_file"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }
}

impl CacheConfig {
    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }
}

impl CrawlerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl QueueConfig {
    pub fn lock_duration(&self) -> Duration {
        Duration::from_secs(self.lock_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.db_path, PathBuf::from("./outpost.sqlite"));
        assert_eq!(config.user_agent, "outpost/0.1");
        assert_eq!(config.max_bytes, 5_242_880);
        assert_eq!(config.timeout_ms, 20_000);
        assert!(config.cache.enabled);
        assert!(!config.cache.public_mode);
        assert_eq!(config.crawler.max_depth, 4);
        assert_eq!(config.crawler.collection_limit, 2048);
        assert_eq!(config.crawler.priority, 128);
        assert_eq!(config.queue.workers, 16);
        assert_eq!(config.queue.retry_max, 12);
    }

    #[test]
    fn test_durations() {
        let config = AppConfig::default();
        assert_eq!(config.timeout(), Duration::from_millis(20_000));
        assert_eq!(config.cache.purge_interval(), Duration::from_secs(3600));
        assert_eq!(config.crawler.cooldown(), Duration::from_secs(60));
        assert_eq!(config.queue.lock_duration(), Duration::from_secs(300));
        assert_eq!(config.queue.poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: AppConfig = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::string("user_agent = \"test/1\"\n[queue]\nworkers = 2\n"))
            .extract()
            .unwrap();
        assert_eq!(config.user_agent, "test/1");
        assert_eq!(config.queue.workers, 2);
        assert_eq!(config.queue.buffer_size, 64);
        assert_eq!(config.crawler.max_depth, 4);
    }
}
