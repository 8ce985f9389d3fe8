//! Configuration validation rules.
//!
//! Checks `AppConfig` values after they have been loaded from environment,
//! files, or defaults.

use crate::config::AppConfig;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid { field: field.into(), reason: reason.into() }
}

impl AppConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_bytes == 0 {
            return Err(invalid("max_bytes", "must be greater than 0"));
        }
        if self.max_bytes > 50 * 1024 * 1024 {
            return Err(invalid("max_bytes", "must not exceed 50MB"));
        }

        if self.timeout_ms < 100 {
            return Err(invalid("timeout_ms", "must be at least 100ms"));
        }
        if self.timeout_ms > 300_000 {
            return Err(invalid("timeout_ms", "must not exceed 5 minutes (300000ms)"));
        }

        if self.user_agent.is_empty() {
            return Err(invalid("user_agent", "must not be empty"));
        }

        if self.cache.purge_interval_secs == 0 {
            return Err(invalid("cache.purge_interval_secs", "must be greater than 0"));
        }
        if self.cache.background_limit == 0 {
            return Err(invalid("cache.background_limit", "must be greater than 0"));
        }

        if self.crawler.max_depth == 0 {
            return Err(invalid("crawler.max_depth", "must be greater than 0"));
        }

        if self.queue.workers == 0 {
            return Err(invalid("queue.workers", "must be greater than 0"));
        }
        if self.queue.buffer_size == 0 {
            return Err(invalid("queue.buffer_size", "must be greater than 0"));
        }
        if self.queue.lock_secs == 0 {
            return Err(invalid("queue.lock_secs", "must be greater than 0"));
        }

        if !self.cache.enabled && self.queue.polling {
            tracing::warn!(
                "cache.enabled is false; documents will not be stored but the queue \
                 still polls the database for tasks"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_validate_default_config() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_max_bytes_zero() {
        let config = AppConfig { max_bytes: 0, ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "max_bytes"));
    }

    #[test]
    fn test_validate_timeout_exceeds_limit() {
        let config = AppConfig { timeout_ms: 301_000, ..Default::default() }; // 5min 1sec
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "timeout_ms"));
    }

    #[test]
    fn test_validate_empty_user_agent() {
        let config = AppConfig { user_agent: String::new(), ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "user_agent"));
    }

    #[rstest]
    #[case("crawler.max_depth")]
    #[case("queue.workers")]
    #[case("queue.buffer_size")]
    #[case("queue.lock_secs")]
    #[case("cache.background_limit")]
    fn test_validate_zero_sections(#[case] expected: &str) {
        let mut config = AppConfig::default();
        match expected {
            "crawler.max_depth" => config.crawler.max_depth = 0,
            "queue.workers" => config.queue.workers = 0,
            "queue.buffer_size" => config.queue.buffer_size = 0,
            "queue.lock_secs" => config.queue.lock_secs = 0,
            _ => config.cache.background_limit = 0,
        }
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == expected));
    }

    #[test]
    fn test_validate_edge_case_values() {
        let config = AppConfig { max_bytes: 1, timeout_ms: 100, ..Default::default() }; // minimum valid values
        assert!(config.validate().is_ok());
    }
}
