//! Runtime configuration
//!
//! Settings are loaded from environment variables named after the Celery
//! settings they stand in for. Missing or unparseable values fall back to
//! the defaults.

use std::env;

use crate::error::{TaskError, TaskResult};

/// Queue every handler is registered on
pub const DEFAULT_QUEUE: &str = "celery_default";

/// Configuration for the worker runtime
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Broker URL tasks are enqueued on
    pub broker_url: String,
    /// Result backend URL, must be redis-compatible
    pub result_backend: String,
    /// Cache store URL, `redis://...` or `memory://`
    pub cache_url: String,
    /// Execute tasks inline in the caller instead of enqueuing them
    pub always_eager: bool,
    /// Register the test-only tasks
    pub testing: bool,
    /// Queue handlers are registered on
    pub default_queue: String,
    /// Storage bucket exposed to handlers
    pub bucket: String,
    /// Prefix for emitted metric names
    pub stats_prefix: String,
    /// Task result TTL in seconds
    pub result_ttl: u64,
    /// Failed task TTL in seconds
    pub failed_ttl: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            broker_url: "redis://127.0.0.1:6379/0".to_string(),
            result_backend: "redis://127.0.0.1:6379/0".to_string(),
            cache_url: "redis://127.0.0.1:6379/1".to_string(),
            always_eager: false,
            testing: false,
            default_queue: DEFAULT_QUEUE.to_string(),
            bucket: "contextgraph".to_string(),
            stats_prefix: "contextgraph".to_string(),
            result_ttl: 86400,  // 24 hours
            failed_ttl: 604800, // 7 days
        }
    }
}

impl AppConfig {
    /// Load configuration from the process environment.
    ///
    /// # Environment Variables
    /// - `BROKER_URL`
    /// - `CELERY_RESULT_BACKEND`
    /// - `CACHE_URL`
    /// - `CELERY_ALWAYS_EAGER` - `true`/`1` to run tasks inline
    /// - `TESTING` - `true`/`1` to register `dummy` and `error`
    /// - `BUCKET`
    /// - `STATS_PREFIX`
    /// - `RESULT_TTL`, `FAILED_TTL` - seconds
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let flag = |key: &str, default: bool| {
            lookup(key)
                .and_then(|v| parse_flag(&v))
                .unwrap_or(default)
        };
        let seconds = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };

        Self {
            broker_url: lookup("BROKER_URL").unwrap_or(defaults.broker_url),
            result_backend: lookup("CELERY_RESULT_BACKEND").unwrap_or(defaults.result_backend),
            cache_url: lookup("CACHE_URL").unwrap_or(defaults.cache_url),
            always_eager: flag("CELERY_ALWAYS_EAGER", defaults.always_eager),
            testing: flag("TESTING", defaults.testing),
            default_queue: defaults.default_queue,
            bucket: lookup("BUCKET").unwrap_or(defaults.bucket),
            stats_prefix: lookup("STATS_PREFIX").unwrap_or(defaults.stats_prefix),
            result_ttl: seconds("RESULT_TTL", defaults.result_ttl),
            failed_ttl: seconds("FAILED_TTL", defaults.failed_ttl),
        }
    }

    /// Configuration used by the test suite: eager execution, an in-memory
    /// cache and the test-only tasks registered.
    pub fn testing() -> Self {
        Self {
            always_eager: true,
            testing: true,
            cache_url: "memory://".to_string(),
            result_backend: "redis://127.0.0.1:6379/2".to_string(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> TaskResult<()> {
        if self.default_queue.is_empty() {
            return Err(TaskError::config("default queue name is empty"));
        }
        if !self.result_backend.starts_with("redis") {
            return Err(TaskError::config(format!(
                "result backend must be redis, got {}",
                self.result_backend
            )));
        }
        if self.cache_url.is_empty() {
            return Err(TaskError::config("cache url is empty"));
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_config_default() {
        let config = AppConfig::default();
        assert_eq!(config.default_queue, "celery_default");
        assert!(!config.always_eager);
        assert!(!config.testing);
        assert_eq!(config.result_ttl, 86400);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("CELERY_ALWAYS_EAGER", "True"),
            ("CELERY_RESULT_BACKEND", "redis://cache:6379/3"),
            ("TESTING", "1"),
            ("RESULT_TTL", "not-a-number"),
            ("BUCKET", "uploads"),
        ]
        .into_iter()
        .collect();

        let config = AppConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert!(config.always_eager);
        assert!(config.testing);
        assert_eq!(config.result_backend, "redis://cache:6379/3");
        assert_eq!(config.result_ttl, 86400);
        assert_eq!(config.bucket, "uploads");
    }

    #[test]
    fn test_validate_rejects_non_redis_backend() {
        let config = AppConfig {
            result_backend: "rpc://".to_string(),
            ..AppConfig::default()
        };
        assert!(matches!(config.validate(), Err(TaskError::Config { .. })));
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("ON"), Some(true));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }
}
