//! Configuration loading
//!
//! Policies can be built in code, but services usually want them in a file
//! next to the binary. [`TollgateConfig`] holds one default policy per
//! concern plus the store and logging setup.
//!
//! ## File Formats
//! TOML or JSON, detected by extension. Every section and field is
//! optional and falls back to the built-in default.
//!
//! ```toml
//! [retry]
//! max_attempts = 4
//! retryable_statuses = [429, 503]
//!
//! [circuit]
//! failure_threshold = 10
//! mode = { type = "percentage", failure_ratio = 0.5, minimum_throughput = 20 }
//!
//! [rate_limit]
//! limit = 50
//! period_seconds = 1
//!
//! [store]
//! backend = "redis"
//! redis_url = "redis://127.0.0.1:6379/0"
//! ```
//!
//! ## Environment Variables
//! - `TOLLGATE_LOG_LEVEL`: log filter directive (e.g. `info`, `tollgate=debug`)
//! - `TOLLGATE_LOG_FORMAT`: `pretty`, `compact` or `json`
//! - `TOLLGATE_REDIS_URL`: selects the Redis backend at this URL
//! - `TOLLGATE_STORE_NAMESPACE`: key prefix for the shared store

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitPolicy;
use crate::constants::{
    DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY_MS, DEFAULT_MULTIPLIER,
    DEFAULT_RETRYABLE_STATUSES,
};
use crate::error::{ConfigError, ConfigResult, StoreError, StoreResult};
use crate::rate_limiter::RateLimitPolicy;
use crate::retry::{Jitter, RetryPolicy, TransportFailure};
use crate::store::{MemoryStore, Store};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TollgateConfig {
    pub retry: RetrySettings,
    pub circuit: CircuitPolicy,
    pub rate_limit: RateLimitPolicy,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

/// Serializable part of a [`RetryPolicy`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: Jitter,
    pub honor_retry_after: bool,
    /// HTTP statuses worth another attempt
    pub retryable_statuses: Vec<u16>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter: Jitter::None,
            honor_retry_after: true,
            retryable_statuses: DEFAULT_RETRYABLE_STATUSES.to_vec(),
        }
    }
}

/// Which [`Store`] backend to build
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Required when `backend = "redis"`
    pub redis_url: Option<String>,
    /// Prefix applied to every key in a shared store
    pub namespace: Option<String>,
}

/// Output format for the tracing subscriber
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::invalid(format!("unknown log format `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Pretty }
    }
}

impl TollgateConfig {
    /// Load from the first standard config file found, or defaults if none
    /// exists, then apply environment overrides and validate
    ///
    /// # Errors
    /// Returns an error if a found file cannot be read or parsed, or if the
    /// resulting configuration is invalid.
    pub fn load() -> ConfigResult<Self> {
        let mut config = match probe_config_paths() {
            Some(path) => load_from_file(path)?,
            None => {
                tracing::debug!("No config file found, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `TOLLGATE_*` environment variables on top of this configuration
    pub fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable source
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("TOLLGATE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("TOLLGATE_LOG_FORMAT") {
            self.logging.format = format.parse()?;
        }
        if let Some(url) = lookup("TOLLGATE_REDIS_URL") {
            self.store.backend = StoreBackend::Redis;
            self.store.redis_url = Some(url);
        }
        if let Some(namespace) = lookup("TOLLGATE_STORE_NAMESPACE") {
            self.store.namespace = Some(namespace);
        }
        Ok(())
    }

    /// Validate every section
    pub fn validate(&self) -> ConfigResult<()> {
        self.retry_policy::<NoFailure>()?;
        self.circuit.validate()?;
        self.rate_limit.validate()?;
        if self.store.backend == StoreBackend::Redis
            && self.store.redis_url.as_deref().map_or(true, str::is_empty)
        {
            return Err(ConfigError::invalid("store.redis_url is required for the redis backend"));
        }
        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::invalid("logging.level cannot be empty"));
        }
        Ok(())
    }

    /// Build a [`RetryPolicy`] retrying the configured statuses
    pub fn retry_policy<E: TransportFailure>(&self) -> ConfigResult<RetryPolicy<E>> {
        let settings = &self.retry;
        RetryPolicy::builder()
            .max_attempts(settings.max_attempts)
            .base_delay_ms(settings.base_delay_ms)
            .multiplier(settings.multiplier)
            .max_delay_ms(settings.max_delay_ms)
            .jitter(settings.jitter)
            .honor_retry_after(settings.honor_retry_after)
            .retryable_statuses(settings.retryable_statuses.iter().copied())
            .build()
    }

    /// Build the configured store backend
    ///
    /// # Errors
    /// Returns [`StoreError::Unavailable`] if the Redis backend is selected
    /// but cannot be reached, has no URL, or the crate was built without the
    /// `redis` feature.
    pub async fn connect_store(&self) -> StoreResult<Arc<dyn Store>> {
        match self.store.backend {
            StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
            StoreBackend::Redis => {
                let url = self
                    .store
                    .redis_url
                    .as_deref()
                    .ok_or_else(|| StoreError::unavailable("no redis_url configured"))?;
                connect_redis(url, self.store.namespace.as_deref()).await
            }
        }
    }
}

#[cfg(feature = "redis")]
async fn connect_redis(url: &str, namespace: Option<&str>) -> StoreResult<Arc<dyn Store>> {
    let store = crate::store::RedisStore::connect(url).await?;
    Ok(Arc::new(store.with_namespace(namespace.unwrap_or_default())))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(_url: &str, _namespace: Option<&str>) -> StoreResult<Arc<dyn Store>> {
    Err(StoreError::unavailable("tollgate was built without the `redis` feature"))
}

/// Placeholder failure type for validating retry settings
#[derive(Debug, thiserror::Error)]
#[error("unreachable")]
struct NoFailure;

impl TransportFailure for NoFailure {}

/// Load configuration from a TOML or JSON file
///
/// Environment overrides are not applied; see [`TollgateConfig::load`].
///
/// # Errors
/// Returns [`ConfigError::Io`] if the file cannot be read and
/// [`ConfigError::Parse`] or [`ConfigError::UnsupportedFormat`] if it
/// cannot be parsed.
pub fn load_from_file(path: impl AsRef<Path>) -> ConfigResult<TollgateConfig> {
    let path = path.as_ref();
    tracing::info!(path = %path.display(), "Loading configuration from file");

    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents, path)
}

/// Parse configuration from string content
///
/// Format is detected by file extension (`.json` or `.toml`).
pub fn parse_config(contents: &str, path: &Path) -> ConfigResult<TollgateConfig> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match extension {
        "toml" => toml::from_str(contents)
            .map_err(|e| ConfigError::Parse { format: "TOML", message: e.to_string() }),
        "json" => serde_json::from_str(contents)
            .map_err(|e| ConfigError::Parse { format: "JSON", message: e.to_string() }),
        _ => Err(ConfigError::UnsupportedFormat { extension: extension.to_string() }),
    }
}

/// Probe the working directory for `tollgate.{toml,json}`, then
/// `config.{toml,json}`
///
/// # Returns
/// The first config file found, or `None` if no file exists.
pub fn probe_config_paths() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    ["tollgate.toml", "tollgate.json", "config.toml", "config.json"]
        .into_iter()
        .map(|name| cwd.join(name))
        .find(|path| path.exists())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::circuit_breaker::FailureMode;
    use crate::retry::FailureClass;
    use crate::testing::TestFailure;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(TollgateConfig::default().validate().is_ok());
    }

    #[test]
    fn test_parse_toml_with_partial_sections() {
        let contents = r#"
            [retry]
            max_attempts = 5
            retryable_statuses = [503]

            [circuit]
            failure_threshold = 10
            mode = { type = "percentage", failure_ratio = 0.25, minimum_throughput = 20 }

            [rate_limit]
            limit = 50
            algorithm = "sliding_window"
        "#;
        let config = parse_config(contents, Path::new("tollgate.toml")).unwrap();

        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, DEFAULT_BASE_DELAY_MS);
        assert_eq!(config.circuit.failure_threshold, 10);
        assert_eq!(
            config.circuit.mode,
            FailureMode::Percentage { failure_ratio: 0.25, minimum_throughput: 20 }
        );
        assert_eq!(config.rate_limit.limit, 50);
        assert_eq!(config.rate_limit.period_seconds, 60);
        assert_eq!(config.store.backend, StoreBackend::Memory);
    }

    #[test]
    fn test_parse_json() {
        let contents = r#"{"rate_limit": {"limit": 7, "concurrency_limit": 2}, "logging": {"format": "json"}}"#;
        let config = parse_config(contents, Path::new("tollgate.json")).unwrap();
        assert_eq!(config.rate_limit.limit, 7);
        assert_eq!(config.rate_limit.concurrency_limit, Some(2));
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_parse_errors() {
        let err = parse_config("not = [valid", Path::new("a.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { format: "TOML", .. }));

        let err = parse_config("{}", Path::new("a.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedFormat { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = TollgateConfig::default();
        config
            .apply_overrides_from(lookup(&[
                ("TOLLGATE_LOG_LEVEL", "tollgate=debug"),
                ("TOLLGATE_LOG_FORMAT", "JSON"),
                ("TOLLGATE_REDIS_URL", "redis://cache:6379"),
                ("TOLLGATE_STORE_NAMESPACE", "billing"),
            ]))
            .unwrap();

        assert_eq!(config.logging.level, "tollgate=debug");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.store.namespace.as_deref(), Some("billing"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_log_format_override() {
        let mut config = TollgateConfig::default();
        let result = config.apply_overrides_from(lookup(&[("TOLLGATE_LOG_FORMAT", "xml")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = TollgateConfig::default();
        config.store.backend = StoreBackend::Redis;
        assert!(config.validate().is_err());

        let mut config = TollgateConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = TollgateConfig::default();
        config.circuit.success_threshold = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_policy_uses_configured_statuses() {
        let mut config = TollgateConfig::default();
        config.retry.retryable_statuses = vec![418];
        let policy = config.retry_policy::<TestFailure>().unwrap();

        assert_eq!(policy.classify(&TestFailure::http(418)), FailureClass::Retryable);
        assert_eq!(policy.classify(&TestFailure::http(503)), FailureClass::Fatal);
    }

    #[tokio::test]
    async fn test_connect_memory_store() {
        let store = TollgateConfig::default().connect_store().await.unwrap();
        assert_eq!(store.increment("k", 1, None).await.unwrap(), 1);
    }
}
