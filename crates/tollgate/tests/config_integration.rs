//! Integration tests for configuration loading from files

use std::io::Write;

use tempfile::NamedTempFile;
use tollgate::config::{load_from_file, LogFormat, StoreBackend};
use tollgate::{
    ConfigError, FailureMode, Store, TollgateConfig, TransportFailure, WindowAlgorithm,
};

#[derive(Debug, thiserror::Error)]
#[error("status {0}")]
struct StatusFailure(u16);

impl TransportFailure for StatusFailure {
    fn status(&self) -> Option<u16> {
        Some(self.0)
    }
}

fn write_config(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

/// Validates loading a complete TOML file.
///
/// # Test Steps
/// 1. Write every section to a temporary `.toml` file
/// 2. Load it and verify each section was parsed
/// 3. Build the retry policy and store from the loaded values
#[tokio::test]
async fn test_load_toml_file() {
    let file = write_config(
        ".toml",
        r#"
        [retry]
        max_attempts = 4
        base_delay_ms = 250
        jitter = "equal"
        retryable_statuses = [503]

        [circuit]
        failure_threshold = 8
        reset_timeout_seconds = 15
        reset_on_success = true

        [rate_limit]
        limit = 20
        period_seconds = 10
        concurrency_limit = 4
        algorithm = "sliding_window"

        [store]
        backend = "memory"

        [logging]
        level = "tollgate=debug"
        format = "compact"
        "#,
    );

    let config = load_from_file(file.path()).unwrap();
    config.validate().unwrap();

    assert_eq!(config.retry.max_attempts, 4);
    assert_eq!(config.retry.base_delay_ms, 250);
    assert_eq!(config.circuit.failure_threshold, 8);
    assert!(config.circuit.reset_on_success);
    assert_eq!(config.circuit.mode, FailureMode::Count);
    assert_eq!(config.rate_limit.algorithm, WindowAlgorithm::SlidingWindow);
    assert_eq!(config.rate_limit.concurrency_limit, Some(4));
    assert_eq!(config.store.backend, StoreBackend::Memory);
    assert_eq!(config.logging.format, LogFormat::Compact);

    let policy = config.retry_policy::<StatusFailure>().unwrap();
    assert_eq!(policy.max_attempts, 4);
    assert_eq!(policy.classify(&StatusFailure(503)), tollgate::FailureClass::Retryable);
    assert_eq!(policy.classify(&StatusFailure(502)), tollgate::FailureClass::Fatal);

    let store = config.connect_store().await.unwrap();
    assert_eq!(store.increment("probe", 2, None).await.unwrap(), 2);
}

#[test]
fn test_load_json_file() {
    let file = write_config(".json", r#"{"circuit": {"failure_threshold": 2, "success_threshold": 1}}"#);
    let config = load_from_file(file.path()).unwrap();

    assert_eq!(config.circuit.failure_threshold, 2);
    assert_eq!(config.circuit.success_threshold, 1);
    assert_eq!(config.retry, TollgateConfig::default().retry);
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_from_file(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}

#[test]
fn test_invalid_file_contents() {
    let file = write_config(".json", "{ not json");
    assert!(matches!(load_from_file(file.path()), Err(ConfigError::Parse { format: "JSON", .. })));

    let file = write_config(".yml", "retry: {}");
    assert!(matches!(load_from_file(file.path()), Err(ConfigError::UnsupportedFormat { .. })));
}

#[test]
fn test_semantically_invalid_file_fails_validation() {
    let file = write_config(".toml", "[rate_limit]\nperiod_seconds = 0\n");
    let config = load_from_file(file.path()).unwrap();
    assert!(config.validate().is_err());
}
