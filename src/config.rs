//! Configuration types for depot-sync

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Top-level sync configuration
///
/// Every field has a default, so an empty JSON object is a valid configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Maximum files downloading at once (default: 10)
    ///
    /// This is the admission gate: chunks inside one file are not bounded,
    /// files are. Keeps open handles and remote load in check.
    #[serde(default = "default_max_concurrent_files")]
    pub max_concurrent_files: usize,

    /// Verify each chunk's Adler-32 checksum before writing (default: true)
    #[serde(default = "default_true")]
    pub verify_checksums: bool,

    /// Stop the whole sync when a single file fails to materialize (default: true)
    ///
    /// Authorization failures and pool exhaustion always stop the sync.
    #[serde(default = "default_true")]
    pub fail_fast: bool,

    /// Interval between depot-wide progress events (default: 500ms)
    #[serde(default = "default_progress_interval", with = "duration_millis_serde")]
    pub progress_interval: Duration,

    /// Capacity of the event broadcast channel (default: 1000)
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Per-chunk retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Connection pool behavior
    #[serde(default)]
    pub pool: PoolConfig,

    /// HTTP transport settings
    #[serde(default)]
    pub http: HttpConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrent_files: default_max_concurrent_files(),
            verify_checksums: true,
            fail_fast: true,
            progress_interval: default_progress_interval(),
            event_buffer: default_event_buffer(),
            retry: RetryConfig::default(),
            pool: PoolConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Load a configuration from a JSON file, then validate it
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: SyncConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would deadlock or spin
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_files == 0 {
            return Err(config_error(
                "max_concurrent_files must be at least 1",
                "max_concurrent_files",
            ));
        }
        if self.event_buffer == 0 {
            return Err(config_error(
                "event_buffer must be at least 1",
                "event_buffer",
            ));
        }
        if self.pool.connections_per_endpoint == 0 {
            return Err(config_error(
                "connections_per_endpoint must be at least 1",
                "pool.connections_per_endpoint",
            ));
        }
        if self.pool.max_endpoint_failures == 0 {
            return Err(config_error(
                "max_endpoint_failures must be at least 1",
                "pool.max_endpoint_failures",
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(config_error(
                "backoff_multiplier must be >= 1.0",
                "retry.backoff_multiplier",
            ));
        }
        Ok(())
    }
}

fn config_error(message: &str, key: &str) -> Error {
    Error::Config {
        message: message.to_string(),
        key: Some(key.to_string()),
    }
}

/// Retry configuration for retryable chunk failures
///
/// The default retries without limit or delay, relying on pool exhaustion or
/// cancellation to end the loop. Set `max_attempts` and a delay to harden it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt (None = unbounded)
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// Delay before the first retry (default: 0ms)
    #[serde(default, with = "duration_millis_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 30 seconds)
    #[serde(default = "default_max_delay", with = "duration_millis_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_delay: Duration::ZERO,
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Connection pool configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Concurrent leases allowed per endpoint (default: 8)
    #[serde(default = "default_connections_per_endpoint")]
    pub connections_per_endpoint: usize,

    /// Consecutive broken releases before an endpoint is evicted (default: 3)
    #[serde(default = "default_max_endpoint_failures")]
    pub max_endpoint_failures: u32,

    /// How long a broken endpoint is passed over while others are healthy (default: 2s)
    #[serde(default = "default_penalty", with = "duration_millis_serde")]
    pub penalty: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connections_per_endpoint: default_connections_per_endpoint(),
            max_endpoint_failures: default_max_endpoint_failures(),
            penalty: default_penalty(),
        }
    }
}

/// HTTP transport configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Per-request timeout (default: 30 seconds)
    #[serde(default = "default_http_timeout", with = "duration_serde")]
    pub timeout: Duration,

    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: default_http_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_max_concurrent_files() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_progress_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_event_buffer() -> usize {
    1000
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_connections_per_endpoint() -> usize {
    8
}

fn default_max_endpoint_failures() -> u32 {
    3
}

fn default_penalty() -> Duration {
    Duration::from_secs(2)
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_user_agent() -> String {
    format!("depot-sync/{}", env!("CARGO_PKG_VERSION"))
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Duration serialization helper (milliseconds)
mod duration_millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_yields_defaults() {
        let config: SyncConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_concurrent_files, 10);
        assert!(config.verify_checksums);
        assert!(config.fail_fast);
        assert_eq!(config.progress_interval, Duration::from_millis(500));
        assert_eq!(config.retry, RetryConfig::default());
        assert_eq!(config.retry.max_attempts, None, "default retry is unbounded");
        assert_eq!(config.pool, PoolConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn nested_sections_override_individual_fields() {
        let json = r#"{
            "max_concurrent_files": 4,
            "retry": { "max_attempts": 5, "initial_delay": 250 },
            "pool": { "connections_per_endpoint": 2 },
            "http": { "timeout": 10 }
        }"#;
        let config: SyncConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.max_concurrent_files, 4);
        assert_eq!(config.retry.max_attempts, Some(5));
        assert_eq!(config.retry.initial_delay, Duration::from_millis(250));
        assert_eq!(config.retry.backoff_multiplier, 2.0);
        assert_eq!(config.pool.connections_per_endpoint, 2);
        assert_eq!(config.pool.max_endpoint_failures, 3);
        assert_eq!(config.http.timeout, Duration::from_secs(10));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = SyncConfig {
            max_concurrent_files: 0,
            ..SyncConfig::default()
        };
        match config.validate() {
            Err(Error::Config { key, .. }) => {
                assert_eq!(key.as_deref(), Some("max_concurrent_files"));
            }
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn zero_connections_per_endpoint_is_rejected() {
        let mut config = SyncConfig::default();
        config.pool.connections_per_endpoint = 0;
        assert!(matches!(config.validate(), Err(Error::Config { .. })));
    }

    #[test]
    fn from_json_file_reads_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.json");
        std::fs::write(&path, r#"{ "max_concurrent_files": 2 }"#).unwrap();
        let config = SyncConfig::from_json_file(&path).unwrap();
        assert_eq!(config.max_concurrent_files, 2);

        std::fs::write(&path, r#"{ "max_concurrent_files": 0 }"#).unwrap();
        assert!(SyncConfig::from_json_file(&path).is_err());

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            SyncConfig::from_json_file(&path),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn serializes_durations_as_numbers() {
        let json = serde_json::to_value(SyncConfig::default()).unwrap();
        assert_eq!(json["progress_interval"], 500);
        assert_eq!(json["http"]["timeout"], 30);
        assert_eq!(json["pool"]["penalty"], 2000);
    }
}
