//! Pipeline configuration from environment variables

use super::collector::CollectorConfig;
use super::engine::EngineConfig;
use super::error::ConfigurationError;
use super::normalizer::SourceKind;
use super::relay::RelayConfig;
use super::types::WindowSize;
use super::windows::{parse_window_list, RetentionPolicy};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Configuration for pipeline runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Directory holding the schema .sql files
    pub schema_dir: String,

    /// Collector poll cadence in milliseconds
    pub collect_interval_ms: u64,

    /// Aggregate flush interval in milliseconds
    pub flush_interval_ms: u64,

    /// Store change-feed poll cadence in milliseconds
    pub relay_poll_interval_ms: u64,

    /// Relay per-receive timeout in milliseconds
    pub relay_recv_timeout_ms: u64,

    /// Per-fetch timeout in milliseconds
    pub fetch_timeout_ms: u64,

    /// Retries for transient fetch failures
    pub fetch_max_retries: u32,

    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,

    /// Per-subscriber bucket-update queue capacity
    pub subscriber_buffer: usize,

    /// Relay de-dup table size
    pub dedup_capacity: usize,

    /// Grace after window end before a bucket retires
    pub retention_secs: i64,

    /// Window sizes maintained by the engine
    pub windows: Vec<WindowSize>,

    /// JSON rule file; built-in rules when unset
    pub alert_rules_path: Option<PathBuf>,

    /// Mean emissions threshold for the built-in critical rule
    pub alert_critical_emissions_kg: f64,

    /// Dataset files to ingest, CSV or JSON lines by extension
    pub dataset_paths: Vec<PathBuf>,

    /// Provider APIs to poll
    pub enabled_providers: Vec<SourceKind>,

    /// Enable the synthetic generator source
    pub enable_synthetic: bool,
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `EMISSIONFLOW_DB_PATH` (default: emissionflow.db)
    /// - `EMISSIONFLOW_SCHEMA_DIR` (default: sql)
    /// - `COLLECT_INTERVAL_MS` (default: 60000)
    /// - `FLUSH_INTERVAL_MS` (default: 5000)
    /// - `RELAY_POLL_INTERVAL_MS` (default: 1000)
    /// - `RELAY_RECV_TIMEOUT_MS` (default: 30000)
    /// - `FETCH_TIMEOUT_MS` (default: 10000)
    /// - `FETCH_MAX_RETRIES` (default: 3)
    /// - `BACKOFF_INITIAL_MS` / `BACKOFF_MAX_MS` (default: 500 / 30000)
    /// - `SUBSCRIBER_BUFFER` (default: 1024)
    /// - `DEDUP_CAPACITY` (default: 10000)
    /// - `RETENTION_SECS` (default: 86400)
    /// - `AGGREGATE_WINDOWS` (default: 1h,1d)
    /// - `ALERT_RULES_PATH` (default: unset)
    /// - `ALERT_CRITICAL_EMISSIONS_KG` (default: 1000)
    /// - `DATASET_PATHS` (comma-separated, default: unset)
    /// - `ENABLE_PROVIDERS` (comma-separated of gcp,aws,azure, default: unset)
    /// - `ENABLE_SYNTHETIC` (default: false)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as `from_env` with an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let windows = lookup("AGGREGATE_WINDOWS")
            .map(|s| parse_window_list(&s))
            .filter(|w| !w.is_empty())
            .unwrap_or_else(|| vec![WindowSize::Hour1, WindowSize::Day1]);

        let enabled_providers = lookup("ENABLE_PROVIDERS")
            .map(|s| {
                split_list(&s)
                    .filter_map(|name| match SourceKind::parse(name) {
                        Some(kind @ (SourceKind::Gcp | SourceKind::Aws | SourceKind::Azure)) => Some(kind),
                        _ => {
                            log::warn!("⚠️  Ignoring unknown provider `{}` in ENABLE_PROVIDERS", name);
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            db_path: lookup("EMISSIONFLOW_DB_PATH").unwrap_or_else(|| "emissionflow.db".to_string()),
            schema_dir: lookup("EMISSIONFLOW_SCHEMA_DIR").unwrap_or_else(|| "sql".to_string()),
            collect_interval_ms: parse_or(&lookup, "COLLECT_INTERVAL_MS", 60_000),
            flush_interval_ms: parse_or(&lookup, "FLUSH_INTERVAL_MS", 5_000),
            relay_poll_interval_ms: parse_or(&lookup, "RELAY_POLL_INTERVAL_MS", 1_000),
            relay_recv_timeout_ms: parse_or(&lookup, "RELAY_RECV_TIMEOUT_MS", 30_000),
            fetch_timeout_ms: parse_or(&lookup, "FETCH_TIMEOUT_MS", 10_000),
            fetch_max_retries: parse_or(&lookup, "FETCH_MAX_RETRIES", 3),
            backoff_initial_ms: parse_or(&lookup, "BACKOFF_INITIAL_MS", 500),
            backoff_max_ms: parse_or(&lookup, "BACKOFF_MAX_MS", 30_000),
            subscriber_buffer: parse_or(&lookup, "SUBSCRIBER_BUFFER", 1_024),
            dedup_capacity: parse_or(&lookup, "DEDUP_CAPACITY", 10_000),
            retention_secs: parse_or(&lookup, "RETENTION_SECS", 86_400),
            windows,
            alert_rules_path: lookup("ALERT_RULES_PATH").filter(|s| !s.trim().is_empty()).map(PathBuf::from),
            alert_critical_emissions_kg: parse_or(&lookup, "ALERT_CRITICAL_EMISSIONS_KG", 1_000.0),
            dataset_paths: lookup("DATASET_PATHS")
                .map(|s| split_list(&s).map(PathBuf::from).collect())
                .unwrap_or_default(),
            enabled_providers,
            enable_synthetic: parse_or(&lookup, "ENABLE_SYNTHETIC", false),
        }
    }

    /// Reject settings the runtime cannot work with
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let positive = [
            ("COLLECT_INTERVAL_MS", self.collect_interval_ms),
            ("FLUSH_INTERVAL_MS", self.flush_interval_ms),
            ("RELAY_POLL_INTERVAL_MS", self.relay_poll_interval_ms),
            ("RELAY_RECV_TIMEOUT_MS", self.relay_recv_timeout_ms),
            ("FETCH_TIMEOUT_MS", self.fetch_timeout_ms),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigurationError::Invalid {
                    key: key.to_string(),
                    value: value.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        if self.retention_secs < 0 {
            return Err(ConfigurationError::Invalid {
                key: "RETENTION_SECS".to_string(),
                value: self.retention_secs.to_string(),
                reason: "must be >= 0".to_string(),
            });
        }

        if self.db_path.trim().is_empty() {
            return Err(ConfigurationError::Missing("EMISSIONFLOW_DB_PATH".to_string()));
        }

        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            windows: self.windows.clone(),
            retention: RetentionPolicy::new(self.retention_secs),
            subscriber_buffer: self.subscriber_buffer,
        }
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            recv_timeout: Duration::from_millis(self.relay_recv_timeout_ms),
            dedup_capacity: self.dedup_capacity,
            backoff_initial_ms: self.backoff_initial_ms,
            backoff_max_ms: self.backoff_max_ms,
        }
    }

    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            fetch_timeout: Duration::from_millis(self.fetch_timeout_ms),
            max_retries: self.fetch_max_retries,
            backoff_initial_ms: self.backoff_initial_ms,
            backoff_max_ms: self.backoff_max_ms,
        }
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("⚠️  Invalid value `{}` for {}, using default", raw, key);
                default
            }
        },
        None => default,
    }
}

fn split_list(s: &str) -> impl Iterator<Item = &str> {
    s.split(',').map(str::trim).filter(|item| !item.is_empty())
}

/// Credentials and endpoint for one provider API
#[derive(Clone, PartialEq)]
pub struct ProviderCredentials {
    pub kind: SourceKind,
    pub api_key: String,
    pub endpoint: String,
}

impl ProviderCredentials {
    pub fn key_var(kind: SourceKind) -> Option<&'static str> {
        match kind {
            SourceKind::Gcp => Some("GCP_API_KEY"),
            SourceKind::Aws => Some("AWS_API_KEY"),
            SourceKind::Azure => Some("AZURE_API_KEY"),
            SourceKind::Dataset | SourceKind::Synthetic => None,
        }
    }

    fn endpoint_var(kind: SourceKind) -> Option<&'static str> {
        match kind {
            SourceKind::Gcp => Some("GCP_ENDPOINT"),
            SourceKind::Aws => Some("AWS_ENDPOINT"),
            SourceKind::Azure => Some("AZURE_ENDPOINT"),
            SourceKind::Dataset | SourceKind::Synthetic => None,
        }
    }

    pub fn default_endpoint(kind: SourceKind) -> Option<&'static str> {
        match kind {
            SourceKind::Gcp => Some("https://cloudasset.googleapis.com/v1"),
            SourceKind::Aws => Some("https://sustainability.aws.amazon.com/v1"),
            SourceKind::Azure => Some("https://management.azure.com/sustainability/v1"),
            SourceKind::Dataset | SourceKind::Synthetic => None,
        }
    }

    pub fn from_env(kind: SourceKind) -> Result<Self, ConfigurationError> {
        Self::from_lookup(kind, |key| env::var(key).ok())
    }

    /// Resolve credentials for `kind`; a missing or blank key is an error
    pub fn from_lookup(
        kind: SourceKind,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigurationError> {
        let (Some(key_var), Some(endpoint_var), Some(default_endpoint)) = (
            Self::key_var(kind),
            Self::endpoint_var(kind),
            Self::default_endpoint(kind),
        ) else {
            return Err(ConfigurationError::Invalid {
                key: "ENABLE_PROVIDERS".to_string(),
                value: kind.as_str().to_string(),
                reason: "not a provider API".to_string(),
            });
        };

        let api_key = lookup(key_var)
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ConfigurationError::Missing(key_var.to_string()))?;

        let endpoint = lookup(endpoint_var)
            .map(|e| e.trim().trim_end_matches('/').to_string())
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| default_endpoint.to_string());

        Ok(Self {
            kind,
            api_key,
            endpoint,
        })
    }
}

impl fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("kind", &self.kind)
            .field("api_key", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}
