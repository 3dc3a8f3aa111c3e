//! Error taxonomy for the pipeline
//!
//! Recoverable errors are isolated to the record, source or connection that
//! produced them. Only `ConfigurationError` is fatal, and only for the
//! affected source.

use super::types::{BucketKey, RecordKey};
use std::fmt;
use std::time::Duration;

/// Why a field was rejected during normalization
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizationReason {
    Missing,
    NotFinite,
    Negative,
    BelowMinimum,
    OutOfRange,
    InvalidTimestamp,
    Malformed,
}

impl fmt::Display for NormalizationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NormalizationReason::Missing => "required field is missing",
            NormalizationReason::NotFinite => "value is not a finite number",
            NormalizationReason::Negative => "value must be >= 0",
            NormalizationReason::BelowMinimum => "value must be >= 1.0",
            NormalizationReason::OutOfRange => "value must be within [0, 100]",
            NormalizationReason::InvalidTimestamp => "timestamp must be between 1970 and 9999",
            NormalizationReason::Malformed => "payload does not match the expected shape",
        };
        f.write_str(s)
    }
}

/// Bad input shape or range; the caller decides to drop or correct the record
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid field `{field}` = {value}: {reason}")]
pub struct NormalizationError {
    pub field: String,
    pub value: String,
    pub reason: NormalizationReason,
}

impl NormalizationError {
    pub fn new(field: impl Into<String>, value: impl ToString, reason: NormalizationReason) -> Self {
        Self {
            field: field.into(),
            value: value.to_string(),
            reason,
        }
    }

    pub fn missing(field: impl Into<String>) -> Self {
        Self::new(field, "<none>", NormalizationReason::Missing)
    }
}

/// Missing credentials or invalid required settings
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("required setting `{0}` is missing or empty")]
    Missing(String),

    #[error("setting `{key}` has invalid value `{value}`: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// Failure to fetch raw payloads from one source
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("HTTP error: status={status}, body={body}")]
    Http { status: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("cancelled")]
    Cancelled,
}

impl FetchError {
    /// Transient failures are retried with backoff; the rest fail immediately
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout(_) | FetchError::Connection(_) => true,
            FetchError::Http { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            FetchError::Malformed(_) | FetchError::Configuration(_) | FetchError::Cancelled => false,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout(Duration::ZERO)
        } else if e.is_decode() {
            FetchError::Malformed(e.to_string())
        } else if let Some(status) = e.status() {
            FetchError::Http {
                status: status.as_u16(),
                body: e.to_string(),
            }
        } else {
            FetchError::Connection(e.to_string())
        }
    }
}

/// Per-source collection failure; never aborts other sources
#[derive(Debug, Clone, thiserror::Error)]
pub enum CollectionError {
    #[error("source `{source_id}` fetch failed after {attempts} attempt(s): {error}")]
    Fetch {
        source_id: String,
        attempts: u32,
        #[source]
        error: FetchError,
    },

    #[error("source `{source_id}` produced an invalid record: {error}")]
    Normalization {
        source_id: String,
        #[source]
        error: NormalizationError,
    },
}

impl CollectionError {
    pub fn source_id(&self) -> &str {
        match self {
            CollectionError::Fetch { source_id, .. } => source_id,
            CollectionError::Normalization { source_id, .. } => source_id,
        }
    }

    pub fn is_fetch_failure(&self) -> bool {
        matches!(self, CollectionError::Fetch { .. })
    }
}

/// Errors from the external store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Some records were rejected; the caller may retry that subset
    #[error("store rejected {} record(s)", .rejected.len())]
    PartialFailure { rejected: Vec<RecordKey> },

    #[error("change feed disconnected: {0}")]
    Disconnected(String),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("store backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Aggregation engine rejections
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    /// A record that should have been rejected by the normalizer reached `apply`
    #[error("invariant violation for {key}: {reason}")]
    InvariantViolation { key: RecordKey, reason: String },

    /// The record's windows have all been retired
    #[error("record {key} arrived after its windows were retired")]
    LateRecord { key: RecordKey },

    #[error("bucket not found: {0}")]
    NotFound(BucketKey),
}

/// Change relay receive failures
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("receive timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("relay cancelled")]
    Cancelled,
}

impl From<StoreError> for RelayError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Timeout(d) => RelayError::Timeout(d),
            other => RelayError::Connection(other.to_string()),
        }
    }
}
