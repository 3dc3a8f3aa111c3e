//! Core data structures shared across the pipeline
//!
//! - `EmissionRecord` - one normalized observation (immutable once built)
//! - `BucketKey` / `AggregateBucket` - incrementally maintained aggregates
//! - `AlertEvent` - edge-triggered rule transitions

use serde::{Deserialize, Serialize};
use std::fmt;

pub use super::windows::WindowSize;

/// Dimension value used for the global bucket of every window
pub const GLOBAL_DIMENSION_VALUE: &str = "all";

/// One normalized emission observation
///
/// Identified by `(source_id, observed_at, location)`. Records with the same
/// key are duplicates and must be ignored idempotently everywhere downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmissionRecord {
    /// Provider or dataset name (e.g. "GCP", "AWS", "owid-dataset")
    pub source_id: String,

    /// Facility or region identifier
    pub location: String,

    /// Unix timestamp (seconds); not monotonic per source
    pub observed_at: i64,

    pub energy_consumption_mwh: f64,
    pub total_emissions_kg: f64,
    pub renewable_usage_pct: f64,
    pub ai_workload_pct: f64,
    pub pue: f64,
}

impl EmissionRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            source_id: self.source_id.clone(),
            observed_at: self.observed_at,
            location: self.location.clone(),
        }
    }
}

/// Composite identity of an EmissionRecord
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub source_id: String,
    pub observed_at: i64,
    pub location: String,
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.source_id, self.location, self.observed_at)
    }
}

/// Aggregation dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    Provider,
    Location,
    Global,
}

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Provider => "provider",
            Dimension::Location => "location",
            Dimension::Global => "global",
        }
    }

    pub fn all() -> [Dimension; 3] {
        [Dimension::Provider, Dimension::Location, Dimension::Global]
    }

    /// Dimension value a record contributes to
    pub fn value_of<'a>(&self, record: &'a EmissionRecord) -> &'a str {
        match self {
            Dimension::Provider => &record.source_id,
            Dimension::Location => &record.location,
            Dimension::Global => GLOBAL_DIMENSION_VALUE,
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A concrete time window: size plus aligned start (unix seconds)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeWindow {
    pub size: WindowSize,
    pub start: i64,
}

impl TimeWindow {
    /// Window of `size` containing `timestamp`
    pub fn containing(size: WindowSize, timestamp: i64) -> Self {
        Self {
            size,
            start: size.align(timestamp),
        }
    }

    pub fn end(&self) -> i64 {
        self.start.saturating_add(self.size.duration_secs())
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.size.as_str(), self.start)
    }
}

/// Key of one AggregateBucket: (dimension, dimension_value, time_window)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketKey {
    pub dimension: Dimension,
    pub value: String,
    pub window: TimeWindow,
}

impl BucketKey {
    pub fn new(dimension: Dimension, value: impl Into<String>, window: TimeWindow) -> Self {
        Self {
            dimension,
            value: value.into(),
            window,
        }
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={} [{}]", self.dimension, self.value, self.window)
    }
}

/// Incrementally maintained aggregate over one dimension value and time window
///
/// Only running sums are stored. Means are derived on read so that applying
/// a record is a fixed number of additions regardless of history size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateBucket {
    pub key: BucketKey,
    pub count: u64,
    pub sum_emissions: f64,
    pub sum_energy: f64,
    pub sum_renewable_pct: f64,
    pub sum_ai_workload_pct: f64,
    pub sum_pue: f64,
    pub min_emissions: f64,
    pub max_emissions: f64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl AggregateBucket {
    pub fn empty(key: BucketKey, now: i64) -> Self {
        Self {
            key,
            count: 0,
            sum_emissions: 0.0,
            sum_energy: 0.0,
            sum_renewable_pct: 0.0,
            sum_ai_workload_pct: 0.0,
            sum_pue: 0.0,
            min_emissions: f64::INFINITY,
            max_emissions: f64::NEG_INFINITY,
            created_at: now,
            updated_at: now,
        }
    }

    /// Add one record's contribution (O(1))
    pub fn accumulate(&mut self, record: &EmissionRecord, now: i64) {
        self.count += 1;
        self.sum_emissions += record.total_emissions_kg;
        self.sum_energy += record.energy_consumption_mwh;
        self.sum_renewable_pct += record.renewable_usage_pct;
        self.sum_ai_workload_pct += record.ai_workload_pct;
        self.sum_pue += record.pue;
        self.min_emissions = self.min_emissions.min(record.total_emissions_kg);
        self.max_emissions = self.max_emissions.max(record.total_emissions_kg);
        self.updated_at = now;
    }

    fn mean_of(&self, sum: f64) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(sum / self.count as f64)
        }
    }

    pub fn mean_emissions(&self) -> Option<f64> {
        self.mean_of(self.sum_emissions)
    }

    pub fn mean_energy(&self) -> Option<f64> {
        self.mean_of(self.sum_energy)
    }

    pub fn mean_renewable_pct(&self) -> Option<f64> {
        self.mean_of(self.sum_renewable_pct)
    }

    pub fn mean_ai_workload_pct(&self) -> Option<f64> {
        self.mean_of(self.sum_ai_workload_pct)
    }

    pub fn mean_pue(&self) -> Option<f64> {
        self.mean_of(self.sum_pue)
    }

    /// Emission intensity (kg CO2e per MWh); None when no energy was recorded
    pub fn emissions_per_mwh(&self) -> Option<f64> {
        if self.sum_energy > 0.0 {
            Some(self.sum_emissions / self.sum_energy)
        } else {
            None
        }
    }
}

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
        }
    }
}

/// Emitted once when a rule transitions from not-triggered to triggered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub rule_id: String,
    pub level: AlertLevel,
    pub message: String,
    pub details: String,
    pub raised_at: i64,
    /// Bucket whose metric crossed the threshold
    pub bucket: BucketKey,
    pub observed_value: f64,
}
