//! # Emissions Aggregation Pipeline
//!
//! Continuously ingests data-center carbon metrics from heterogeneous
//! sources, normalizes them into one record shape, persists them, and keeps
//! rolling aggregates per provider, location and globally. Alert rules run
//! against those aggregates.
//!
//! ## Architecture
//!
//! ```text
//! EmissionSource (GCP / AWS / Azure / CSV/JSONL dataset / synthetic)
//!     ↓  fetch (timeout + bounded retry)
//! IngestionCollector → normalize → EmissionStore::insert
//!     ↓  change feed (at-least-once)
//! ChangeRelay (de-dup, reconnect with backoff)
//!     ↓
//! AggregationEngine::apply → BucketUpdate subscribers
//!     ↓
//! Monitor (alerts, aggregate persistence, retention)
//! ```
//!
//! **Key Principle:** a record is applied to each bucket at most once, no
//! matter how many times the store redelivers it.
//!
//! ## Module Organization
//!
//! - `types` - Core data structures (EmissionRecord, AggregateBucket, AlertEvent)
//! - `windows` - Window sizes, alignment and retention
//! - `normalizer` - Raw payload → EmissionRecord
//! - `state` - Per-bucket running state with applied record keys
//! - `engine` - Incremental aggregation engine
//! - `subscription` - Bounded bucket-update queues
//! - `store` / `db` - Record store trait, in-memory and SQLite backends
//! - `sources` / `collector` - Source adapters and concurrent collection
//! - `relay` - Change feed → engine bridge
//! - `alerts` - Threshold rules over aggregates
//! - `ingestion` - Monitor loop (flush, alerts, retention)
//! - `config` - Environment configuration and credentials

pub mod alerts;
pub mod backoff;
pub mod collector;
pub mod config;
pub mod db;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod ingestion;
pub mod normalizer;
pub mod relay;
pub mod sources;
pub mod state;
pub mod store;
pub mod subscription;
pub mod types;
pub mod windows;

pub use engine::{AggregationEngine, EngineConfig, SharedEngine};
pub use error::{
    CollectionError, ConfigurationError, EngineError, FetchError, NormalizationError, RelayError,
    StoreError,
};
pub use normalizer::{normalize, SourceKind};
pub use types::{AggregateBucket, AlertEvent, AlertLevel, BucketKey, Dimension, EmissionRecord, RecordKey, TimeWindow};
pub use windows::WindowSize;
