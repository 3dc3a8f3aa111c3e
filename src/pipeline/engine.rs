//! Aggregation Engine - incrementally maintained rolling aggregates
//!
//! ## Architecture
//!
//! ```text
//! EmissionRecord
//!     ↓
//! AggregationEngine::apply()
//!     ↓  (per window size × {provider, location, global})
//! BucketState (running sums + applied record keys)
//!     ↓
//! SubscriberRegistry::publish() → Subscription (bounded, drop-oldest)
//! ```
//!
//! The engine is a pure in-memory state machine; nothing here performs I/O.
//! It is shared as [`SharedEngine`] (one mutex), which linearizes every
//! `apply` and gives `snapshot` readers either the pre- or post-update state
//! of a bucket, never a half-applied one.

use super::error::EngineError;
use super::normalizer::validate_record;
use super::state::BucketState;
use super::subscription::{BucketUpdate, SubscriberRegistry, Subscription};
use super::types::{AggregateBucket, BucketKey, Dimension, EmissionRecord, TimeWindow, WindowSize};
use super::windows::RetentionPolicy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Engine shared between the relay, the monitor loop and readers
pub type SharedEngine = Arc<Mutex<AggregationEngine>>;

/// Lock the shared engine, recovering the guard if a previous holder panicked
pub fn lock_engine(engine: &SharedEngine) -> MutexGuard<'_, AggregationEngine> {
    engine.lock().unwrap_or_else(|poisoned| {
        log::warn!("⚠️  Aggregation engine lock was poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Engine tuning
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Window sizes maintained for every dimension
    pub windows: Vec<WindowSize>,
    /// Grace period after a window ends before its buckets retire
    pub retention: RetentionPolicy,
    /// Per-subscriber queue capacity
    pub subscriber_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            windows: vec![WindowSize::Hour1, WindowSize::Day1],
            retention: RetentionPolicy::new(86_400),
            subscriber_buffer: 1024,
        }
    }
}

/// Counters exposed for monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Records that updated at least one bucket
    pub applied: u64,
    /// Records whose key was already applied everywhere
    pub duplicates: u64,
    /// Records rejected as invariant violations
    pub rejected: u64,
    /// Records whose windows had all retired
    pub late: u64,
    /// Buckets retired by `evict_expired`
    pub evicted: u64,
}

pub struct AggregationEngine {
    buckets: HashMap<BucketKey, BucketState>,
    windows: Vec<WindowSize>,
    retention: RetentionPolicy,
    subscribers: SubscriberRegistry,
    stats: EngineStats,

    /// Timestamp function (for testing with mock time)
    now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl AggregationEngine {
    /// Create an engine using system time
    pub fn new(config: EngineConfig) -> Self {
        Self::new_with_timestamp_fn(config, Box::new(|| chrono::Utc::now().timestamp()))
    }

    /// Create an engine with a custom clock
    ///
    /// Used for testing with deterministic timestamps.
    pub fn new_with_timestamp_fn(
        config: EngineConfig,
        now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
    ) -> Self {
        let mut windows = config.windows;
        windows.sort();
        windows.dedup();
        if windows.is_empty() {
            log::warn!("⚠️  No aggregate windows configured, defaulting to 1h");
            windows.push(WindowSize::Hour1);
        }

        Self {
            buckets: HashMap::new(),
            windows,
            retention: config.retention,
            subscribers: SubscriberRegistry::new(config.subscriber_buffer),
            stats: EngineStats::default(),
            now_fn,
        }
    }

    /// Wrap into the shared handle used across tasks
    pub fn into_shared(self) -> SharedEngine {
        Arc::new(Mutex::new(self))
    }

    /// Fold one record into every bucket it contributes to
    ///
    /// Returns the keys of buckets that changed. Re-applying a record key that
    /// was already applied changes nothing and returns an empty set, which
    /// makes at-least-once redelivery safe.
    ///
    /// # Errors
    /// * `InvariantViolation` - record fails range validation (not applied)
    /// * `LateRecord` - every window the record falls into has retired
    pub fn apply(&mut self, record: &EmissionRecord) -> Result<Vec<BucketKey>, EngineError> {
        let record_key = record.key();

        if let Err(e) = validate_record(record) {
            self.stats.rejected += 1;
            log::warn!("⚠️  Rejected record {}: {}", record_key, e);
            return Err(EngineError::InvariantViolation {
                key: record_key,
                reason: e.to_string(),
            });
        }

        let now = (self.now_fn)();
        let mut updated = Vec::new();
        let mut live_windows = 0;

        for size in &self.windows {
            let window = TimeWindow::containing(*size, record.observed_at);
            if self.retention.is_retired(window.end(), now) {
                continue;
            }
            live_windows += 1;

            for dimension in Dimension::all() {
                let key = BucketKey::new(dimension, dimension.value_of(record), window);

                let state = self
                    .buckets
                    .entry(key.clone())
                    .or_insert_with(|| BucketState::new(key.clone(), now));

                if state.apply(record, &record_key, now) {
                    self.subscribers.publish(&BucketUpdate {
                        key: key.clone(),
                        bucket: state.bucket().clone(),
                        record: record_key.clone(),
                    });
                    updated.push(key);
                }
            }
        }

        if live_windows == 0 {
            self.stats.late += 1;
            log::debug!("Late record {} ignored (all windows retired)", record_key);
            return Err(EngineError::LateRecord { key: record_key });
        }

        if updated.is_empty() {
            self.stats.duplicates += 1;
            log::debug!("Duplicate record {} ignored", record_key);
        } else {
            self.stats.applied += 1;
        }

        Ok(updated)
    }

    /// Current state of one bucket
    pub fn snapshot(
        &self,
        dimension: Dimension,
        value: &str,
        window: TimeWindow,
    ) -> Result<AggregateBucket, EngineError> {
        self.snapshot_key(&BucketKey::new(dimension, value, window))
    }

    pub fn snapshot_key(&self, key: &BucketKey) -> Result<AggregateBucket, EngineError> {
        self.buckets
            .get(key)
            .map(|state| state.bucket().clone())
            .ok_or_else(|| EngineError::NotFound(key.clone()))
    }

    pub fn is_active(&self, key: &BucketKey) -> bool {
        self.buckets.contains_key(key)
    }

    /// Every active bucket for one dimension value, oldest window first
    pub fn buckets_for(&self, dimension: Dimension, value: &str) -> Vec<AggregateBucket> {
        let mut buckets: Vec<AggregateBucket> = self
            .buckets
            .iter()
            .filter(|(key, _)| key.dimension == dimension && key.value == value)
            .map(|(_, state)| state.bucket().clone())
            .collect();
        buckets.sort_by(|a, b| a.key.window.cmp(&b.key.window));
        buckets
    }

    /// Every active bucket
    pub fn all_buckets(&self) -> Vec<AggregateBucket> {
        let mut buckets: Vec<AggregateBucket> =
            self.buckets.values().map(|s| s.bucket().clone()).collect();
        buckets.sort_by(|a, b| a.key.cmp(&b.key));
        buckets
    }

    /// Subscribe to bucket-updated events
    ///
    /// Each subscriber gets its own bounded queue; when it falls behind the
    /// oldest pending events are dropped and counted.
    pub fn subscribe(&mut self) -> Subscription {
        self.subscribers.subscribe()
    }

    /// Retire buckets whose window ended more than the retention grace ago
    ///
    /// Returns the retired buckets so the caller can flush them before they
    /// are gone.
    pub fn evict_expired(&mut self, now: i64) -> Vec<AggregateBucket> {
        let retention = self.retention;
        let expired: Vec<BucketKey> = self
            .buckets
            .keys()
            .filter(|key| retention.is_retired(key.window.end(), now))
            .cloned()
            .collect();

        let mut retired = Vec::with_capacity(expired.len());
        for key in expired {
            if let Some(state) = self.buckets.remove(&key) {
                retired.push(state.into_bucket());
            }
        }

        if !retired.is_empty() {
            self.stats.evicted += retired.len() as u64;
            log::debug!("Retired {} buckets", retired.len());
        }
        retired
    }

    /// Earliest `observed_at` that can still land in a live bucket
    ///
    /// Replaying the store from here rebuilds every bucket `apply` would
    /// still accept.
    pub fn oldest_live_timestamp(&self) -> i64 {
        let widest = self
            .windows
            .iter()
            .map(|size| size.duration_secs())
            .max()
            .unwrap_or(0);
        (self.now_fn)()
            .saturating_sub(self.retention.grace_secs)
            .saturating_sub(widest)
    }

    pub fn now(&self) -> i64 {
        (self.now_fn)()
    }

    pub fn windows(&self) -> &[WindowSize] {
        &self.windows
    }

    pub fn active_bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.subscriber_count()
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }
}

impl Default for AggregationEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}
