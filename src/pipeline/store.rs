//! Persisted emission record store contract
//!
//! The store owns raw records. The pipeline only needs batch insert,
//! filtered select and an insert-notification feed with at-least-once
//! delivery. `InMemoryStore` backs tests and single-process runs; the
//! SQLite implementation lives in `db.rs`.

use super::error::StoreError;
use super::normalizer::validate_record;
use super::types::{EmissionRecord, RecordKey};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;

/// Conjunctive record filter; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    pub source_id: Option<String>,
    pub location: Option<String>,
    /// Inclusive lower bound on `observed_at`
    pub since: Option<i64>,
    /// Exclusive upper bound on `observed_at`
    pub until: Option<i64>,
    pub limit: Option<usize>,
}

impl RecordFilter {
    pub fn source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn observed_since(mut self, since: i64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn between(mut self, since: i64, until: i64) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &EmissionRecord) -> bool {
        self.source_id.as_deref().map_or(true, |s| s == record.source_id)
            && self.location.as_deref().map_or(true, |l| l == record.location)
            && self.since.map_or(true, |t| record.observed_at >= t)
            && self.until.map_or(true, |t| record.observed_at < t)
    }
}

/// Lazy sequence of newly inserted records
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Wait for the next inserted record
    ///
    /// `StoreError::Disconnected` means the feed is gone and the caller must
    /// subscribe again; records inserted meanwhile are not replayed.
    async fn recv(&mut self) -> Result<EmissionRecord, StoreError>;
}

#[async_trait]
pub trait EmissionStore: Send + Sync {
    /// Batch insert
    ///
    /// Records already present (same composite key) are accepted without
    /// change. Records the store refuses are reported in
    /// `StoreError::PartialFailure`; the rest of the batch is still written.
    async fn insert(&self, records: &[EmissionRecord]) -> Result<(), StoreError>;

    /// Records matching `filter`, ordered by `observed_at`
    async fn select(&self, filter: &RecordFilter) -> Result<Vec<EmissionRecord>, StoreError>;

    /// Register a listener for records inserted from now on
    async fn subscribe(&self) -> Result<Box<dyn ChangeFeed>, StoreError>;
}

/// In-process store with a broadcast change feed
pub struct InMemoryStore {
    records: Mutex<BTreeMap<RecordKey, EmissionRecord>>,
    sender: Mutex<broadcast::Sender<EmissionRecord>>,
    feed_capacity: usize,
    available: AtomicBool,
}

impl InMemoryStore {
    pub fn new(feed_capacity: usize) -> Self {
        let feed_capacity = feed_capacity.max(1);
        let (sender, _) = broadcast::channel(feed_capacity);
        Self {
            records: Mutex::new(BTreeMap::new()),
            sender: Mutex::new(sender),
            feed_capacity,
            available: AtomicBool::new(true),
        }
    }

    /// Deliver an insert notification again without touching stored rows
    pub fn redeliver(&self, record: &EmissionRecord) {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = sender.send(record.clone());
    }

    /// Close every open change feed
    pub fn disconnect_feeds(&self) {
        let (fresh, _) = broadcast::channel(self.feed_capacity);
        *self.sender.lock().unwrap_or_else(PoisonError::into_inner) = fresh;
    }

    /// While unavailable, `subscribe` fails with `Disconnected`
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EmissionStore for InMemoryStore {
    async fn insert(&self, records: &[EmissionRecord]) -> Result<(), StoreError> {
        let mut rejected = Vec::new();
        let mut inserted = Vec::new();
        {
            let mut rows = self.records.lock().unwrap_or_else(PoisonError::into_inner);
            for record in records {
                if validate_record(record).is_err() {
                    rejected.push(record.key());
                    continue;
                }
                let key = record.key();
                if !rows.contains_key(&key) {
                    rows.insert(key, record.clone());
                    inserted.push(record.clone());
                }
            }
        }

        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        for record in inserted {
            // No receivers is fine
            let _ = sender.send(record);
        }

        if rejected.is_empty() {
            Ok(())
        } else {
            Err(StoreError::PartialFailure { rejected })
        }
    }

    async fn select(&self, filter: &RecordFilter) -> Result<Vec<EmissionRecord>, StoreError> {
        let rows = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let mut matched: Vec<EmissionRecord> = rows.values().filter(|r| filter.matches(r)).cloned().collect();
        matched.sort_by(|a, b| a.observed_at.cmp(&b.observed_at).then_with(|| a.key().cmp(&b.key())));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn subscribe(&self) -> Result<Box<dyn ChangeFeed>, StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Disconnected("store unavailable".to_string()));
        }
        let receiver = self.sender.lock().unwrap_or_else(PoisonError::into_inner).subscribe();
        Ok(Box::new(BroadcastFeed { receiver }))
    }
}

struct BroadcastFeed {
    receiver: broadcast::Receiver<EmissionRecord>,
}

#[async_trait]
impl ChangeFeed for BroadcastFeed {
    async fn recv(&mut self) -> Result<EmissionRecord, StoreError> {
        match self.receiver.recv().await {
            Ok(record) => Ok(record),
            Err(broadcast::error::RecvError::Closed) => {
                Err(StoreError::Disconnected("change feed closed".to_string()))
            }
            // Missed notifications are a gap just like a disconnect
            Err(broadcast::error::RecvError::Lagged(n)) => {
                Err(StoreError::Disconnected(format!("listener lagged by {n} notifications")))
            }
        }
    }
}
