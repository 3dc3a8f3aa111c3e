//! Change Relay - store insert notifications → AggregationEngine::apply
//!
//! ## Delivery
//!
//! The store's change feed is at-least-once. The relay drops notifications
//! whose record key it has seen recently (bounded FIFO table) and relies on
//! the engine's per-bucket applied-key tracking for everything older.
//!
//! ## Startup
//!
//! `attach` subscribes before anything else writes, then `backfill` replays
//! every stored record that can still reach a live bucket. Records inserted
//! between the two arrive twice and are de-duplicated like any redelivery.
//!
//! ## Disconnects
//!
//! On disconnect the relay resubscribes with exponential backoff and resumes
//! from "now". Records inserted during the outage are not replayed; a
//! `RelayEvent::GapDetected` carrying the outage duration is emitted instead.

use super::backoff::ExponentialBackoff;
use super::dedup::DedupTable;
use super::engine::{lock_engine, SharedEngine};
use super::error::{EngineError, RelayError, StoreError};
use super::store::{ChangeFeed, EmissionStore, RecordFilter};
use super::types::{EmissionRecord, RecordKey};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Per-receive timeout; expiring is an idle tick, not a disconnect
    pub recv_timeout: Duration,
    pub dedup_capacity: usize,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            recv_timeout: Duration::from_secs(30),
            dedup_capacity: 10_000,
            backoff_initial_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

/// Out-of-band notifications for observers
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// Feed was down; inserts between the two timestamps were not relayed
    GapDetected {
        outage: Duration,
        disconnected_at: i64,
        resumed_at: i64,
    },
    /// Engine refused a relayed record
    Rejected { key: RecordKey, error: EngineError },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub received: u64,
    pub duplicates: u64,
    pub applied: u64,
    pub rejected: u64,
    pub gaps: u64,
}

pub struct ChangeRelay {
    store: Arc<dyn EmissionStore>,
    engine: SharedEngine,
    dedup: DedupTable,
    config: RelayConfig,
    events: Option<mpsc::Sender<RelayEvent>>,
    feed: Option<Box<dyn ChangeFeed>>,
    stats: RelayStats,
}

impl ChangeRelay {
    pub fn new(store: Arc<dyn EmissionStore>, engine: SharedEngine, config: RelayConfig) -> Self {
        Self {
            store,
            engine,
            dedup: DedupTable::new(config.dedup_capacity),
            config,
            events: None,
            feed: None,
            stats: RelayStats::default(),
        }
    }

    /// Publish gap/rejection events to `sender`
    ///
    /// Events are sent with `try_send`; a full channel drops the event rather
    /// than stall the relay.
    pub fn with_events(mut self, sender: mpsc::Sender<RelayEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    /// Subscribe now instead of inside `run`
    ///
    /// Every insert after this call is relayed once `run` starts.
    pub async fn attach(&mut self, cancel: &CancellationToken) -> Result<(), RelayError> {
        if self.feed.is_none() {
            self.feed = Some(self.connect(cancel).await?);
            log::info!("✅ Change relay subscribed");
        }
        Ok(())
    }

    /// Apply stored records that still fall into live windows
    ///
    /// Returns the number of records that updated the engine.
    pub async fn backfill(&mut self) -> Result<u64, StoreError> {
        let since = lock_engine(&self.engine).oldest_live_timestamp();
        let records = self
            .store
            .select(&RecordFilter::default().observed_since(since))
            .await?;

        let total = records.len();
        let mut applied = 0;
        for record in &records {
            if self.handle_record(record) {
                applied += 1;
            }
        }
        log::info!("📥 Backfilled {} of {} stored records since {}", applied, total, since);
        Ok(applied)
    }

    /// Receive one record, honoring the per-call timeout and cancellation
    ///
    /// # Errors
    /// * `Timeout` - nothing arrived within `recv_timeout`
    /// * `Connection` - the feed is gone
    /// * `Cancelled` - `cancel` fired
    pub async fn receive(
        feed: &mut dyn ChangeFeed,
        recv_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<EmissionRecord, RelayError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(RelayError::Cancelled),
            result = tokio::time::timeout(recv_timeout, feed.recv()) => match result {
                Err(_) => Err(RelayError::Timeout(recv_timeout)),
                Ok(Err(e)) => Err(e.into()),
                Ok(Ok(record)) => Ok(record),
            },
        }
    }

    /// De-duplicate and apply one notification
    ///
    /// Returns true when the engine updated at least one bucket.
    pub fn handle_record(&mut self, record: &EmissionRecord) -> bool {
        self.stats.received += 1;
        let key = record.key();

        if !self.dedup.insert(key.clone()) {
            self.stats.duplicates += 1;
            log::debug!("Duplicate notification {} dropped", key);
            return false;
        }

        let result = lock_engine(&self.engine).apply(record);
        match result {
            Ok(updated) if updated.is_empty() => {
                self.stats.duplicates += 1;
                false
            }
            Ok(_) => {
                self.stats.applied += 1;
                true
            }
            Err(error) => {
                self.stats.rejected += 1;
                self.emit(RelayEvent::Rejected { key, error });
                false
            }
        }
    }

    async fn connect(&self, cancel: &CancellationToken) -> Result<Box<dyn ChangeFeed>, RelayError> {
        let mut backoff =
            ExponentialBackoff::unbounded(self.config.backoff_initial_ms, self.config.backoff_max_ms);
        loop {
            if cancel.is_cancelled() {
                return Err(RelayError::Cancelled);
            }
            match self.store.subscribe().await {
                Ok(feed) => return Ok(feed),
                Err(e) => {
                    log::warn!("⚠️  Change feed subscribe failed: {}", e);
                    backoff
                        .sleep_or_cancel(cancel)
                        .await
                        .map_err(|_| RelayError::Cancelled)?;
                }
            }
        }
    }

    fn emit(&self, event: RelayEvent) {
        if let Some(sender) = &self.events {
            if let Err(e) = sender.try_send(event) {
                log::debug!("Relay event dropped: {}", e);
            }
        }
    }

    /// Relay until cancelled
    pub async fn run(mut self, cancel: CancellationToken) -> RelayStats {
        log::info!("🔌 Change relay starting");

        if self.attach(&cancel).await.is_err() {
            return self.stats;
        }
        let mut feed = match self.feed.take() {
            Some(feed) => feed,
            None => return self.stats,
        };

        loop {
            match Self::receive(feed.as_mut(), self.config.recv_timeout, &cancel).await {
                Ok(record) => {
                    self.handle_record(&record);
                }
                Err(RelayError::Timeout(d)) => {
                    log::debug!("No change notifications in {:?}", d);
                }
                Err(RelayError::Cancelled) => break,
                Err(RelayError::Connection(reason)) => {
                    let disconnected_at = chrono::Utc::now().timestamp();
                    let started = Instant::now();
                    log::warn!("⚠️  Change feed disconnected: {}", reason);

                    feed = match self.connect(&cancel).await {
                        Ok(feed) => feed,
                        Err(_) => break,
                    };

                    let outage = started.elapsed();
                    let resumed_at = chrono::Utc::now().timestamp();
                    self.stats.gaps += 1;
                    log::warn!(
                        "🕳️  Change feed resumed after {:?}; inserts during the outage were not relayed",
                        outage
                    );
                    self.emit(RelayEvent::GapDetected {
                        outage,
                        disconnected_at,
                        resumed_at,
                    });
                }
            }
        }

        log::info!(
            "🛑 Change relay stopped (received={}, applied={}, duplicates={}, rejected={}, gaps={})",
            self.stats.received,
            self.stats.applied,
            self.stats.duplicates,
            self.stats.rejected,
            self.stats.gaps
        );
        self.stats
    }
}
