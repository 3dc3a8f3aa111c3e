//! Monitor loop - bucket updates → alerts, persistence and retention
//!
//! Main loop:
//! 1. Receives bucket-updated events from the engine subscription and
//!    remembers which buckets changed since the last flush
//! 2. Receives relay events (gaps, rejections) for logging
//! 3. Periodically flushes:
//!    - evaluates alert rules against the current aggregates
//!    - upserts changed buckets and appends raised alerts
//!    - retires expired buckets; their final state stays queued until a
//!      write succeeds
//!
//! Flush cycle:
//! - Lock engine ONCE per flush
//! - Snapshot, evaluate and evict while holding the lock
//! - Release lock BEFORE database writes

use super::alerts::{AlertEvaluator, AlertRule};
use super::db::AggregateDbWriter;
use super::engine::{lock_engine, SharedEngine};
use super::relay::RelayEvent;
use super::subscription::Subscription;
use super::types::{AggregateBucket, AlertEvent, BucketKey};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorStats {
    pub updates_seen: u64,
    pub flushes: u64,
    pub buckets_written: u64,
    pub buckets_retired: u64,
    pub alerts_raised: u64,
    pub gaps: u64,
    pub write_failures: u64,
}

/// Outcome of a single flush
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushSummary {
    pub buckets_written: usize,
    pub buckets_retired: usize,
    pub alerts: Vec<AlertEvent>,
}

pub struct Monitor {
    engine: SharedEngine,
    db_writer: Arc<dyn AggregateDbWriter>,
    rules: Vec<AlertRule>,
    evaluator: AlertEvaluator,
    alert_observer: Option<mpsc::Sender<AlertEvent>>,
    flush_interval: Duration,
    dirty: HashSet<BucketKey>,
    /// Retired buckets whose final state has not been written yet
    pending_retired: HashMap<BucketKey, AggregateBucket>,
    /// Subscriber drops seen at the last flush; growth forces a full write
    last_dropped: u64,
    stats: MonitorStats,
}

impl Monitor {
    pub fn new(
        engine: SharedEngine,
        db_writer: Arc<dyn AggregateDbWriter>,
        rules: Vec<AlertRule>,
        flush_interval: Duration,
    ) -> Self {
        Self {
            engine,
            db_writer,
            rules,
            evaluator: AlertEvaluator::new(),
            alert_observer: None,
            flush_interval,
            dirty: HashSet::new(),
            pending_retired: HashMap::new(),
            last_dropped: 0,
            stats: MonitorStats::default(),
        }
    }

    pub fn with_evaluator(mut self, evaluator: AlertEvaluator) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Forward raised alerts to an observer (dropped if it falls behind)
    pub fn with_alert_observer(mut self, sender: mpsc::Sender<AlertEvent>) -> Self {
        self.alert_observer = Some(sender);
        self
    }

    pub fn stats(&self) -> MonitorStats {
        self.stats
    }

    /// Retired buckets still waiting for their final write
    pub fn pending_retired(&self) -> usize {
        self.pending_retired.len()
    }

    /// Mark a bucket as changed since the last flush
    pub fn mark_dirty(&mut self, key: BucketKey) {
        self.stats.updates_seen += 1;
        self.dirty.insert(key);
    }

    /// Evaluate alerts, persist changed buckets and retire expired ones
    ///
    /// `write_all` writes every active bucket instead of just the changed ones.
    pub async fn flush(&mut self, write_all: bool) -> FlushSummary {
        let (to_write, retired, alerts) = {
            let mut engine = lock_engine(&self.engine);
            let now = engine.now();
            let current = engine.all_buckets();

            let alerts = if self.dirty.is_empty() && !write_all {
                Vec::new()
            } else {
                self.evaluator.evaluate(&self.rules, &current)
            };

            let to_write: Vec<AggregateBucket> = if write_all {
                current
            } else {
                current
                    .into_iter()
                    .filter(|b| self.dirty.contains(&b.key))
                    .collect()
            };

            let retired = engine.evict_expired(now);
            (to_write, retired, alerts)
        }; // Lock released here

        let written_keys: Vec<BucketKey> = to_write.iter().map(|b| b.key.clone()).collect();
        let retired_count = retired.len();
        for bucket in retired {
            self.pending_retired.insert(bucket.key.clone(), bucket);
        }
        let mut batch = to_write;
        let live: HashSet<&BucketKey> = written_keys.iter().collect();
        batch.extend(
            self.pending_retired
                .values()
                .filter(|b| !live.contains(&b.key))
                .cloned(),
        );
        let batch_len = batch.len();

        let mut summary = FlushSummary {
            buckets_written: 0,
            buckets_retired: retired_count,
            alerts: Vec::new(),
        };

        if !batch.is_empty() {
            match self.db_writer.write_aggregates(batch).await {
                Ok(()) => {
                    summary.buckets_written = batch_len;
                    for key in &written_keys {
                        self.dirty.remove(key);
                    }
                    self.pending_retired.clear();
                }
                Err(e) => {
                    // Dirty keys and retired buckets are retried next flush
                    self.stats.write_failures += 1;
                    log::error!("❌ Failed to write aggregates: {}", e);
                }
            }
        }
        // Retired buckets are tracked in `pending_retired` from here on
        {
            let engine = lock_engine(&self.engine);
            self.dirty.retain(|key| engine.is_active(key));
        }

        if !alerts.is_empty() {
            if let Err(e) = self.db_writer.write_alerts(alerts.clone()).await {
                self.stats.write_failures += 1;
                log::error!("❌ Failed to write {} alerts: {}", alerts.len(), e);
            }
            if let Some(observer) = &self.alert_observer {
                for alert in &alerts {
                    if observer.try_send(alert.clone()).is_err() {
                        log::debug!("Alert observer full, dropped {}", alert.rule_id);
                    }
                }
            }
        }

        self.stats.flushes += 1;
        self.stats.buckets_written += summary.buckets_written as u64;
        self.stats.buckets_retired += retired_count as u64;
        self.stats.alerts_raised += alerts.len() as u64;
        summary.alerts = alerts;
        summary
    }

    fn handle_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::GapDetected {
                outage,
                disconnected_at,
                resumed_at,
            } => {
                self.stats.gaps += 1;
                log::warn!(
                    "🕳️  Aggregates may be missing records inserted between {} and {} ({:?} outage)",
                    disconnected_at,
                    resumed_at,
                    outage
                );
            }
            RelayEvent::Rejected { key, error } => {
                log::debug!("Relay rejected {}: {}", key, error);
            }
        }
    }

    /// Run until cancelled, then perform a final flush
    pub async fn run(
        mut self,
        mut subscription: Subscription,
        mut relay_events: Option<mpsc::Receiver<RelayEvent>>,
        cancel: CancellationToken,
    ) -> MonitorStats {
        log::info!("🚀 Starting monitor loop");
        log::info!("   ├─ Flush interval: {}ms", self.flush_interval.as_millis());
        log::info!("   └─ Alert rules: {}", self.rules.len());

        let mut flush_timer = interval(self.flush_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("🔄 Performing final flush...");
                    for update in subscription.drain() {
                        self.mark_dirty(update.key);
                    }
                    self.flush(false).await;
                    log::info!("✅ Final flush complete");
                    break;
                }

                update = subscription.next() => {
                    self.mark_dirty(update.key);
                }

                Some(event) = async {
                    match relay_events.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.handle_relay_event(event);
                }

                _ = flush_timer.tick() => {
                    let flush_start = Instant::now();

                    let dropped = subscription.dropped_count();
                    let write_all = dropped > self.last_dropped;
                    if write_all {
                        log::warn!(
                            "⚠️  Monitor fell behind: {} bucket updates dropped, writing all buckets",
                            dropped - self.last_dropped
                        );
                        self.last_dropped = dropped;
                    }

                    let summary = self.flush(write_all).await;
                    if summary.buckets_written > 0 || !summary.alerts.is_empty() {
                        log::info!(
                            "📊 Flush complete: {} buckets, {} retired, {} alerts | queue: {}/{} | {}ms",
                            summary.buckets_written,
                            summary.buckets_retired,
                            summary.alerts.len(),
                            subscription.len(),
                            subscription.capacity(),
                            flush_start.elapsed().as_millis()
                        );
                    }
                }
            }
        }

        log::info!("✅ Monitor loop stopped");
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::alerts::{AlertMetric, Comparator};
    use crate::pipeline::engine::{AggregationEngine, EngineConfig};
    use crate::pipeline::error::StoreError;
    use crate::pipeline::types::{AlertLevel, EmissionRecord, WindowSize};
    use crate::pipeline::windows::RetentionPolicy;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
    use std::sync::Mutex;

    const BASE_TIME: i64 = 1_700_000_000;

    #[derive(Default)]
    struct RecordingWriter {
        aggregates: Mutex<Vec<AggregateBucket>>,
        alerts: Mutex<Vec<AlertEvent>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl AggregateDbWriter for RecordingWriter {
        async fn write_aggregates(&self, buckets: Vec<AggregateBucket>) -> Result<(), StoreError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("disk full".to_string()));
            }
            self.aggregates.lock().unwrap().extend(buckets);
            Ok(())
        }

        async fn write_alerts(&self, alerts: Vec<AlertEvent>) -> Result<(), StoreError> {
            self.alerts.lock().unwrap().extend(alerts);
            Ok(())
        }
    }

    fn make_record(observed_at: i64, emissions: f64) -> EmissionRecord {
        EmissionRecord {
            source_id: "A".to_string(),
            location: "X".to_string(),
            observed_at,
            energy_consumption_mwh: 1.0,
            total_emissions_kg: emissions,
            renewable_usage_pct: 50.0,
            ai_workload_pct: 0.0,
            pue: 1.2,
        }
    }

    fn setup(clock: Arc<AtomicI64>) -> (SharedEngine, Arc<RecordingWriter>, Monitor) {
        let config = EngineConfig {
            windows: vec![WindowSize::Hour1],
            retention: RetentionPolicy::new(60),
            subscriber_buffer: 64,
        };
        let engine = AggregationEngine::new_with_timestamp_fn(
            config,
            Box::new(move || clock.load(Ordering::SeqCst)),
        )
        .into_shared();
        let writer = Arc::new(RecordingWriter::default());
        let rules = vec![AlertRule::new(
            "total-over-1000",
            AlertMetric::TotalEmissionsKg,
            Comparator::Above,
            1000.0,
            AlertLevel::Critical,
        )
        .for_dimension(crate::pipeline::types::Dimension::Provider)];
        let monitor = Monitor::new(engine.clone(), writer.clone(), rules, Duration::from_millis(10))
            .with_evaluator(AlertEvaluator::new_with_timestamp_fn(Box::new(|| BASE_TIME)));
        (engine, writer, monitor)
    }

    fn apply_and_mark(engine: &SharedEngine, monitor: &mut Monitor, record: &EmissionRecord) {
        let keys = lock_engine(engine).apply(record).unwrap();
        for key in keys {
            monitor.mark_dirty(key);
        }
    }

    #[tokio::test]
    async fn test_flush_writes_dirty_buckets_and_alerts_once() {
        let clock = Arc::new(AtomicI64::new(BASE_TIME));
        let (engine, writer, mut monitor) = setup(clock);

        apply_and_mark(&engine, &mut monitor, &make_record(BASE_TIME, 950.0));
        let summary = monitor.flush(false).await;
        assert_eq!(summary.buckets_written, 3);
        assert!(summary.alerts.is_empty());

        apply_and_mark(&engine, &mut monitor, &make_record(BASE_TIME + 1, 100.0));
        let summary = monitor.flush(false).await;
        assert_eq!(summary.alerts.len(), 1);
        assert_eq!(summary.alerts[0].observed_value, 1050.0);

        apply_and_mark(&engine, &mut monitor, &make_record(BASE_TIME + 2, 10.0));
        let summary = monitor.flush(false).await;
        assert!(summary.alerts.is_empty());

        // Nothing changed: nothing written
        let summary = monitor.flush(false).await;
        assert_eq!(summary.buckets_written, 0);

        assert_eq!(writer.alerts.lock().unwrap().len(), 1);
        assert_eq!(writer.aggregates.lock().unwrap().len(), 9);
    }

    #[tokio::test]
    async fn test_retired_buckets_are_written_before_eviction() {
        let clock = Arc::new(AtomicI64::new(BASE_TIME));
        let (engine, writer, mut monitor) = setup(clock.clone());

        lock_engine(&engine).apply(&make_record(BASE_TIME, 5.0)).unwrap();
        // Not marked dirty: retirement alone must still persist the final state
        let window_end = lock_engine(&engine).all_buckets()[0].key.window.end();
        clock.store(window_end + 60, Ordering::SeqCst);

        let summary = monitor.flush(false).await;
        assert_eq!(summary.buckets_retired, 3);
        assert_eq!(summary.buckets_written, 3);
        assert_eq!(lock_engine(&engine).active_bucket_count(), 0);
        assert_eq!(writer.aggregates.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_write_keeps_buckets_dirty() {
        let clock = Arc::new(AtomicI64::new(BASE_TIME));
        let (engine, writer, mut monitor) = setup(clock);

        writer.fail.store(true, Ordering::SeqCst);
        apply_and_mark(&engine, &mut monitor, &make_record(BASE_TIME, 5.0));
        let summary = monitor.flush(false).await;
        assert_eq!(summary.buckets_written, 0);
        assert_eq!(monitor.stats().write_failures, 1);

        writer.fail.store(false, Ordering::SeqCst);
        let summary = monitor.flush(false).await;
        assert_eq!(summary.buckets_written, 3);
    }

    #[tokio::test]
    async fn test_retired_buckets_survive_failed_write() {
        let clock = Arc::new(AtomicI64::new(BASE_TIME));
        let (engine, writer, mut monitor) = setup(clock.clone());

        apply_and_mark(&engine, &mut monitor, &make_record(BASE_TIME, 7.0));
        let window_end = lock_engine(&engine).all_buckets()[0].key.window.end();
        clock.store(window_end + 60, Ordering::SeqCst);

        writer.fail.store(true, Ordering::SeqCst);
        let summary = monitor.flush(false).await;
        assert_eq!(summary.buckets_retired, 3);
        assert_eq!(summary.buckets_written, 0);
        assert_eq!(lock_engine(&engine).active_bucket_count(), 0);
        assert_eq!(monitor.pending_retired(), 3);

        writer.fail.store(false, Ordering::SeqCst);
        let summary = monitor.flush(false).await;
        assert_eq!(summary.buckets_retired, 0);
        assert_eq!(summary.buckets_written, 3);
        assert_eq!(monitor.pending_retired(), 0);

        let written = writer.aggregates.lock().unwrap();
        assert_eq!(written.len(), 3);
        assert!(written.iter().all(|b| b.count == 1 && b.sum_emissions == 7.0));
        drop(written);

        // Written once; later flushes have nothing left to persist
        assert_eq!(monitor.flush(false).await.buckets_written, 0);
    }

    #[tokio::test]
    async fn test_run_flushes_on_cancel() {
        let clock = Arc::new(AtomicI64::new(BASE_TIME));
        let (engine, writer, monitor) = setup(clock);
        let subscription = lock_engine(&engine).subscribe();
        let (relay_tx, relay_rx) = mpsc::channel(4);
        let (alert_tx, mut alert_rx) = mpsc::channel(4);
        let monitor = monitor.with_alert_observer(alert_tx);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(monitor.run(subscription, Some(relay_rx), cancel.clone()));

        lock_engine(&engine).apply(&make_record(BASE_TIME, 2000.0)).unwrap();
        relay_tx
            .send(RelayEvent::GapDetected {
                outage: Duration::from_secs(3),
                disconnected_at: BASE_TIME,
                resumed_at: BASE_TIME + 3,
            })
            .await
            .unwrap();

        let alert = tokio::time::timeout(Duration::from_secs(2), alert_rx.recv())
            .await
            .expect("alert observed")
            .expect("channel open");
        assert_eq!(alert.rule_id, "total-over-1000");

        cancel.cancel();
        let stats = handle.await.unwrap();
        assert_eq!(stats.alerts_raised, 1);
        assert_eq!(stats.updates_seen, 3);
        assert!(stats.flushes >= 2);
        assert!(writer.aggregates.lock().unwrap().len() >= 3);
    }
}
