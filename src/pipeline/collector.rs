//! Ingestion Collector - concurrent, per-source isolated collection
//!
//! ## Flow
//!
//! ```text
//! EmissionSource::fetch (timeout + bounded retry on transient errors)
//!     ↓
//! normalize() per payload
//!     ↓
//! SourceBatch | CollectionError   (one source failing never aborts another)
//!     ↓
//! CollectionReport { status: Ok | Partial | AllFailed | NoData }
//!     ↓
//! EmissionStore::insert
//! ```

use super::backoff::ExponentialBackoff;
use super::error::{CollectionError, FetchError, StoreError};
use super::normalizer::{normalize, NormalizeContext};
use super::sources::EmissionSource;
use super::store::EmissionStore;
use super::types::{EmissionRecord, RecordKey};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub fetch_timeout: Duration,
    /// Retries after the first attempt, transient failures only
    pub max_retries: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(10),
            max_retries: 3,
            backoff_initial_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

/// Records successfully fetched from one source
#[derive(Debug, Clone, PartialEq)]
pub struct SourceBatch {
    pub source_id: String,
    pub records: Vec<EmissionRecord>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionStatus {
    /// Every source fetched and at least one record was produced
    Ok,
    /// Some sources failed to fetch
    Partial,
    /// Every source failed to fetch
    AllFailed,
    /// Every source fetched but nothing new was produced
    NoData,
}

#[derive(Debug)]
pub struct CollectionReport {
    pub batches: Vec<SourceBatch>,
    pub errors: Vec<CollectionError>,
    pub status: CollectionStatus,
    pub elapsed: Duration,
    /// Records the store refused in `collect_into`; the caller may retry them
    pub rejected: Vec<RecordKey>,
}

impl CollectionReport {
    pub fn record_count(&self) -> usize {
        self.batches.iter().map(|b| b.records.len()).sum()
    }

    pub fn records(&self) -> impl Iterator<Item = &EmissionRecord> {
        self.batches.iter().flat_map(|b| b.records.iter())
    }

    pub fn failed_sources(&self) -> Vec<&str> {
        self.errors
            .iter()
            .filter(|e| e.is_fetch_failure())
            .map(|e| e.source_id())
            .collect()
    }

    /// Collected records the store refused, ready to be re-inserted
    pub fn rejected_records(&self) -> Vec<&EmissionRecord> {
        let rejected: HashSet<&RecordKey> = self.rejected.iter().collect();
        self.records()
            .filter(|record| rejected.contains(&record.key()))
            .collect()
    }
}

fn classify(sources: usize, fetch_failures: usize, records: usize) -> CollectionStatus {
    if sources > 0 && fetch_failures == sources {
        CollectionStatus::AllFailed
    } else if fetch_failures > 0 {
        CollectionStatus::Partial
    } else if records == 0 {
        CollectionStatus::NoData
    } else {
        CollectionStatus::Ok
    }
}

pub struct IngestionCollector {
    sources: Vec<Arc<dyn EmissionSource>>,
    config: CollectorConfig,
}

impl IngestionCollector {
    pub fn new(config: CollectorConfig) -> Self {
        Self {
            sources: Vec::new(),
            config,
        }
    }

    pub fn add_source(&mut self, source: Arc<dyn EmissionSource>) {
        log::info!("📡 Registered source {} ({})", source.id(), source.kind());
        self.sources.push(source);
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Collect from one source
    ///
    /// Each call re-fetches. The result holds one entry per payload, or a
    /// single `CollectionError::Fetch` when the source could not be fetched.
    pub async fn collect(
        &self,
        source: &dyn EmissionSource,
        cancel: &CancellationToken,
    ) -> Vec<Result<EmissionRecord, CollectionError>> {
        collect_source(source, &self.config, cancel).await.1
    }

    /// Collect from every source concurrently
    pub async fn collect_all(&self, cancel: &CancellationToken) -> CollectionReport {
        let started = Instant::now();
        let mut handles = Vec::with_capacity(self.sources.len());

        for source in &self.sources {
            let source = source.clone();
            let config = self.config.clone();
            let cancel = cancel.clone();
            let source_id = source.id().to_string();
            let handle = tokio::spawn(async move {
                collect_source(source.as_ref(), &config, &cancel).await
            });
            handles.push((source_id, handle));
        }

        let mut batches = Vec::new();
        let mut errors = Vec::new();
        let mut fetch_failures = 0;

        for (source_id, handle) in handles {
            match handle.await {
                Ok((attempts, results)) => {
                    let mut records = Vec::new();
                    let mut fetched = true;
                    for result in results {
                        match result {
                            Ok(record) => records.push(record),
                            Err(e) => {
                                if e.is_fetch_failure() {
                                    fetched = false;
                                }
                                errors.push(e);
                            }
                        }
                    }
                    if fetched {
                        batches.push(SourceBatch {
                            source_id,
                            records,
                            attempts,
                        });
                    } else {
                        fetch_failures += 1;
                    }
                }
                Err(e) => {
                    log::error!("❌ Collection task for {} failed: {}", source_id, e);
                    fetch_failures += 1;
                    errors.push(CollectionError::Fetch {
                        source_id,
                        attempts: 0,
                        error: FetchError::Connection(format!("collection task failed: {e}")),
                    });
                }
            }
        }

        let record_count = batches.iter().map(|b| b.records.len()).sum();
        let status = classify(self.sources.len(), fetch_failures, record_count);

        match status {
            CollectionStatus::AllFailed => log::error!(
                "❌ All {} sources failed to fetch",
                self.sources.len()
            ),
            CollectionStatus::Partial => log::warn!(
                "⚠️  Collected {} records; {} of {} sources failed",
                record_count,
                fetch_failures,
                self.sources.len()
            ),
            CollectionStatus::NoData => log::debug!("No new records from {} sources", self.sources.len()),
            CollectionStatus::Ok => log::info!(
                "📥 Collected {} records from {} sources",
                record_count,
                self.sources.len()
            ),
        }

        CollectionReport {
            batches,
            errors,
            status,
            elapsed: started.elapsed(),
            rejected: Vec::new(),
        }
    }

    /// Collect from every source and insert the results into `store`
    ///
    /// A partial store failure is not an error: the refused keys are carried
    /// in `CollectionReport::rejected`.
    pub async fn collect_into(
        &self,
        store: &dyn EmissionStore,
        cancel: &CancellationToken,
    ) -> Result<CollectionReport, StoreError> {
        let mut report = self.collect_all(cancel).await;
        let records: Vec<EmissionRecord> = report.records().cloned().collect();
        if records.is_empty() {
            return Ok(report);
        }

        match store.insert(&records).await {
            Ok(()) => Ok(report),
            Err(StoreError::PartialFailure { rejected }) => {
                log::warn!("⚠️  Store rejected {} of {} records", rejected.len(), records.len());
                report.rejected = rejected;
                Ok(report)
            }
            Err(e) => Err(e),
        }
    }

    /// Poll every `interval` until cancelled
    pub async fn run(self, store: Arc<dyn EmissionStore>, interval: Duration, cancel: CancellationToken) {
        log::info!(
            "🚀 Collector started ({} sources, every {}ms)",
            self.sources.len(),
            interval.as_millis()
        );
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.collect_into(store.as_ref(), &cancel).await {
                        log::error!("❌ Failed to store collected records: {}", e);
                    }
                }
            }
        }

        log::info!("🛑 Collector stopped");
    }
}

/// Fetch with timeout and bounded retry, then normalize
///
/// Returns the number of fetch attempts alongside the per-payload results.
async fn collect_source(
    source: &dyn EmissionSource,
    config: &CollectorConfig,
    cancel: &CancellationToken,
) -> (u32, Vec<Result<EmissionRecord, CollectionError>>) {
    let source_id = source.id().to_string();

    let (payloads, attempts) = match fetch_with_retry(source, config, cancel).await {
        Ok(fetched) => fetched,
        Err((attempts, error)) => {
            log::warn!(
                "⚠️  Source {} failed after {} attempt(s): {}",
                source_id,
                attempts,
                error
            );
            return (
                attempts,
                vec![Err(CollectionError::Fetch {
                    source_id,
                    attempts,
                    error,
                })],
            );
        }
    };

    let ctx = NormalizeContext {
        source_id: source_id.clone(),
        default_location: source.default_location().map(str::to_string),
        received_at: chrono::Utc::now().timestamp(),
    };

    let results = payloads
        .iter()
        .map(|payload| {
            normalize(payload, source.kind(), &ctx).map_err(|error| {
                log::warn!("⚠️  Dropping payload from {}: {}", source_id, error);
                CollectionError::Normalization {
                    source_id: source_id.clone(),
                    error,
                }
            })
        })
        .collect();

    (attempts, results)
}

async fn fetch_with_retry(
    source: &dyn EmissionSource,
    config: &CollectorConfig,
    cancel: &CancellationToken,
) -> Result<(Vec<serde_json::Value>, u32), (u32, FetchError)> {
    let mut backoff = ExponentialBackoff::new(
        config.backoff_initial_ms,
        config.backoff_max_ms,
        config.max_retries,
    );
    let mut attempts = 0;

    loop {
        attempts += 1;
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            fetched = tokio::time::timeout(config.fetch_timeout, source.fetch()) => match fetched {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout(config.fetch_timeout)),
            },
        };

        match result {
            Ok(payloads) => return Ok((payloads, attempts)),
            Err(error) if error.is_transient() => {
                log::debug!("Source {} attempt {} failed: {}", source.id(), attempts, error);
                if backoff.sleep_or_cancel(cancel).await.is_err() {
                    return Err((attempts, error));
                }
            }
            Err(error) => return Err((attempts, error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::error::ConfigurationError;
    use crate::pipeline::normalizer::SourceKind;
    use crate::pipeline::store::{ChangeFeed, InMemoryStore, RecordFilter};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};

    enum Behavior {
        Rows(Vec<Value>),
        Hang,
        FailTimes(u32, Vec<Value>),
        Unauthorized,
    }

    struct ScriptedSource {
        id: String,
        behavior: Behavior,
        calls: AtomicU32,
    }

    impl ScriptedSource {
        fn new(id: &str, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                behavior,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl EmissionSource for ScriptedSource {
        fn id(&self) -> &str {
            &self.id
        }

        fn kind(&self) -> SourceKind {
            SourceKind::Aws
        }

        fn default_location(&self) -> Option<&str> {
            Some("us-east-1")
        }

        async fn fetch(&self) -> Result<Vec<Value>, FetchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Rows(rows) => Ok(rows.clone()),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Vec::new())
                }
                Behavior::FailTimes(n, _) if call < *n => Err(FetchError::Http {
                    status: 503,
                    body: "busy".to_string(),
                }),
                Behavior::FailTimes(_, rows) => Ok(rows.clone()),
                Behavior::Unauthorized => Err(FetchError::Configuration(ConfigurationError::Missing(
                    "AWS_API_KEY".to_string(),
                ))),
            }
        }
    }

    fn aws_row(ts: i64, emissions: f64) -> Value {
        json!({
            "energy_consumption": 12.5,
            "co2_emissions": emissions,
            "renewable_energy_pct": 40.0,
            "pue": 1.3,
            "timestamp": ts
        })
    }

    fn fast_config() -> CollectorConfig {
        CollectorConfig {
            fetch_timeout: Duration::from_millis(50),
            max_retries: 2,
            backoff_initial_ms: 1,
            backoff_max_ms: 5,
        }
    }

    #[tokio::test]
    async fn test_one_timeout_among_three_sources() {
        let mut collector = IngestionCollector::new(fast_config());
        collector.add_source(ScriptedSource::new("A", Behavior::Rows(vec![aws_row(1, 10.0)])));
        collector.add_source(ScriptedSource::new("B", Behavior::Hang));
        collector.add_source(ScriptedSource::new("C", Behavior::Rows(vec![aws_row(2, 20.0), aws_row(3, 30.0)])));

        let report = collector.collect_all(&CancellationToken::new()).await;

        assert_eq!(report.batches.len(), 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.status, CollectionStatus::Partial);
        assert_eq!(report.record_count(), 3);
        assert_eq!(report.failed_sources(), vec!["B"]);
        match &report.errors[0] {
            CollectionError::Fetch { error, attempts, .. } => {
                assert!(matches!(error, FetchError::Timeout(_)));
                assert_eq!(*attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_all_sources_failed_is_distinct_from_no_data() {
        let mut failing = IngestionCollector::new(fast_config());
        failing.add_source(ScriptedSource::new("A", Behavior::Unauthorized));
        failing.add_source(ScriptedSource::new("B", Behavior::Hang));
        let report = failing.collect_all(&CancellationToken::new()).await;
        assert_eq!(report.status, CollectionStatus::AllFailed);
        assert_eq!(report.errors.len(), 2);

        let mut quiet = IngestionCollector::new(fast_config());
        quiet.add_source(ScriptedSource::new("A", Behavior::Rows(Vec::new())));
        let report = quiet.collect_all(&CancellationToken::new()).await;
        assert_eq!(report.status, CollectionStatus::NoData);
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let source = ScriptedSource::new("A", Behavior::FailTimes(2, vec![aws_row(1, 10.0)]));
        let collector = IngestionCollector::new(fast_config());

        let results = collector.collect(source.as_ref(), &CancellationToken::new()).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok());
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_failure_is_not_retried() {
        let source = ScriptedSource::new("A", Behavior::Unauthorized);
        let collector = IngestionCollector::new(fast_config());

        let results = collector.collect(source.as_ref(), &CancellationToken::new()).await;
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(CollectionError::Fetch { attempts: 1, .. })));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bad_payload_isolated_to_record() {
        let bad = json!({"energy_consumption": -1.0, "co2_emissions": 1.0, "pue": 1.2, "timestamp": 5});
        let source = ScriptedSource::new("A", Behavior::Rows(vec![aws_row(1, 10.0), bad]));
        let collector = IngestionCollector::new(fast_config());

        let results = collector.collect(source.as_ref(), &CancellationToken::new()).await;
        assert_eq!(results.len(), 2);
        let record = results[0].as_ref().unwrap();
        assert_eq!(record.location, "us-east-1");
        assert_eq!(record.source_id, "A");
        assert!(matches!(results[1], Err(CollectionError::Normalization { .. })));
    }

    #[tokio::test]
    async fn test_cancel_stops_hanging_fetch() {
        let source = ScriptedSource::new("A", Behavior::Hang);
        let collector = IngestionCollector::new(CollectorConfig {
            fetch_timeout: Duration::from_secs(3600),
            ..fast_config()
        });
        let cancel = CancellationToken::new();
        cancel.cancel();

        let results = collector.collect(source.as_ref(), &cancel).await;
        assert!(matches!(
            results[0],
            Err(CollectionError::Fetch {
                error: FetchError::Cancelled,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_collect_into_store() {
        let store = InMemoryStore::default();
        let mut collector = IngestionCollector::new(fast_config());
        collector.add_source(ScriptedSource::new("A", Behavior::Rows(vec![aws_row(1, 10.0), aws_row(2, 11.0)])));

        let report = collector.collect_into(&store, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.status, CollectionStatus::Ok);

        let stored = store.select(&RecordFilter::default().source("A")).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert!(report.rejected.is_empty());
    }

    /// Store that refuses records observed at one timestamp
    struct PickyStore {
        inner: InMemoryStore,
        refuse_at: i64,
    }

    #[async_trait]
    impl EmissionStore for PickyStore {
        async fn insert(&self, records: &[EmissionRecord]) -> Result<(), StoreError> {
            let (refused, accepted): (Vec<_>, Vec<_>) =
                records.iter().cloned().partition(|r| r.observed_at == self.refuse_at);
            self.inner.insert(&accepted).await?;
            if refused.is_empty() {
                Ok(())
            } else {
                Err(StoreError::PartialFailure {
                    rejected: refused.iter().map(EmissionRecord::key).collect(),
                })
            }
        }

        async fn select(&self, filter: &RecordFilter) -> Result<Vec<EmissionRecord>, StoreError> {
            self.inner.select(filter).await
        }

        async fn subscribe(&self) -> Result<Box<dyn ChangeFeed>, StoreError> {
            self.inner.subscribe().await
        }
    }

    #[tokio::test]
    async fn test_collect_into_reports_rejected_subset() {
        let store = PickyStore {
            inner: InMemoryStore::default(),
            refuse_at: 2,
        };
        let mut collector = IngestionCollector::new(fast_config());
        collector.add_source(ScriptedSource::new(
            "A",
            Behavior::Rows(vec![aws_row(1, 10.0), aws_row(2, 11.0), aws_row(3, 12.0)]),
        ));

        let report = collector.collect_into(&store, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].observed_at, 2);

        let retry = report.rejected_records();
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].total_emissions_kg, 11.0);
        assert_eq!(store.inner.len(), 2);
    }
}
