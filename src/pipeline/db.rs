//! SQLite persistence
//!
//! - `SqliteEmissionStore` - the record store (batch insert, filtered
//!   select, rowid-polling change feed)
//! - `SqliteAggregateWriter` - bucket upserts and alert history
//! - `run_schema_migrations` - idempotent schema loader for `/sql/*.sql`
//!
//! Both handles share one connection behind a mutex; WAL mode is enabled by
//! the migration step.

use super::error::StoreError;
use super::normalizer::validate_record;
use super::store::{ChangeFeed, EmissionStore, RecordFilter};
use super::types::{AggregateBucket, AlertEvent, EmissionRecord};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension};
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Rows fetched per change-feed poll
const FEED_BATCH_SIZE: i64 = 500;

/// Trait for writing aggregates and alerts
///
/// Tables written (see `/sql/` directory):
/// - `aggregate_buckets` - UPSERT on bucket key
/// - `alert_events` - INSERT (append-only)
#[async_trait]
pub trait AggregateDbWriter: Send + Sync {
    /// SQL reference: `/sql/02_aggregate_buckets.sql`
    ///
    /// Operation: UPSERT (INSERT ... ON CONFLICT DO UPDATE), `created_at`
    /// preserved from the first write
    async fn write_aggregates(&self, buckets: Vec<AggregateBucket>) -> Result<(), StoreError>;

    /// SQL reference: `/sql/03_alert_events.sql`
    async fn write_alerts(&self, alerts: Vec<AlertEvent>) -> Result<(), StoreError>;
}

/// Run schema migrations from SQL files
///
/// Reads all .sql files from `schema_dir` in file name order and executes
/// them. Every file must use "IF NOT EXISTS" clauses so reruns are no-ops.
pub fn run_schema_migrations(conn: &mut Connection, schema_dir: &str) -> Result<(), StoreError> {
    let schema_path = Path::new(schema_dir);

    if !schema_path.exists() {
        return Err(StoreError::Backend(format!("Schema directory not found: {}", schema_dir)));
    }

    conn.pragma_update(None, "journal_mode", "WAL")?;
    log::info!("📊 Enabled WAL mode for SQLite database");

    let io_err = |e: std::io::Error| StoreError::Backend(e.to_string());

    let mut sql_files: Vec<_> = fs::read_dir(schema_path)
        .map_err(io_err)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("sql"))
        .collect();

    sql_files.sort_by_key(|entry| entry.file_name());

    log::info!("🔧 Running schema migrations from: {}", schema_dir);

    for entry in sql_files {
        let path = entry.path();
        let filename = entry.file_name().to_string_lossy().into_owned();

        log::info!("   ├─ Executing: {}", filename);
        let sql_content = fs::read_to_string(&path).map_err(io_err)?;
        conn.execute_batch(&sql_content)?;
        log::info!("   └─ ✅ Success: {}", filename);
    }

    log::info!("✅ All schema migrations completed successfully");
    Ok(())
}

type SharedConnection = Arc<Mutex<Connection>>;

fn lock(conn: &SharedConnection) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(PoisonError::into_inner)
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EmissionRecord> {
    Ok(EmissionRecord {
        source_id: row.get("source_id")?,
        location: row.get("location")?,
        observed_at: row.get("observed_at")?,
        energy_consumption_mwh: row.get("energy_consumption_mwh")?,
        total_emissions_kg: row.get("total_emissions_kg")?,
        renewable_usage_pct: row.get("renewable_usage_pct")?,
        ai_workload_pct: row.get("ai_workload_pct")?,
        pue: row.get("pue")?,
    })
}

/// SQLite-backed record store
pub struct SqliteEmissionStore {
    conn: SharedConnection,
    poll_interval: Duration,
}

impl SqliteEmissionStore {
    /// Open (or create) the database and apply the schema
    pub fn open(db_path: &str, schema_dir: &str, poll_interval: Duration) -> Result<Self, StoreError> {
        let mut conn = Connection::open(db_path)?;
        run_schema_migrations(&mut conn, schema_dir)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            poll_interval,
        })
    }

    /// Writer sharing this store's connection
    pub fn aggregate_writer(&self) -> SqliteAggregateWriter {
        SqliteAggregateWriter {
            conn: self.conn.clone(),
        }
    }

    fn max_rowid(&self) -> Result<i64, StoreError> {
        let conn = lock(&self.conn);
        let max: Option<i64> = conn
            .query_row("SELECT MAX(rowid) FROM emission_records", [], |row| row.get(0))
            .optional()?
            .flatten();
        Ok(max.unwrap_or(0))
    }
}

#[async_trait]
impl EmissionStore for SqliteEmissionStore {
    /// INSERT OR IGNORE on the composite key inside one transaction
    async fn insert(&self, records: &[EmissionRecord]) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp();
        let mut rejected = Vec::new();

        {
            let mut conn = lock(&self.conn);
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    r#"
                    INSERT OR IGNORE INTO emission_records (
                        source_id, location, observed_at,
                        energy_consumption_mwh, total_emissions_kg,
                        renewable_usage_pct, ai_workload_pct, pue,
                        inserted_at
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )?;

                for record in records {
                    if let Err(e) = validate_record(record) {
                        log::warn!("⚠️  Rejecting record {}: {}", record.key(), e);
                        rejected.push(record.key());
                        continue;
                    }
                    stmt.execute(rusqlite::params![
                        record.source_id,
                        record.location,
                        record.observed_at,
                        record.energy_consumption_mwh,
                        record.total_emissions_kg,
                        record.renewable_usage_pct,
                        record.ai_workload_pct,
                        record.pue,
                        now,
                    ])?;
                }
            }
            tx.commit()?;
        }

        if rejected.is_empty() {
            Ok(())
        } else {
            Err(StoreError::PartialFailure { rejected })
        }
    }

    async fn select(&self, filter: &RecordFilter) -> Result<Vec<EmissionRecord>, StoreError> {
        let limit: i64 = filter
            .limit
            .map(|l| i64::try_from(l).unwrap_or(i64::MAX))
            .unwrap_or(-1);

        let conn = lock(&self.conn);
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT source_id, location, observed_at,
                   energy_consumption_mwh, total_emissions_kg,
                   renewable_usage_pct, ai_workload_pct, pue
            FROM emission_records
            WHERE (?1 IS NULL OR source_id = ?1)
              AND (?2 IS NULL OR location = ?2)
              AND (?3 IS NULL OR observed_at >= ?3)
              AND (?4 IS NULL OR observed_at < ?4)
            ORDER BY observed_at, source_id, location
            LIMIT ?5
            "#,
        )?;

        let rows = stmt.query_map(
            rusqlite::params![filter.source_id, filter.location, filter.since, filter.until, limit],
            record_from_row,
        )?;

        let records = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Feed starts after the newest row present right now
    async fn subscribe(&self) -> Result<Box<dyn ChangeFeed>, StoreError> {
        let last_rowid = self.max_rowid()?;
        log::debug!("Change feed subscribed at rowid {}", last_rowid);
        Ok(Box::new(SqlitePollingFeed {
            conn: self.conn.clone(),
            last_rowid,
            poll_interval: self.poll_interval,
            pending: VecDeque::new(),
        }))
    }
}

/// Change feed that polls `emission_records` by rowid
struct SqlitePollingFeed {
    conn: SharedConnection,
    last_rowid: i64,
    poll_interval: Duration,
    pending: VecDeque<EmissionRecord>,
}

impl SqlitePollingFeed {
    fn poll(&mut self) -> Result<(), StoreError> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare_cached(
            r#"
            SELECT rowid, source_id, location, observed_at,
                   energy_consumption_mwh, total_emissions_kg,
                   renewable_usage_pct, ai_workload_pct, pue
            FROM emission_records
            WHERE rowid > ?
            ORDER BY rowid
            LIMIT ?
            "#,
        )?;

        let rows = stmt.query_map(rusqlite::params![self.last_rowid, FEED_BATCH_SIZE], |row| {
            Ok((row.get::<_, i64>("rowid")?, record_from_row(row)?))
        })?;

        for row in rows {
            let (rowid, record) = row?;
            self.last_rowid = rowid;
            self.pending.push_back(record);
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for SqlitePollingFeed {
    async fn recv(&mut self) -> Result<EmissionRecord, StoreError> {
        loop {
            if let Some(record) = self.pending.pop_front() {
                return Ok(record);
            }
            self.poll()?;
            if self.pending.is_empty() {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }
}

/// SQLite implementation of AggregateDbWriter
pub struct SqliteAggregateWriter {
    conn: SharedConnection,
}

impl SqliteAggregateWriter {
    /// Open a writer on an existing database
    ///
    /// Does NOT create the schema; run `run_schema_migrations` first.
    pub fn new(db_path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl AggregateDbWriter for SqliteAggregateWriter {
    async fn write_aggregates(&self, buckets: Vec<AggregateBucket>) -> Result<(), StoreError> {
        if buckets.is_empty() {
            return Ok(());
        }

        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                r#"
                INSERT INTO aggregate_buckets (
                    dimension, dimension_value, window_size, window_start, window_end,
                    record_count, sum_emissions_kg, sum_energy_mwh,
                    sum_renewable_pct, sum_ai_workload_pct, sum_pue,
                    min_emissions_kg, max_emissions_kg, mean_emissions_kg,
                    created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(dimension, dimension_value, window_size, window_start) DO UPDATE SET
                    window_end = excluded.window_end,
                    record_count = excluded.record_count,
                    sum_emissions_kg = excluded.sum_emissions_kg,
                    sum_energy_mwh = excluded.sum_energy_mwh,
                    sum_renewable_pct = excluded.sum_renewable_pct,
                    sum_ai_workload_pct = excluded.sum_ai_workload_pct,
                    sum_pue = excluded.sum_pue,
                    min_emissions_kg = excluded.min_emissions_kg,
                    max_emissions_kg = excluded.max_emissions_kg,
                    mean_emissions_kg = excluded.mean_emissions_kg,
                    updated_at = excluded.updated_at
                "#,
            )?;

            for bucket in &buckets {
                let has_rows = bucket.count > 0;
                stmt.execute(rusqlite::params![
                    bucket.key.dimension.as_str(),
                    bucket.key.value,
                    bucket.key.window.size.as_str(),
                    bucket.key.window.start,
                    bucket.key.window.end(),
                    bucket.count as i64,
                    bucket.sum_emissions,
                    bucket.sum_energy,
                    bucket.sum_renewable_pct,
                    bucket.sum_ai_workload_pct,
                    bucket.sum_pue,
                    has_rows.then_some(bucket.min_emissions),
                    has_rows.then_some(bucket.max_emissions),
                    bucket.mean_emissions(),
                    bucket.created_at,
                    bucket.updated_at,
                ])?;
            }
        }
        tx.commit()?;

        log::debug!("Wrote {} aggregate buckets", buckets.len());
        Ok(())
    }

    async fn write_alerts(&self, alerts: Vec<AlertEvent>) -> Result<(), StoreError> {
        if alerts.is_empty() {
            return Ok(());
        }

        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                r#"
                INSERT INTO alert_events (
                    rule_id, level, message, details,
                    dimension, dimension_value, window_size, window_start,
                    observed_value, raised_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )?;

            for alert in &alerts {
                stmt.execute(rusqlite::params![
                    alert.rule_id,
                    alert.level.as_str(),
                    alert.message,
                    alert.details,
                    alert.bucket.dimension.as_str(),
                    alert.bucket.value,
                    alert.bucket.window.size.as_str(),
                    alert.bucket.window.start,
                    alert.observed_value,
                    alert.raised_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{AlertLevel, BucketKey, Dimension, TimeWindow, WindowSize};
    use tempfile::NamedTempFile;

    const SCHEMA_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/sql");

    /// Helper to create a test database with schema
    fn create_test_store() -> (NamedTempFile, SqliteEmissionStore) {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap().to_string();
        let store = SqliteEmissionStore::open(&db_path, SCHEMA_DIR, Duration::from_millis(10)).unwrap();
        (temp_file, store)
    }

    fn make_record(source: &str, location: &str, observed_at: i64, emissions: f64) -> EmissionRecord {
        EmissionRecord {
            source_id: source.to_string(),
            location: location.to_string(),
            observed_at,
            energy_consumption_mwh: 2.0,
            total_emissions_kg: emissions,
            renewable_usage_pct: 45.0,
            ai_workload_pct: 12.0,
            pue: 1.25,
        }
    }

    fn make_bucket(value: &str, emissions: &[f64], now: i64) -> AggregateBucket {
        let key = BucketKey::new(
            Dimension::Location,
            value,
            TimeWindow::containing(WindowSize::Hour1, 1_700_000_000),
        );
        let mut bucket = AggregateBucket::empty(key, now);
        for (i, e) in emissions.iter().enumerate() {
            bucket.accumulate(&make_record("GCP", value, 1_700_000_000 + i as i64, *e), now);
        }
        bucket
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut conn = Connection::open(temp_file.path()).unwrap();
        run_schema_migrations(&mut conn, SCHEMA_DIR).unwrap();
        run_schema_migrations(&mut conn, SCHEMA_DIR).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('emission_records', 'aggregate_buckets', 'alert_events')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 3);
    }

    #[test]
    fn test_missing_schema_dir() {
        let mut conn = Connection::open_in_memory().unwrap();
        let err = run_schema_migrations(&mut conn, "/nonexistent/schema").unwrap_err();
        assert!(err.to_string().contains("Schema directory not found"));
    }

    #[tokio::test]
    async fn test_insert_is_idempotent_and_select_filters() {
        let (_temp, store) = create_test_store();

        store
            .insert(&[make_record("GCP", "us", 10, 1.0), make_record("AWS", "eu", 20, 2.0)])
            .await
            .unwrap();
        store.insert(&[make_record("GCP", "us", 10, 99.0)]).await.unwrap();

        let all = store.select(&RecordFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        // First write wins
        assert_eq!(all[0].total_emissions_kg, 1.0);

        let eu = store.select(&RecordFilter::default().location("eu")).await.unwrap();
        assert_eq!(eu, vec![make_record("AWS", "eu", 20, 2.0)]);

        let early = store.select(&RecordFilter::default().between(0, 15)).await.unwrap();
        assert_eq!(early.len(), 1);

        let limited = store.select(&RecordFilter::default().limit(1)).await.unwrap();
        assert_eq!(limited[0].observed_at, 10);
    }

    #[tokio::test]
    async fn test_insert_partial_failure() {
        let (_temp, store) = create_test_store();
        let mut bad = make_record("GCP", "us", 11, 1.0);
        bad.pue = 0.9;

        let err = store.insert(&[make_record("GCP", "us", 10, 1.0), bad.clone()]).await.unwrap_err();
        match err {
            StoreError::PartialFailure { rejected } => assert_eq!(rejected, vec![bad.key()]),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.select(&RecordFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_feed_starts_after_existing_rows() {
        let (_temp, store) = create_test_store();
        store.insert(&[make_record("GCP", "us", 1, 1.0)]).await.unwrap();

        let mut feed = store.subscribe().await.unwrap();
        store
            .insert(&[make_record("GCP", "us", 2, 2.0), make_record("GCP", "us", 3, 3.0)])
            .await
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), feed.recv()).await.unwrap().unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), feed.recv()).await.unwrap().unwrap();
        assert_eq!(first.observed_at, 2);
        assert_eq!(second.observed_at, 3);

        // Nothing else pending
        assert!(tokio::time::timeout(Duration::from_millis(50), feed.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_upsert_preserves_created_at() {
        let (_temp, store) = create_test_store();
        let writer = store.aggregate_writer();

        writer.write_aggregates(vec![make_bucket("us", &[100.0], 1_000)]).await.unwrap();
        writer
            .write_aggregates(vec![make_bucket("us", &[100.0, 200.0], 2_000)])
            .await
            .unwrap();

        let conn = lock(&writer.conn);
        let (count, sum, mean, created_at, updated_at): (i64, f64, f64, i64, i64) = conn
            .query_row(
                "SELECT record_count, sum_emissions_kg, mean_emissions_kg, created_at, updated_at
                 FROM aggregate_buckets WHERE dimension = 'location' AND dimension_value = 'us'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .unwrap();

        assert_eq!(count, 2);
        assert_eq!(sum, 300.0);
        assert_eq!(mean, 150.0);
        assert_eq!(created_at, 1_000);
        assert_eq!(updated_at, 2_000);
    }

    #[tokio::test]
    async fn test_alerts_are_appended() {
        let (_temp, store) = create_test_store();
        let writer = store.aggregate_writer();
        let bucket = make_bucket("us", &[1.0], 1_000);

        let alert = AlertEvent {
            rule_id: "high-pue".to_string(),
            level: AlertLevel::Info,
            message: "Suboptimal PUE in us".to_string(),
            details: "mean_pue=1.90".to_string(),
            raised_at: 1_000,
            bucket: bucket.key.clone(),
            observed_value: 1.9,
        };
        writer.write_alerts(vec![alert.clone(), alert]).await.unwrap();

        let conn = lock(&writer.conn);
        let (count, level): (i64, String) = conn
            .query_row("SELECT COUNT(*), MAX(level) FROM alert_events", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(level, "info");
    }
}
