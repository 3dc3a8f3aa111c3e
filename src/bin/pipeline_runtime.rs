//! Pipeline Runtime
//!
//! Orchestrates the emissions pipeline:
//! - Initializes the SQLite store with schema
//! - Builds the collector from the configured sources
//! - Subscribes to the change feed and backfills live windows from the store
//! - Spawns the collector, change relay and monitor tasks
//! - Shuts everything down on CTRL+C with a final aggregate flush
//!
//! Usage:
//!   cargo run --release --bin pipeline_runtime
//!
//! See `PipelineConfig::from_env` for the environment variables.

use dotenv::dotenv;
use emissionflow::pipeline::{
    alerts::{default_rules, load_rules},
    collector::IngestionCollector,
    config::{PipelineConfig, ProviderCredentials},
    db::{AggregateDbWriter, SqliteEmissionStore},
    engine::{lock_engine, AggregationEngine},
    ingestion::Monitor,
    relay::{ChangeRelay, RelayEvent},
    sources::{DatasetFileSource, ProviderApiSource, SyntheticSource, SyntheticTemplate},
    store::EmissionStore,
};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("🚀 Emissions Pipeline Runtime");

    let config = PipelineConfig::from_env();
    config.validate()?;

    info!("✅ Configuration loaded");
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Windows: {:?}", config.windows);
    info!("   ├─ Collect interval: {}ms", config.collect_interval_ms);
    info!("   ├─ Flush interval: {}ms", config.flush_interval_ms);
    info!("   └─ Retention: {}s", config.retention_secs);

    info!("🔧 Initializing database...");
    let sqlite = SqliteEmissionStore::open(
        &config.db_path,
        &config.schema_dir,
        Duration::from_millis(config.relay_poll_interval_ms),
    )?;
    let db_writer: Arc<dyn AggregateDbWriter> = Arc::new(sqlite.aggregate_writer());
    let store: Arc<dyn EmissionStore> = Arc::new(sqlite);
    info!("✅ Database initialized");

    let engine = AggregationEngine::new(config.engine_config()).into_shared();
    let subscription = lock_engine(&engine).subscribe();
    info!("✅ AggregationEngine created");

    let mut collector = IngestionCollector::new(config.collector_config());
    let fetch_timeout = Duration::from_millis(config.fetch_timeout_ms);
    for kind in &config.enabled_providers {
        let source = ProviderCredentials::from_env(*kind)
            .and_then(|credentials| ProviderApiSource::new(credentials, fetch_timeout));
        match source {
            Ok(source) => {
                info!("   ├─ Provider source: {}", kind);
                collector.add_source(Arc::new(source));
            }
            Err(e) => warn!("⚠️  Skipping provider {}: {}", kind, e),
        }
    }
    for path in &config.dataset_paths {
        let source = DatasetFileSource::new(path.clone());
        info!("   ├─ Dataset source: {} ({:?})", path.display(), source.format());
        collector.add_source(Arc::new(source));
    }
    if config.enable_synthetic {
        info!("   ├─ Synthetic source enabled");
        collector.add_source(Arc::new(SyntheticSource::new(SyntheticTemplate::defaults())));
    }
    info!("   └─ {} source(s) configured", collector.source_count());
    if collector.source_count() == 0 {
        warn!("⚠️  No sources configured, only records inserted by other writers will be aggregated");
    }

    let rules = match &config.alert_rules_path {
        Some(path) => load_rules(path)?,
        None => default_rules(config.alert_critical_emissions_kg),
    };
    info!("✅ {} alert rule(s) loaded", rules.len());

    let cancel = CancellationToken::new();
    let (relay_tx, relay_rx) = mpsc::channel::<RelayEvent>(256);

    info!("🚀 Spawning background tasks...");

    // Subscribe before the collector can insert, then rebuild live buckets
    // so the first flush does not overwrite persisted aggregates
    let mut relay =
        ChangeRelay::new(store.clone(), engine.clone(), config.relay_config()).with_events(relay_tx);
    relay.attach(&cancel).await?;
    let backfilled = relay.backfill().await?;
    info!("✅ Engine backfilled with {} stored record(s)", backfilled);

    let relay_handle = tokio::spawn(relay.run(cancel.clone()));
    info!("   ├─ ✅ Change relay spawned");

    let monitor = Monitor::new(
        engine.clone(),
        db_writer,
        rules,
        Duration::from_millis(config.flush_interval_ms),
    );
    let monitor_handle = tokio::spawn(monitor.run(subscription, Some(relay_rx), cancel.clone()));
    info!("   ├─ ✅ Monitor spawned");

    let collector_handle = tokio::spawn(collector.run(
        store,
        Duration::from_millis(config.collect_interval_ms),
        cancel.clone(),
    ));
    info!("   └─ ✅ Collector spawned");

    info!("🔄 Press CTRL+C to shutdown gracefully");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("⚠️  Received CTRL+C, shutting down..."),
        Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
    }
    cancel.cancel();

    if let Err(e) = collector_handle.await {
        error!("❌ Collector task failed: {}", e);
    }
    match relay_handle.await {
        Ok(stats) => info!(
            "📊 Relay: {} received, {} duplicates, {} applied, {} gaps",
            stats.received, stats.duplicates, stats.applied, stats.gaps
        ),
        Err(e) => error!("❌ Relay task failed: {}", e),
    }
    match monitor_handle.await {
        Ok(stats) => info!(
            "📊 Monitor: {} flushes, {} buckets written, {} alerts",
            stats.flushes, stats.buckets_written, stats.alerts_raised
        ),
        Err(e) => error!("❌ Monitor task failed: {}", e),
    }

    let engine_stats = lock_engine(&engine).stats();
    info!(
        "📊 Engine: {} applied, {} duplicates, {} rejected, {} late",
        engine_stats.applied, engine_stats.duplicates, engine_stats.rejected, engine_stats.late
    );

    info!("✅ Pipeline runtime stopped");
    Ok(())
}
