//! Concrete emission sources
//!
//! Every source returns raw JSON payloads. Normalization happens in the
//! collector so that one bad payload never hides the rest of a batch.
//!
//! ## Provider endpoints
//!
//! | kind  | path                    | auth header              |
//! |-------|-------------------------|--------------------------|
//! | gcp   | `/sustainability/metrics` | `Authorization: Bearer` |
//! | aws   | `/carbon-metrics`       | `x-api-key`              |
//! | azure | `/emissions`            | `Authorization: Bearer`  |

use super::config::ProviderCredentials;
use super::error::{ConfigurationError, FetchError};
use super::normalizer::{DatasetRow, SourceKind, SyntheticReading};
use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[async_trait]
pub trait EmissionSource: Send + Sync {
    /// Stable identifier, used as the provider dimension
    fn id(&self) -> &str;

    fn kind(&self) -> SourceKind;

    /// Location assigned to payloads that carry none
    fn default_location(&self) -> Option<&str> {
        None
    }

    /// Fetch the current payloads; each call re-fetches
    async fn fetch(&self) -> Result<Vec<Value>, FetchError>;
}

/// Provider sustainability API over HTTPS
pub struct ProviderApiSource {
    id: String,
    credentials: ProviderCredentials,
    default_location: Option<String>,
    client: reqwest::Client,
    timeout: Duration,
}

impl ProviderApiSource {
    pub fn new(credentials: ProviderCredentials, timeout: Duration) -> Result<Self, ConfigurationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigurationError::Invalid {
                key: format!("{}_ENDPOINT", credentials.kind.as_str().to_ascii_uppercase()),
                value: credentials.endpoint.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            id: provider_label(credentials.kind).to_string(),
            credentials,
            default_location: None,
            client,
            timeout,
        })
    }

    pub fn with_default_location(mut self, location: impl Into<String>) -> Self {
        self.default_location = Some(location.into());
        self
    }

    pub fn url(&self) -> String {
        let path = match self.credentials.kind {
            SourceKind::Aws => "carbon-metrics",
            SourceKind::Azure => "emissions",
            _ => "sustainability/metrics",
        };
        format!("{}/{}", self.credentials.endpoint, path)
    }

    fn request(&self) -> reqwest::RequestBuilder {
        let request = self
            .client
            .get(self.url())
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        match self.credentials.kind {
            SourceKind::Aws => request.header("x-api-key", &self.credentials.api_key),
            _ => request.bearer_auth(&self.credentials.api_key),
        }
    }
}

#[async_trait]
impl EmissionSource for ProviderApiSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        self.credentials.kind
    }

    fn default_location(&self) -> Option<&str> {
        self.default_location.as_deref()
    }

    async fn fetch(&self) -> Result<Vec<Value>, FetchError> {
        let timeout = self.timeout;
        let map_err = |e: reqwest::Error| {
            if e.is_timeout() {
                FetchError::Timeout(timeout)
            } else {
                FetchError::from(e)
            }
        };

        let response = self.request().send().await.map_err(map_err)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Http {
                status: status.as_u16(),
                body: body.chars().take(256).collect(),
            });
        }

        let body: Value = response.json().await.map_err(map_err)?;
        Ok(flatten_payload(body))
    }
}

/// A response may be one object, an array, or `{"data": [...]}`
fn flatten_payload(body: Value) -> Vec<Value> {
    match body {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Array(items)) => items,
            Some(other) => {
                map.insert("data".to_string(), other);
                vec![Value::Object(map)]
            }
            None => vec![Value::Object(map)],
        },
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

fn provider_label(kind: SourceKind) -> &'static str {
    match kind {
        SourceKind::Gcp => "GCP",
        SourceKind::Aws => "AWS",
        SourceKind::Azure => "Azure",
        SourceKind::Dataset => "dataset",
        SourceKind::Synthetic => "synthetic",
    }
}

/// On-disk layout of a dataset file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetFormat {
    /// Header row followed by one row per record
    Csv,
    /// One JSON object per line
    Jsonl,
}

impl DatasetFormat {
    /// `.csv` files are CSV, everything else is read as JSON lines
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => DatasetFormat::Csv,
            _ => DatasetFormat::Jsonl,
        }
    }
}

/// Emissions dataset exported to a local file
pub struct DatasetFileSource {
    id: String,
    path: PathBuf,
    format: DatasetFormat,
    default_location: Option<String>,
}

impl DatasetFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dataset".to_string());
        let format = DatasetFormat::from_path(&path);
        Self {
            id,
            path,
            format,
            default_location: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_format(mut self, format: DatasetFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_default_location(mut self, location: impl Into<String>) -> Self {
        self.default_location = Some(location.into());
        self
    }

    pub fn format(&self) -> DatasetFormat {
        self.format
    }

    fn parse_jsonl(&self, content: &str) -> Vec<Value> {
        let mut rows = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line) {
                Ok(row) => rows.push(row),
                Err(e) => log::warn!(
                    "⚠️  Skipping unparsable line {} in {}: {}",
                    line_no + 1,
                    self.path.display(),
                    e
                ),
            }
        }
        rows
    }

    fn parse_csv(&self, content: &str) -> Vec<Value> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(content.as_bytes());

        let mut rows = Vec::new();
        for (index, result) in reader.deserialize::<DatasetRow>().enumerate() {
            let row = match result {
                Ok(row) => row,
                Err(e) => {
                    // +2: header row, 1-based lines
                    log::warn!(
                        "⚠️  Skipping unparsable row {} in {}: {}",
                        index + 2,
                        self.path.display(),
                        e
                    );
                    continue;
                }
            };
            match serde_json::to_value(&row) {
                Ok(value) => rows.push(value),
                Err(e) => log::warn!("⚠️  Skipping row {} in {}: {}", index + 2, self.path.display(), e),
            }
        }
        rows
    }
}

#[async_trait]
impl EmissionSource for DatasetFileSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Dataset
    }

    fn default_location(&self) -> Option<&str> {
        self.default_location.as_deref()
    }

    async fn fetch(&self) -> Result<Vec<Value>, FetchError> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FetchError::Malformed(format!("{}: {}", self.path.display(), e))
            } else {
                FetchError::Connection(format!("{}: {}", self.path.display(), e))
            }
        })?;

        Ok(match self.format {
            DatasetFormat::Csv => self.parse_csv(&content),
            DatasetFormat::Jsonl => self.parse_jsonl(&content),
        })
    }
}

/// Baseline reading the synthetic generator perturbs
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticTemplate {
    pub location: String,
    pub energy_consumption_mwh: f64,
    pub total_emissions_kg: f64,
    pub renewable_usage_pct: f64,
    pub ai_workload_pct: f64,
    pub pue: f64,
}

impl SyntheticTemplate {
    pub fn defaults() -> Vec<SyntheticTemplate> {
        let row = |location: &str, energy: f64, emissions: f64, renewable: f64, ai: f64, pue: f64| {
            SyntheticTemplate {
                location: location.to_string(),
                energy_consumption_mwh: energy,
                total_emissions_kg: emissions,
                renewable_usage_pct: renewable,
                ai_workload_pct: ai,
                pue,
            }
        };
        vec![
            row("us-central1", 1_250.0, 410_000.0, 64.0, 38.0, 1.10),
            row("eu-west-1", 980.0, 220_000.0, 78.0, 22.0, 1.15),
            row("ap-southeast-1", 1_430.0, 690_000.0, 21.0, 41.0, 1.45),
            row("westeurope", 760.0, 180_000.0, 55.0, 17.0, 1.25),
        ]
    }
}

/// Generates one jittered reading per fetch, timestamped "now"
///
/// Emissions vary by ±10% and AI workload by ±5% around a randomly picked
/// template.
pub struct SyntheticSource {
    id: String,
    templates: Vec<SyntheticTemplate>,
    readings_per_fetch: usize,
    now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl SyntheticSource {
    pub fn new(templates: Vec<SyntheticTemplate>) -> Self {
        Self {
            id: "synthetic".to_string(),
            templates,
            readings_per_fetch: 1,
            now_fn: Box::new(|| chrono::Utc::now().timestamp()),
        }
    }

    pub fn with_readings_per_fetch(mut self, n: usize) -> Self {
        self.readings_per_fetch = n.max(1);
        self
    }

    pub fn with_timestamp_fn(mut self, now_fn: Box<dyn Fn() -> i64 + Send + Sync>) -> Self {
        self.now_fn = now_fn;
        self
    }

    fn generate(&self) -> Result<Vec<Value>, FetchError> {
        if self.templates.is_empty() {
            return Ok(Vec::new());
        }

        let now = (self.now_fn)();
        let mut rng = rand::thread_rng();
        let mut readings = Vec::with_capacity(self.readings_per_fetch);

        for i in 0..self.readings_per_fetch {
            let template = &self.templates[rng.gen_range(0..self.templates.len())];
            let reading = SyntheticReading {
                location: template.location.clone(),
                // Distinct keys within one fetch
                observed_at: now + i as i64,
                energy_consumption_mwh: template.energy_consumption_mwh,
                total_emissions_kg: template.total_emissions_kg * (1.0 + rng.gen_range(-0.1..0.1)),
                renewable_usage_pct: template.renewable_usage_pct,
                ai_workload_pct: (template.ai_workload_pct * (1.0 + rng.gen_range(-0.05..0.05)))
                    .clamp(0.0, 100.0),
                pue: template.pue,
            };
            readings.push(
                serde_json::to_value(&reading).map_err(|e| FetchError::Malformed(e.to_string()))?,
            );
        }
        Ok(readings)
    }
}

#[async_trait]
impl EmissionSource for SyntheticSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Synthetic
    }

    async fn fetch(&self) -> Result<Vec<Value>, FetchError> {
        self.generate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::normalizer::{normalize, NormalizeContext};
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_flatten_payload_shapes() {
        assert_eq!(flatten_payload(json!([{"a": 1}, {"a": 2}])).len(), 2);
        assert_eq!(flatten_payload(json!({"data": [{"a": 1}]})), vec![json!({"a": 1})]);
        assert_eq!(flatten_payload(json!({"energy_kwh": 5})), vec![json!({"energy_kwh": 5})]);
        assert!(flatten_payload(Value::Null).is_empty());
    }

    #[test]
    fn test_provider_urls_and_ids() {
        let creds = |kind| ProviderCredentials {
            kind,
            api_key: "k".to_string(),
            endpoint: "http://localhost:1".to_string(),
        };
        let timeout = Duration::from_secs(1);

        let gcp = ProviderApiSource::new(creds(SourceKind::Gcp), timeout).unwrap();
        assert_eq!(gcp.url(), "http://localhost:1/sustainability/metrics");
        assert_eq!(gcp.id(), "GCP");

        let aws = ProviderApiSource::new(creds(SourceKind::Aws), timeout).unwrap();
        assert_eq!(aws.url(), "http://localhost:1/carbon-metrics");

        let azure = ProviderApiSource::new(creds(SourceKind::Azure), timeout)
            .unwrap()
            .with_default_location("westeurope");
        assert_eq!(azure.url(), "http://localhost:1/emissions");
        assert_eq!(azure.default_location(), Some("westeurope"));
    }

    #[tokio::test]
    async fn test_unreachable_provider_is_transient() {
        let creds = ProviderCredentials {
            kind: SourceKind::Gcp,
            api_key: "k".to_string(),
            // Port 9 (discard) on localhost is not listening
            endpoint: "http://127.0.0.1:9".to_string(),
        };
        let source = ProviderApiSource::new(creds, Duration::from_secs(2)).unwrap();
        let err = source.fetch().await.unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_jsonl_dataset_skips_bad_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"Cloud Service Provider":"AWS","Location":"eu-west-1","Energy Consumption (MWh)":10.0,"Total Emissions (kg CO₂e)":500.0,"Renewable Energy Usage (%)":60.0,"AI Workload (%)":20.0,"PUE (Power Usage Effectiveness)":1.2,"uploaded_at":1700000000}}"#
        )
        .unwrap();
        writeln!(file).unwrap();
        writeln!(file, "{{broken").unwrap();

        let source = DatasetFileSource::new(file.path()).with_id("emissions");
        let rows = source.fetch().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(source.id(), "emissions");
        assert_eq!(source.kind(), SourceKind::Dataset);
    }

    #[tokio::test]
    async fn test_csv_dataset_rows_normalize() {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(
            file,
            "Data Center ID,Cloud Service Provider,Location,Energy Consumption (MWh),Total Emissions (kg CO₂e),Renewable Energy Usage (%),AI Workload (%),PUE (Power Usage Effectiveness),Timestamp"
        )
        .unwrap();
        writeln!(file, "DC-001,Google,us-central1,1250.5,430000,64.5,35,1.12,2024-01-01T00:00:00Z").unwrap();
        writeln!(file, "DC-002,AWS,eu-west-1,not-a-number,1,1,1,1.2,1700000000").unwrap();
        writeln!(file, "DC-003,Azure,westeurope,800,210000,70,20,1.18,1700000000").unwrap();

        let source = DatasetFileSource::new(file.path()).with_id("emissions");
        assert_eq!(source.format(), DatasetFormat::Csv);

        let rows = source.fetch().await.unwrap();
        assert_eq!(rows.len(), 2);

        let ctx = NormalizeContext {
            source_id: source.id().to_string(),
            default_location: None,
            received_at: 1_700_000_000,
        };
        let first = normalize(&rows[0], SourceKind::Dataset, &ctx).unwrap();
        assert_eq!(first.location, "us-central1");
        assert_eq!(first.observed_at, 1_704_067_200);
        assert_eq!(first.energy_consumption_mwh, 1250.5);
        assert_eq!(first.total_emissions_kg, 430_000.0);

        let second = normalize(&rows[1], SourceKind::Dataset, &ctx).unwrap();
        assert_eq!(second.location, "westeurope");
        assert_eq!(second.observed_at, 1_700_000_000);
    }

    #[test]
    fn test_dataset_format_follows_extension() {
        assert_eq!(DatasetFormat::from_path(Path::new("data/emissions.CSV")), DatasetFormat::Csv);
        assert_eq!(DatasetFormat::from_path(Path::new("emissions.jsonl")), DatasetFormat::Jsonl);
        assert_eq!(DatasetFormat::from_path(Path::new("emissions")), DatasetFormat::Jsonl);
    }

    #[tokio::test]
    async fn test_missing_dataset_is_not_transient() {
        let source = DatasetFileSource::new("/nonexistent/emissions.jsonl");
        let err = source.fetch().await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_synthetic_readings_normalize() {
        let source = SyntheticSource::new(SyntheticTemplate::defaults())
            .with_readings_per_fetch(20)
            .with_timestamp_fn(Box::new(|| 1_700_000_000));

        let payloads = source.fetch().await.unwrap();
        assert_eq!(payloads.len(), 20);

        let ctx = NormalizeContext {
            source_id: source.id().to_string(),
            default_location: None,
            received_at: 1_700_000_000,
        };
        for payload in &payloads {
            let record = normalize(payload, SourceKind::Synthetic, &ctx).unwrap();
            assert_eq!(record.source_id, "synthetic");
            assert!(record.observed_at >= 1_700_000_000);
        }
    }

    #[tokio::test]
    async fn test_synthetic_without_templates_is_empty() {
        let source = SyntheticSource::new(Vec::new());
        assert!(source.fetch().await.unwrap().is_empty());
    }
}
