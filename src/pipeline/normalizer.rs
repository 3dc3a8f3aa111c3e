//! Record normalization from heterogeneous source payloads
//!
//! Every source hands over `serde_json::Value` payloads. They are parsed into
//! one of the known shapes in [`RawPayload`] (unknown fields are ignored) and
//! then converted into a validated [`EmissionRecord`].
//!
//! Out-of-range values are rejected, never clamped. Missing percentages and
//! missing energy/emission amounts default to 0 (matching what the provider
//! collectors historically reported); a missing PUE is an error because 0 is
//! not a valid PUE.

use super::error::{NormalizationError, NormalizationReason};
use super::types::EmissionRecord;
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Latest accepted `observed_at` (9999-12-31T23:59:59Z)
pub const MAX_OBSERVED_AT: i64 = 253_402_300_799;

/// Kind of source a payload came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Gcp,
    Aws,
    Azure,
    Dataset,
    Synthetic,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Gcp => "gcp",
            SourceKind::Aws => "aws",
            SourceKind::Azure => "azure",
            SourceKind::Dataset => "dataset",
            SourceKind::Synthetic => "synthetic",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gcp" => Some(SourceKind::Gcp),
            "aws" => Some(SourceKind::Aws),
            "azure" => Some(SourceKind::Azure),
            "dataset" => Some(SourceKind::Dataset),
            "synthetic" => Some(SourceKind::Synthetic),
            _ => None,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timestamp as sent by a source: unix seconds or RFC 3339 text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Unix(i64),
    Text(String),
}

impl RawTimestamp {
    fn to_unix(&self) -> Result<i64, NormalizationError> {
        match self {
            RawTimestamp::Unix(ts) => Ok(*ts),
            RawTimestamp::Text(text) => DateTime::parse_from_rfc3339(text)
                .map(|dt| dt.timestamp())
                .map_err(|_| {
                    NormalizationError::new("timestamp", text, NormalizationReason::Malformed)
                }),
        }
    }
}

/// GCP sustainability metrics (energy reported in kWh)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GcpMetrics {
    pub energy_kwh: Option<f64>,
    pub carbon_kg: Option<f64>,
    pub region: Option<String>,
    pub renewable_pct: Option<f64>,
    pub ai_workload_pct: Option<f64>,
    pub pue: Option<f64>,
    pub timestamp: Option<RawTimestamp>,
}

/// AWS carbon metrics (energy in MWh)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AwsMetrics {
    pub energy_consumption: Option<f64>,
    pub co2_emissions: Option<f64>,
    pub region: Option<String>,
    pub renewable_energy_pct: Option<f64>,
    pub ai_workload_pct: Option<f64>,
    pub pue: Option<f64>,
    pub timestamp: Option<RawTimestamp>,
}

/// Azure emissions report (energy in MWh)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AzureMetrics {
    pub energy_usage: Option<f64>,
    pub carbon_footprint: Option<f64>,
    pub location: Option<String>,
    pub renewable_percentage: Option<f64>,
    pub ai_workload_pct: Option<f64>,
    pub pue: Option<f64>,
    pub timestamp: Option<RawTimestamp>,
}

/// One row of the data center emissions database
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetRow {
    #[serde(rename = "Cloud Service Provider")]
    pub provider: Option<String>,
    #[serde(rename = "Location")]
    pub location: Option<String>,
    #[serde(rename = "Energy Consumption (MWh)")]
    pub energy_mwh: Option<f64>,
    #[serde(rename = "Total Emissions (kg CO₂e)")]
    pub emissions_kg: Option<f64>,
    #[serde(rename = "Renewable Energy Usage (%)")]
    pub renewable_pct: Option<f64>,
    #[serde(rename = "AI Workload (%)")]
    pub ai_workload_pct: Option<f64>,
    #[serde(rename = "PUE (Power Usage Effectiveness)")]
    pub pue: Option<f64>,
    #[serde(rename = "Timestamp", alias = "uploaded_at", alias = "observed_at")]
    pub timestamp: Option<RawTimestamp>,
}

/// Reading produced by the synthetic generator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticReading {
    pub location: String,
    pub observed_at: i64,
    pub energy_consumption_mwh: f64,
    pub total_emissions_kg: f64,
    pub renewable_usage_pct: f64,
    pub ai_workload_pct: f64,
    pub pue: f64,
}

/// Known payload shapes, one per source kind
#[derive(Debug, Clone, PartialEq)]
pub enum RawPayload {
    Gcp(GcpMetrics),
    Aws(AwsMetrics),
    Azure(AzureMetrics),
    Dataset(DatasetRow),
    Synthetic(SyntheticReading),
}

impl RawPayload {
    /// Parse a JSON payload into the shape expected for `kind`
    pub fn parse(kind: SourceKind, value: &serde_json::Value) -> Result<Self, NormalizationError> {
        fn shape<T: serde::de::DeserializeOwned>(
            value: &serde_json::Value,
        ) -> Result<T, NormalizationError> {
            T::deserialize(value).map_err(|e| {
                NormalizationError::new("payload", e, NormalizationReason::Malformed)
            })
        }

        Ok(match kind {
            SourceKind::Gcp => RawPayload::Gcp(shape(value)?),
            SourceKind::Aws => RawPayload::Aws(shape(value)?),
            SourceKind::Azure => RawPayload::Azure(shape(value)?),
            SourceKind::Dataset => RawPayload::Dataset(shape(value)?),
            SourceKind::Synthetic => RawPayload::Synthetic(shape(value)?),
        })
    }
}

/// Per-call context supplied by the collector
#[derive(Debug, Clone)]
pub struct NormalizeContext {
    /// Source identifier used as provider dimension when the payload has none
    pub source_id: String,
    /// Location configured for the source, used when the payload has none
    pub default_location: Option<String>,
    /// Fetch time, used when the payload carries no timestamp
    pub received_at: i64,
}

/// Normalize a raw JSON payload from a source of `kind`
pub fn normalize(
    raw: &serde_json::Value,
    kind: SourceKind,
    ctx: &NormalizeContext,
) -> Result<EmissionRecord, NormalizationError> {
    let payload = RawPayload::parse(kind, raw)?;
    normalize_payload(payload, ctx)
}

/// Normalize an already-parsed payload
pub fn normalize_payload(
    payload: RawPayload,
    ctx: &NormalizeContext,
) -> Result<EmissionRecord, NormalizationError> {
    let record = match payload {
        RawPayload::Gcp(p) => EmissionRecord {
            source_id: ctx.source_id.clone(),
            location: resolve_location(p.region, ctx)?,
            observed_at: resolve_timestamp(p.timestamp.as_ref(), ctx)?,
            energy_consumption_mwh: p.energy_kwh.unwrap_or(0.0) / 1000.0,
            total_emissions_kg: p.carbon_kg.unwrap_or(0.0),
            renewable_usage_pct: p.renewable_pct.unwrap_or(0.0),
            ai_workload_pct: p.ai_workload_pct.unwrap_or(0.0),
            pue: p.pue.ok_or_else(|| NormalizationError::missing("pue"))?,
        },
        RawPayload::Aws(p) => EmissionRecord {
            source_id: ctx.source_id.clone(),
            location: resolve_location(p.region, ctx)?,
            observed_at: resolve_timestamp(p.timestamp.as_ref(), ctx)?,
            energy_consumption_mwh: p.energy_consumption.unwrap_or(0.0),
            total_emissions_kg: p.co2_emissions.unwrap_or(0.0),
            renewable_usage_pct: p.renewable_energy_pct.unwrap_or(0.0),
            ai_workload_pct: p.ai_workload_pct.unwrap_or(0.0),
            pue: p.pue.ok_or_else(|| NormalizationError::missing("pue"))?,
        },
        RawPayload::Azure(p) => EmissionRecord {
            source_id: ctx.source_id.clone(),
            location: resolve_location(p.location, ctx)?,
            observed_at: resolve_timestamp(p.timestamp.as_ref(), ctx)?,
            energy_consumption_mwh: p.energy_usage.unwrap_or(0.0),
            total_emissions_kg: p.carbon_footprint.unwrap_or(0.0),
            renewable_usage_pct: p.renewable_percentage.unwrap_or(0.0),
            ai_workload_pct: p.ai_workload_pct.unwrap_or(0.0),
            pue: p.pue.ok_or_else(|| NormalizationError::missing("pue"))?,
        },
        RawPayload::Dataset(row) => EmissionRecord {
            source_id: non_empty(row.provider).unwrap_or_else(|| ctx.source_id.clone()),
            location: resolve_location(row.location, ctx)?,
            observed_at: resolve_timestamp(row.timestamp.as_ref(), ctx)?,
            energy_consumption_mwh: row.energy_mwh.unwrap_or(0.0),
            total_emissions_kg: row.emissions_kg.unwrap_or(0.0),
            renewable_usage_pct: row.renewable_pct.unwrap_or(0.0),
            ai_workload_pct: row.ai_workload_pct.unwrap_or(0.0),
            pue: row.pue.ok_or_else(|| NormalizationError::missing("pue"))?,
        },
        RawPayload::Synthetic(r) => EmissionRecord {
            source_id: ctx.source_id.clone(),
            location: r.location,
            observed_at: r.observed_at,
            energy_consumption_mwh: r.energy_consumption_mwh,
            total_emissions_kg: r.total_emissions_kg,
            renewable_usage_pct: r.renewable_usage_pct,
            ai_workload_pct: r.ai_workload_pct,
            pue: r.pue,
        },
    };

    validate_record(&record)?;
    Ok(record)
}

/// Check every declared range of an EmissionRecord
///
/// Also used by the aggregation engine to reject records that bypassed
/// normalization.
pub fn validate_record(record: &EmissionRecord) -> Result<(), NormalizationError> {
    if record.source_id.trim().is_empty() {
        return Err(NormalizationError::missing("source_id"));
    }
    if record.location.trim().is_empty() {
        return Err(NormalizationError::missing("location"));
    }
    if !(0..=MAX_OBSERVED_AT).contains(&record.observed_at) {
        return Err(NormalizationError::new(
            "observed_at",
            record.observed_at,
            NormalizationReason::InvalidTimestamp,
        ));
    }

    check_non_negative("energy_consumption_mwh", record.energy_consumption_mwh)?;
    check_non_negative("total_emissions_kg", record.total_emissions_kg)?;
    check_percentage("renewable_usage_pct", record.renewable_usage_pct)?;
    check_percentage("ai_workload_pct", record.ai_workload_pct)?;

    check_finite("pue", record.pue)?;
    if record.pue < 1.0 {
        return Err(NormalizationError::new("pue", record.pue, NormalizationReason::BelowMinimum));
    }

    Ok(())
}

fn check_finite(field: &str, value: f64) -> Result<(), NormalizationError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(NormalizationError::new(field, value, NormalizationReason::NotFinite))
    }
}

fn check_non_negative(field: &str, value: f64) -> Result<(), NormalizationError> {
    check_finite(field, value)?;
    if value < 0.0 {
        return Err(NormalizationError::new(field, value, NormalizationReason::Negative));
    }
    Ok(())
}

fn check_percentage(field: &str, value: f64) -> Result<(), NormalizationError> {
    check_finite(field, value)?;
    if !(0.0..=100.0).contains(&value) {
        return Err(NormalizationError::new(field, value, NormalizationReason::OutOfRange));
    }
    Ok(())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn resolve_location(
    location: Option<String>,
    ctx: &NormalizeContext,
) -> Result<String, NormalizationError> {
    non_empty(location)
        .or_else(|| non_empty(ctx.default_location.clone()))
        .ok_or_else(|| NormalizationError::missing("location"))
}

fn resolve_timestamp(
    timestamp: Option<&RawTimestamp>,
    ctx: &NormalizeContext,
) -> Result<i64, NormalizationError> {
    match timestamp {
        Some(ts) => ts.to_unix(),
        None => Ok(ctx.received_at),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(source_id: &str) -> NormalizeContext {
        NormalizeContext {
            source_id: source_id.to_string(),
            default_location: Some("us-central1".to_string()),
            received_at: 1_700_000_000,
        }
    }

    #[test]
    fn test_gcp_payload_converts_kwh() {
        let raw = json!({
            "energy_kwh": 2500.0,
            "carbon_kg": 840.0,
            "renewable_pct": 64.0,
            "pue": 1.1,
            "network_gb": 12.0
        });

        let record = normalize(&raw, SourceKind::Gcp, &ctx("GCP")).unwrap();
        assert_eq!(record.source_id, "GCP");
        assert_eq!(record.location, "us-central1"); // from context
        assert_eq!(record.observed_at, 1_700_000_000); // from context
        assert_eq!(record.energy_consumption_mwh, 2.5);
        assert_eq!(record.total_emissions_kg, 840.0);
        assert_eq!(record.ai_workload_pct, 0.0); // missing -> 0
    }

    #[test]
    fn test_aws_payload_with_rfc3339_timestamp() {
        let raw = json!({
            "energy_consumption": 3.0,
            "co2_emissions": 1200.0,
            "region": "eu-west-1",
            "pue": 1.3,
            "timestamp": "2024-01-01T00:00:00Z"
        });

        let record = normalize(&raw, SourceKind::Aws, &ctx("AWS")).unwrap();
        assert_eq!(record.location, "eu-west-1");
        assert_eq!(record.observed_at, 1_704_067_200);
    }

    #[test]
    fn test_dataset_row_uses_provider_column() {
        let raw = json!({
            "Cloud Service Provider": "Azure",
            "Location": "Dublin",
            "Energy Consumption (MWh)": 120.5,
            "Total Emissions (kg CO₂e)": 5400.0,
            "Renewable Energy Usage (%)": 72.0,
            "AI Workload (%)": 35.0,
            "PUE (Power Usage Effectiveness)": 1.4,
            "Timestamp": 1_690_000_000
        });

        let record = normalize(&raw, SourceKind::Dataset, &ctx("emissions-db")).unwrap();
        assert_eq!(record.source_id, "Azure");
        assert_eq!(record.location, "Dublin");
        assert_eq!(record.observed_at, 1_690_000_000);
        assert_eq!(record.ai_workload_pct, 35.0);
    }

    #[test]
    fn test_rejects_pue_below_one() {
        let raw = json!({ "energy_usage": 1.0, "carbon_footprint": 10.0, "location": "X", "pue": 0.9 });
        let err = normalize(&raw, SourceKind::Azure, &ctx("Azure")).unwrap_err();
        assert_eq!(err.field, "pue");
        assert_eq!(err.reason, NormalizationReason::BelowMinimum);
    }

    #[test]
    fn test_rejects_negative_energy() {
        let raw = json!({ "energy_consumption": -1.0, "co2_emissions": 10.0, "pue": 1.2 });
        let err = normalize(&raw, SourceKind::Aws, &ctx("AWS")).unwrap_err();
        assert_eq!(err.field, "energy_consumption_mwh");
        assert_eq!(err.reason, NormalizationReason::Negative);
        assert_eq!(err.value, "-1");
    }

    #[test]
    fn test_rejects_percentage_out_of_range() {
        let raw = json!({ "energy_kwh": 1.0, "carbon_kg": 1.0, "renewable_pct": 101.0, "pue": 1.2 });
        let err = normalize(&raw, SourceKind::Gcp, &ctx("GCP")).unwrap_err();
        assert_eq!(err.field, "renewable_usage_pct");
        assert_eq!(err.reason, NormalizationReason::OutOfRange);
    }

    #[test]
    fn test_missing_pue_is_an_error() {
        let raw = json!({ "energy_kwh": 1.0, "carbon_kg": 1.0 });
        let err = normalize(&raw, SourceKind::Gcp, &ctx("GCP")).unwrap_err();
        assert_eq!(err.field, "pue");
        assert_eq!(err.reason, NormalizationReason::Missing);
    }

    #[test]
    fn test_missing_location_without_default() {
        let mut context = ctx("AWS");
        context.default_location = None;
        let raw = json!({ "energy_consumption": 1.0, "co2_emissions": 1.0, "pue": 1.2 });
        let err = normalize(&raw, SourceKind::Aws, &context).unwrap_err();
        assert_eq!(err.field, "location");
    }

    #[test]
    fn test_wrong_shape_is_malformed() {
        let raw = json!({ "energy_kwh": "lots", "pue": 1.2 });
        let err = normalize(&raw, SourceKind::Gcp, &ctx("GCP")).unwrap_err();
        assert_eq!(err.reason, NormalizationReason::Malformed);

        let err = normalize(&json!([1, 2, 3]), SourceKind::Aws, &ctx("AWS")).unwrap_err();
        assert_eq!(err.reason, NormalizationReason::Malformed);
    }

    #[test]
    fn test_bad_timestamp_text() {
        let raw = json!({ "energy_kwh": 1.0, "carbon_kg": 1.0, "pue": 1.2, "timestamp": "yesterday" });
        let err = normalize(&raw, SourceKind::Gcp, &ctx("GCP")).unwrap_err();
        assert_eq!(err.field, "timestamp");
    }

    #[test]
    fn test_rejects_timestamp_beyond_year_9999() {
        let raw = json!({
            "energy_consumption": 3.0,
            "co2_emissions": 1200.0,
            "region": "eu-west-1",
            "pue": 1.3,
            "timestamp": i64::MAX
        });
        let err = normalize(&raw, SourceKind::Aws, &ctx("AWS")).unwrap_err();
        assert_eq!(err.field, "observed_at");
        assert_eq!(err.reason, NormalizationReason::InvalidTimestamp);

        let raw = json!({ "energy_consumption": 1.0, "pue": 1.3, "region": "x", "timestamp": -1 });
        let err = normalize(&raw, SourceKind::Aws, &ctx("AWS")).unwrap_err();
        assert_eq!(err.reason, NormalizationReason::InvalidTimestamp);

        let raw = json!({ "energy_consumption": 1.0, "pue": 1.3, "region": "x", "timestamp": MAX_OBSERVED_AT });
        assert!(normalize(&raw, SourceKind::Aws, &ctx("AWS")).is_ok());
    }

    #[test]
    fn test_validate_rejects_nan() {
        let record = EmissionRecord {
            source_id: "GCP".to_string(),
            location: "X".to_string(),
            observed_at: 0,
            energy_consumption_mwh: f64::NAN,
            total_emissions_kg: 0.0,
            renewable_usage_pct: 0.0,
            ai_workload_pct: 0.0,
            pue: 1.0,
        };
        let err = validate_record(&record).unwrap_err();
        assert_eq!(err.reason, NormalizationReason::NotFinite);
    }
}
