//! Declarative threshold rules evaluated against current aggregates
//!
//! Evaluation is edge-triggered per (rule, dimension value, window size): an
//! `AlertEvent` is produced only when the rule goes from not-triggered to
//! triggered. It re-arms once the metric is back on the untriggered side of
//! the threshold. Equality counts as triggered.

use super::error::ConfigurationError;
use super::types::{AggregateBucket, AlertEvent, AlertLevel, BucketKey, Dimension, WindowSize};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Bucket metric a rule observes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertMetric {
    TotalEmissionsKg,
    MeanEmissionsKg,
    MaxEmissionsKg,
    TotalEnergyMwh,
    MeanRenewablePct,
    MeanPue,
    MeanAiWorkloadPct,
    EmissionsPerMwh,
    RecordCount,
}

impl AlertMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertMetric::TotalEmissionsKg => "total_emissions_kg",
            AlertMetric::MeanEmissionsKg => "mean_emissions_kg",
            AlertMetric::MaxEmissionsKg => "max_emissions_kg",
            AlertMetric::TotalEnergyMwh => "total_energy_mwh",
            AlertMetric::MeanRenewablePct => "mean_renewable_pct",
            AlertMetric::MeanPue => "mean_pue",
            AlertMetric::MeanAiWorkloadPct => "mean_ai_workload_pct",
            AlertMetric::EmissionsPerMwh => "emissions_per_mwh",
            AlertMetric::RecordCount => "record_count",
        }
    }

    /// Metric value for a bucket; None when undefined (empty bucket, zero energy)
    pub fn value(&self, bucket: &AggregateBucket) -> Option<f64> {
        if bucket.count == 0 {
            return None;
        }
        match self {
            AlertMetric::TotalEmissionsKg => Some(bucket.sum_emissions),
            AlertMetric::MeanEmissionsKg => bucket.mean_emissions(),
            AlertMetric::MaxEmissionsKg => Some(bucket.max_emissions),
            AlertMetric::TotalEnergyMwh => Some(bucket.sum_energy),
            AlertMetric::MeanRenewablePct => bucket.mean_renewable_pct(),
            AlertMetric::MeanPue => bucket.mean_pue(),
            AlertMetric::MeanAiWorkloadPct => bucket.mean_ai_workload_pct(),
            AlertMetric::EmissionsPerMwh => bucket.emissions_per_mwh(),
            AlertMetric::RecordCount => Some(bucket.count as f64),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    /// Triggered when `value >= threshold`
    Above,
    /// Triggered when `value <= threshold`
    Below,
}

impl Comparator {
    pub fn check(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Above => value >= threshold,
            Self::Below => value <= threshold,
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            Self::Above => ">=",
            Self::Below => "<=",
        }
    }
}

/// `{metric, comparator, threshold, level}` plus an optional bucket scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub metric: AlertMetric,
    pub comparator: Comparator,
    pub threshold: f64,
    pub level: AlertLevel,
    /// Restrict to one dimension; all dimensions when unset
    #[serde(default)]
    pub dimension: Option<Dimension>,
    /// Restrict to one window size; all sizes when unset
    #[serde(default)]
    pub window: Option<WindowSize>,
    #[serde(default)]
    pub message: Option<String>,
}

impl AlertRule {
    pub fn new(
        id: impl Into<String>,
        metric: AlertMetric,
        comparator: Comparator,
        threshold: f64,
        level: AlertLevel,
    ) -> Self {
        Self {
            id: id.into(),
            metric,
            comparator,
            threshold,
            level,
            dimension: None,
            window: None,
            message: None,
        }
    }

    pub fn for_dimension(mut self, dimension: Dimension) -> Self {
        self.dimension = Some(dimension);
        self
    }

    pub fn over_window(mut self, window: WindowSize) -> Self {
        self.window = Some(window);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn applies_to(&self, key: &BucketKey) -> bool {
        self.dimension.map_or(true, |d| d == key.dimension)
            && self.window.map_or(true, |w| w == key.window.size)
    }
}

/// Built-in rules mirroring the dashboard alert checks
pub fn default_rules(critical_emissions_kg: f64) -> Vec<AlertRule> {
    vec![
        AlertRule::new(
            "high-emissions",
            AlertMetric::MeanEmissionsKg,
            Comparator::Above,
            critical_emissions_kg,
            AlertLevel::Critical,
        )
        .for_dimension(Dimension::Location)
        .with_message("High emissions detected"),
        AlertRule::new(
            "low-renewable",
            AlertMetric::MeanRenewablePct,
            Comparator::Below,
            30.0,
            AlertLevel::Warning,
        )
        .for_dimension(Dimension::Location)
        .with_message("Low renewable energy usage"),
        AlertRule::new(
            "high-pue",
            AlertMetric::MeanPue,
            Comparator::Above,
            1.8,
            AlertLevel::Info,
        )
        .for_dimension(Dimension::Location)
        .with_message("Suboptimal PUE"),
    ]
}

/// Load rules from a JSON array file
pub fn load_rules(path: impl AsRef<Path>) -> Result<Vec<AlertRule>, ConfigurationError> {
    let path = path.as_ref();
    let invalid = |reason: String| ConfigurationError::Invalid {
        key: "ALERT_RULES_PATH".to_string(),
        value: path.display().to_string(),
        reason,
    };

    let content = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
    let rules: Vec<AlertRule> = serde_json::from_str(&content).map_err(|e| invalid(e.to_string()))?;

    for rule in &rules {
        if !rule.threshold.is_finite() {
            return Err(invalid(format!("rule `{}` has a non-finite threshold", rule.id)));
        }
    }
    Ok(rules)
}

type TriggerKey = (String, Dimension, String, WindowSize);

/// Edge-triggered rule evaluator
pub struct AlertEvaluator {
    triggered: HashMap<TriggerKey, bool>,
    now_fn: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl AlertEvaluator {
    pub fn new() -> Self {
        Self::new_with_timestamp_fn(Box::new(|| chrono::Utc::now().timestamp()))
    }

    pub fn new_with_timestamp_fn(now_fn: Box<dyn Fn() -> i64 + Send + Sync>) -> Self {
        Self {
            triggered: HashMap::new(),
            now_fn,
        }
    }

    /// Evaluate `rules` against the current aggregates
    ///
    /// For each rule, dimension value and window size only the most recent
    /// window is considered; each window size keeps its own trigger state. Values whose metric is undefined leave
    /// the trigger state untouched.
    pub fn evaluate(&mut self, rules: &[AlertRule], aggregates: &[AggregateBucket]) -> Vec<AlertEvent> {
        let raised_at = (self.now_fn)();
        let mut events = Vec::new();

        for rule in rules {
            let mut current: HashMap<(Dimension, &str, WindowSize), &AggregateBucket> = HashMap::new();
            for bucket in aggregates.iter().filter(|b| rule.applies_to(&b.key)) {
                let slot = current
                    .entry((bucket.key.dimension, bucket.key.value.as_str(), bucket.key.window.size))
                    .or_insert(bucket);
                if bucket.key.window.start > slot.key.window.start {
                    *slot = bucket;
                }
            }

            let mut ordered: Vec<&AggregateBucket> = current.into_values().collect();
            ordered.sort_by(|a, b| a.key.cmp(&b.key));

            for bucket in ordered {
                let Some(value) = rule.metric.value(bucket) else {
                    continue;
                };

                let now_triggered = rule.comparator.check(value, rule.threshold);
                let trigger_key = (
                    rule.id.clone(),
                    bucket.key.dimension,
                    bucket.key.value.clone(),
                    bucket.key.window.size,
                );
                let was_triggered = self.triggered.insert(trigger_key, now_triggered).unwrap_or(false);

                if now_triggered && !was_triggered {
                    let event = build_event(rule, bucket, value, raised_at);
                    log::info!(
                        "🚨 [{}] {} ({}={})",
                        event.level.as_str(),
                        event.message,
                        bucket.key.dimension,
                        bucket.key.value
                    );
                    events.push(event);
                }
            }
        }

        events
    }

    /// Number of (rule, dimension value, window size) entries currently triggered
    pub fn triggered_count(&self) -> usize {
        self.triggered.values().filter(|t| **t).count()
    }

    pub fn reset(&mut self) {
        self.triggered.clear();
    }
}

impl Default for AlertEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn build_event(rule: &AlertRule, bucket: &AggregateBucket, value: f64, raised_at: i64) -> AlertEvent {
    let message = match &rule.message {
        Some(m) => format!("{} in {}", m, bucket.key.value),
        None => format!("{} {} {}", rule.metric.as_str(), rule.comparator.symbol(), rule.threshold),
    };
    let details = format!(
        "{} {}={} window={}@{}: {}={:.2} (threshold {} {})",
        rule.id,
        bucket.key.dimension,
        bucket.key.value,
        bucket.key.window.size.as_str(),
        bucket.key.window.start,
        rule.metric.as_str(),
        value,
        rule.comparator.symbol(),
        rule.threshold
    );

    AlertEvent {
        rule_id: rule.id.clone(),
        level: rule.level,
        message,
        details,
        raised_at,
        bucket: bucket.key.clone(),
        observed_value: value,
    }
}
