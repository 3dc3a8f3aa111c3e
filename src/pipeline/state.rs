//! Per-bucket running state
//!
//! Lifecycle per key: absent -> active -> retired. A `BucketState` exists only
//! while the bucket is active; the engine drops it on retirement.

use super::types::{AggregateBucket, BucketKey, EmissionRecord, RecordKey};
use std::collections::HashSet;

/// Running aggregate plus the record keys already folded into it
#[derive(Debug, Clone)]
pub struct BucketState {
    bucket: AggregateBucket,

    /// Keys contributed so far; `bucket.count == applied.len()` always holds
    applied: HashSet<RecordKey>,
}

impl BucketState {
    pub fn new(key: BucketKey, now: i64) -> Self {
        Self {
            bucket: AggregateBucket::empty(key, now),
            applied: HashSet::new(),
        }
    }

    /// Fold a record into the running sums
    ///
    /// Returns false (and leaves the state untouched) when the record key was
    /// already applied to this bucket.
    pub fn apply(&mut self, record: &EmissionRecord, key: &RecordKey, now: i64) -> bool {
        if self.applied.contains(key) {
            return false;
        }
        self.applied.insert(key.clone());
        self.bucket.accumulate(record, now);
        true
    }

    pub fn contains(&self, key: &RecordKey) -> bool {
        self.applied.contains(key)
    }

    pub fn bucket(&self) -> &AggregateBucket {
        &self.bucket
    }

    pub fn into_bucket(self) -> AggregateBucket {
        self.bucket
    }

    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{Dimension, TimeWindow, WindowSize};

    fn make_record(observed_at: i64, emissions: f64) -> EmissionRecord {
        EmissionRecord {
            source_id: "A".to_string(),
            location: "X".to_string(),
            observed_at,
            energy_consumption_mwh: 1.0,
            total_emissions_kg: emissions,
            renewable_usage_pct: 40.0,
            ai_workload_pct: 5.0,
            pue: 1.5,
        }
    }

    fn make_state() -> BucketState {
        let key = BucketKey::new(
            Dimension::Provider,
            "A",
            TimeWindow::containing(WindowSize::Hour1, 0),
        );
        BucketState::new(key, 0)
    }

    #[test]
    fn test_apply_is_idempotent_per_key() {
        let mut state = make_state();
        let record = make_record(10, 100.0);
        let key = record.key();

        assert!(state.apply(&record, &key, 1));
        let after_first = state.bucket().clone();

        assert!(!state.apply(&record, &key, 2));
        assert_eq!(state.bucket(), &after_first);
        assert_eq!(state.bucket().count, 1);
        assert_eq!(state.applied_count(), 1);
    }

    #[test]
    fn test_count_matches_distinct_keys() {
        let mut state = make_state();
        for ts in [10, 20, 10, 30, 20] {
            let record = make_record(ts, 1.0);
            let key = record.key();
            state.apply(&record, &key, ts);
        }
        assert_eq!(state.bucket().count, 3);
        assert_eq!(state.applied_count(), 3);
        assert!(state.contains(&make_record(30, 1.0).key()));
    }
}
