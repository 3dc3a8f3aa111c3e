//! Time window sizes and retention arithmetic
//!
//! Windows are tumbling and aligned to the unix epoch: a record at `t`
//! belongs to `[t - t mod d, t - t mod d + d)` for each size `d`.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WindowSize {
    #[serde(rename = "15m")]
    Min15,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "1d")]
    Day1,
    #[serde(rename = "7d")]
    Week1,
}

impl WindowSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowSize::Min15 => "15m",
            WindowSize::Hour1 => "1h",
            WindowSize::Day1 => "1d",
            WindowSize::Week1 => "7d",
        }
    }

    pub fn duration_secs(&self) -> i64 {
        match self {
            WindowSize::Min15 => 15 * 60,
            WindowSize::Hour1 => 60 * 60,
            WindowSize::Day1 => 24 * 60 * 60,
            WindowSize::Week1 => 7 * 24 * 60 * 60,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "15m" => Some(WindowSize::Min15),
            "1h" => Some(WindowSize::Hour1),
            "1d" => Some(WindowSize::Day1),
            "7d" => Some(WindowSize::Week1),
            _ => None,
        }
    }

    pub fn all() -> [WindowSize; 4] {
        [
            WindowSize::Min15,
            WindowSize::Hour1,
            WindowSize::Day1,
            WindowSize::Week1,
        ]
    }

    /// Start of the window containing `timestamp`
    ///
    /// Uses euclidean remainder so pre-epoch timestamps align downwards.
    pub fn align(&self, timestamp: i64) -> i64 {
        timestamp - timestamp.rem_euclid(self.duration_secs())
    }
}

impl fmt::Display for WindowSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retention policy: a window retires once `window_end + grace_secs <= now`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub grace_secs: i64,
}

impl RetentionPolicy {
    pub fn new(grace_secs: i64) -> Self {
        Self {
            grace_secs: grace_secs.max(0),
        }
    }

    pub fn is_retired(&self, window_end: i64, now: i64) -> bool {
        window_end.saturating_add(self.grace_secs) <= now
    }
}

/// Parse a comma-separated list like "1h,1d" (unknown entries are skipped)
pub fn parse_window_list(s: &str) -> Vec<WindowSize> {
    let mut sizes: Vec<WindowSize> = s.split(',').filter_map(WindowSize::parse).collect();
    sizes.sort();
    sizes.dedup();
    sizes
}
