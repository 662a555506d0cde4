// =============================================================================
// Shared value types used across the regime-sensor pipeline
// =============================================================================

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Open key/value map carried by events and snapshots.
pub type Metadata = HashMap<String, serde_json::Value>;

/// Named numeric readings (market data, regime indicators).
pub type Indicators = HashMap<String, f64>;

/// Work priority shared by events and retrodiction snapshots.
///
/// Variant order is the ordinal order, so `Ord` sorts LOW < CRITICAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Ordinal value 0–3.
    pub fn ordinal(self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl FromStr for Priority {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOW" => Ok(Self::Low),
            "MEDIUM" => Ok(Self::Medium),
            "HIGH" => Ok(Self::High),
            "CRITICAL" => Ok(Self::Critical),
            other => Err(ConfigError::UnknownTag {
                kind: "priority",
                tag: other.to_string(),
            }),
        }
    }
}

/// Closed time interval `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Window of length `window` ending at `end`. The start saturates at the
    /// earliest representable date.
    pub fn ending_at(end: DateTime<Utc>, window: Duration) -> Self {
        Self {
            start: end.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC),
            end,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.start <= self.end
    }
}

/// Clamp a confidence score into `[0, 1]`. NaN maps to 0.
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_by_ordinal() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        assert_eq!(Priority::Low.ordinal(), 0);
        assert_eq!(Priority::Critical.ordinal(), 3);
    }

    #[test]
    fn priority_serialises_as_screaming_tag() {
        let json = serde_json::to_string(&Priority::Critical).unwrap();
        assert_eq!(json, "\"CRITICAL\"");
        let back: Priority = serde_json::from_str("\"LOW\"").unwrap();
        assert_eq!(back, Priority::Low);
    }

    #[test]
    fn priority_from_str_rejects_unknown() {
        assert_eq!("high".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn clamp_confidence_bounds() {
        assert_eq!(clamp_confidence(1.7), 1.0);
        assert_eq!(clamp_confidence(-0.3), 0.0);
        assert_eq!(clamp_confidence(0.42), 0.42);
        assert_eq!(clamp_confidence(f64::NAN), 0.0);
        assert_eq!(clamp_confidence(f64::INFINITY), 1.0);
    }

    #[test]
    fn time_range_window() {
        let end = Utc::now();
        let range = TimeRange::ending_at(end, Duration::days(365));
        assert!(range.is_valid());
        assert_eq!(range.end - range.start, Duration::days(365));
        assert!(!TimeRange::new(end, end - Duration::seconds(1)).is_valid());
    }

    #[test]
    fn time_range_start_saturates_instead_of_overflowing() {
        let end = Utc::now();
        let range = TimeRange::ending_at(end, Duration::days(200_000_000));
        assert_eq!(range.start, DateTime::<Utc>::MIN_UTC);
        assert_eq!(range.end, end);
        assert!(range.is_valid());
    }
}
