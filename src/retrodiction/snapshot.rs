// =============================================================================
// Retrodiction snapshots — units of re-evaluation work
// =============================================================================

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;
use crate::regime::RegimeChangeEvent;
use crate::types::{Metadata, Priority, TimeRange};

/// Why a snapshot was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnapshotCause {
    RegimeChange,
    Manual,
    Scheduled,
    ErrorThreshold,
    ConfidenceDrop,
    NewData,
    Anomaly,
}

impl SnapshotCause {
    pub const ALL: [SnapshotCause; 7] = [
        Self::RegimeChange,
        Self::Manual,
        Self::Scheduled,
        Self::ErrorThreshold,
        Self::ConfidenceDrop,
        Self::NewData,
        Self::Anomaly,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RegimeChange => "REGIME_CHANGE",
            Self::Manual => "MANUAL",
            Self::Scheduled => "SCHEDULED",
            Self::ErrorThreshold => "ERROR_THRESHOLD",
            Self::ConfidenceDrop => "CONFIDENCE_DROP",
            Self::NewData => "NEW_DATA",
            Self::Anomaly => "ANOMALY",
        }
    }
}

impl std::fmt::Display for SnapshotCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SnapshotCause {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == tag)
            .ok_or(ConfigError::UnknownTag {
                kind: "snapshot cause",
                tag,
            })
    }
}

/// Which variables to re-evaluate over which window, and why.
///
/// `regime_change` is present iff `cause` is REGIME_CHANGE. `results` stays
/// empty until the snapshot is processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrodictionSnapshot {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub cause: SnapshotCause,
    pub priority: Priority,
    pub regime_change: Option<Arc<RegimeChangeEvent>>,
    pub variables: Vec<String>,
    pub time_range: TimeRange,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub processed: bool,
    #[serde(default)]
    pub processing_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processing_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub results: Metadata,
}

impl RetrodictionSnapshot {
    pub(crate) fn new(
        cause: SnapshotCause,
        priority: Priority,
        regime_change: Option<Arc<RegimeChangeEvent>>,
        variables: Vec<String>,
        time_range: TimeRange,
        metadata: Metadata,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            cause,
            priority,
            regime_change,
            variables,
            time_range,
            metadata,
            processed: false,
            processing_start: None,
            processing_end: None,
            results: Metadata::new(),
        }
    }

    /// Wall time spent in handlers, once processed.
    pub fn processing_duration(&self) -> Option<chrono::Duration> {
        match (self.processing_start, self.processing_end) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}
