// =============================================================================
// Error types
// =============================================================================
//
// Library-level failures that callers may want to match on. Callback and
// binary glue use `anyhow` instead.

use thiserror::Error;

/// Failure reported by a [`RecordSink`](crate::sink::RecordSink).
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialise {kind} record {id}: {source}")]
    Serialize {
        kind: &'static str,
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// Rejections from the retrodiction trigger's direct-call API.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TriggerError {
    #[error("unknown snapshot {0}")]
    UnknownSnapshot(String),

    #[error("results already recorded for snapshot {0}")]
    ResultsAlreadyRecorded(String),

    #[error("empty results for snapshot {0}")]
    EmptyResults(String),

    #[error("time range start is after end")]
    InvalidTimeRange,

    #[error("cause {0} cannot be triggered directly")]
    InvalidCause(String),
}

/// Invalid configuration, raised only while constructing or loading.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown {kind} tag: {tag}")]
    UnknownTag { kind: &'static str, tag: String },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}
