// =============================================================================
// Record Sink — pluggable persistence boundary
// =============================================================================
//
// Every processed Event, RegimeChangeEvent and RetrodictionSnapshot is handed
// to a sink exactly once (snapshots again if results arrive later). Sink
// failures are logged by the caller and never roll back in-memory state.
//
// Implementations:
//   - NullSink       — discards everything.
//   - MemorySink     — keeps records in memory; used by tests and demos.
//   - JsonLinesSink  — appends `{id, kind, record}` lines to `<kind>.jsonl`.
// =============================================================================

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::SinkError;

/// Which record type is being persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Event,
    RegimeChange,
    Snapshot,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::RegimeChange => "regime_change",
            Self::Snapshot => "snapshot",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistence boundary shared by all pipeline stages.
pub trait RecordSink: Send + Sync {
    fn persist(
        &self,
        kind: RecordKind,
        id: &str,
        record: &serde_json::Value,
    ) -> Result<(), SinkError>;
}

/// Serialise `record` and hand it to `sink`, logging any failure.
/// Returns whether the record was persisted.
pub fn persist_logged<T: Serialize>(
    sink: &dyn RecordSink,
    kind: RecordKind,
    id: &str,
    record: &T,
) -> bool {
    let result = serde_json::to_value(record)
        .map_err(|source| SinkError::Serialize {
            kind: kind.as_str(),
            id: id.to_string(),
            source,
        })
        .and_then(|value| sink.persist(kind, id, &value));

    match result {
        Ok(()) => {
            debug!(kind = %kind, id, "record persisted");
            true
        }
        Err(e) => {
            error!(kind = %kind, id, error = %e, "sink failed to persist record");
            false
        }
    }
}

// =============================================================================
// NullSink
// =============================================================================

pub struct NullSink;

impl RecordSink for NullSink {
    fn persist(&self, _: RecordKind, _: &str, _: &serde_json::Value) -> Result<(), SinkError> {
        Ok(())
    }
}

// =============================================================================
// MemorySink
// =============================================================================

/// One record captured by [`MemorySink`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub kind: RecordKind,
    pub id: String,
    pub record: serde_json::Value,
}

#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<PersistedRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<PersistedRecord> {
        self.records.lock().clone()
    }

    pub fn records_of(&self, kind: RecordKind) -> Vec<PersistedRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect()
    }

    pub fn count(&self, kind: RecordKind) -> usize {
        self.records.lock().iter().filter(|r| r.kind == kind).count()
    }
}

impl RecordSink for MemorySink {
    fn persist(
        &self,
        kind: RecordKind,
        id: &str,
        record: &serde_json::Value,
    ) -> Result<(), SinkError> {
        self.records.lock().push(PersistedRecord {
            kind,
            id: id.to_string(),
            record: record.clone(),
        });
        Ok(())
    }
}

// =============================================================================
// JsonLinesSink
// =============================================================================

/// Appends one JSON object per line to `<dir>/<kind>.jsonl`.
pub struct JsonLinesSink {
    dir: PathBuf,
    // Serialises appends so lines from concurrent stages never interleave.
    write_lock: Mutex<()>,
}

impl JsonLinesSink {
    /// Create the sink, creating `dir` if needed.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, SinkError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path_for(&self, kind: RecordKind) -> PathBuf {
        self.dir.join(format!("{}.jsonl", kind.as_str()))
    }
}

impl RecordSink for JsonLinesSink {
    fn persist(
        &self,
        kind: RecordKind,
        id: &str,
        record: &serde_json::Value,
    ) -> Result<(), SinkError> {
        let line = PersistedRecord {
            kind,
            id: id.to_string(),
            record: record.clone(),
        };
        let mut encoded = serde_json::to_string(&line).map_err(|source| SinkError::Serialize {
            kind: kind.as_str(),
            id: id.to_string(),
            source,
        })?;
        encoded.push('\n');

        let _guard = self.write_lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(kind))?;
        file.write_all(encoded.as_bytes())?;
        Ok(())
    }
}

/// Rejects every record; shared by the component tests.
#[cfg(test)]
pub(crate) struct FailingSink;

#[cfg(test)]
impl RecordSink for FailingSink {
    fn persist(&self, _: RecordKind, _: &str, _: &serde_json::Value) -> Result<(), SinkError> {
        Err(SinkError::Unavailable("disk full".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn memory_sink_collects_by_kind() {
        let sink = MemorySink::new();
        sink.persist(RecordKind::Event, "e1", &json!({"a": 1})).unwrap();
        sink.persist(RecordKind::Snapshot, "s1", &json!({"b": 2})).unwrap();
        sink.persist(RecordKind::Event, "e2", &json!({"a": 3})).unwrap();

        assert_eq!(sink.count(RecordKind::Event), 2);
        assert_eq!(sink.count(RecordKind::RegimeChange), 0);
        let events = sink.records_of(RecordKind::Event);
        assert_eq!(events[1].id, "e2");
        assert_eq!(events[1].record["a"], 3);
    }

    #[test]
    fn persist_logged_reports_failure() {
        assert!(!persist_logged(&FailingSink, RecordKind::Event, "e1", &json!({})));
        assert!(persist_logged(&NullSink, RecordKind::Event, "e1", &json!({})));
    }

    #[test]
    fn json_lines_sink_appends_per_kind() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonLinesSink::new(dir.path().join("records")).unwrap();

        sink.persist(RecordKind::RegimeChange, "r1", &json!({"confidence": 0.9}))
            .unwrap();
        sink.persist(RecordKind::RegimeChange, "r2", &json!({"confidence": 0.8}))
            .unwrap();

        let content = std::fs::read_to_string(sink.path_for(RecordKind::RegimeChange)).unwrap();
        let lines: Vec<PersistedRecord> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].id, "r1");
        assert_eq!(lines[1].kind, RecordKind::RegimeChange);
        assert!(!sink.path_for(RecordKind::Event).exists());
    }
}
