// =============================================================================
// Regime Sensor — event fusion, regime detection and retrodiction triggers
// =============================================================================
//
// Three stages composed in one direction:
//   EventHub -> RegimeDetector -> RetrodictionTrigger -> snapshot consumers
//
// Each stage owns one background worker and one state mutex, and can be used
// on its own with synthetic inputs.
// =============================================================================

pub mod dispatch;
pub mod error;
pub mod event_hub;
pub mod pipeline;
pub mod regime;
pub mod retrodiction;
pub mod runtime_config;
pub mod sink;
pub mod types;

pub use error::{ConfigError, SinkError, TriggerError};
pub use event_hub::{Event, EventHub, EventType, IngestOutcome};
pub use pipeline::RegimePipeline;
pub use regime::{Regime, RegimeChangeEvent, RegimeDetector};
pub use retrodiction::{RetrodictionSnapshot, RetrodictionTrigger, SnapshotCause};
pub use runtime_config::PipelineConfig;
pub use sink::{JsonLinesSink, MemorySink, NullSink, RecordKind, RecordSink};
pub use types::{Priority, TimeRange};
