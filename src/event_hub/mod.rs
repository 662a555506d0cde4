// =============================================================================
// Event Hub Module
// =============================================================================
//
// Entry stage of the pipeline: typed, prioritised events from external feeds
// are filtered, queued by priority and dispatched to type-matched handlers by
// a single background worker.

pub mod event;
pub mod hub;

pub use event::{Event, EventType, ProcessingRecord};
pub use hub::{EventFilter, EventHandler, EventHub, EventHubStats, IngestOutcome};
