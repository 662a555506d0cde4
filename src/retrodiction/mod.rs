// =============================================================================
// Retrodiction Module
// =============================================================================
//
// Converts regime changes, schedules and manual requests into prioritised
// snapshots and hands them to registered consumers.

pub mod snapshot;
pub mod trigger;

pub use snapshot::{RetrodictionSnapshot, SnapshotCause};
pub use trigger::{regime_change_priority, RetrodictionTrigger, SnapshotHandler, TriggerStats};
