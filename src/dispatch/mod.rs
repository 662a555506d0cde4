// =============================================================================
// Dispatch Module
// =============================================================================
//
// Building blocks shared by every pipeline stage:
// - Bounded priority queue with FIFO tie-break inside a priority class
// - Single background worker lifecycle (idempotent start, bounded stop)
// - Failure-isolated callback invocation

pub mod isolation;
pub mod queue;
pub mod worker;

pub use isolation::run_isolated;
pub use queue::PriorityWorkQueue;
pub use worker::{StopSignal, Worker};
