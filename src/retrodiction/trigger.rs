// =============================================================================
// Retrodiction Trigger — turn regime changes into prioritised snapshots
// =============================================================================
//
// Snapshot sources:
//   REGIME_CHANGE  — `handle_regime_change`; priority from the change itself:
//                      new regime is VOLATILITY_SHOCK / GEOPOLITICAL_CRISIS
//                        -> CRITICAL
//                      confidence > 0.8  -> HIGH
//                      otherwise         -> MEDIUM
//   SCHEDULED      — `check_schedule`, once per schedule interval, LOW
//   everything else — `trigger_snapshot` / `trigger_manual_snapshot`
//
// Dispatch (one background worker, same queue discipline as the event hub):
//   1. Pop the highest-priority, earliest-queued snapshot and stamp
//      `processing_start`.
//   2. Invoke every snapshot handler in registration order, failure-isolated.
//   3. Apply results staged through `record_results`, stamp `processing_end`,
//      mark processed, keep in history and persist via the sink.
//
// Thread-safety: one `parking_lot::Mutex`; handlers run without it, so a
// handler may queue further snapshots or record results.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::dispatch::{run_isolated, PriorityWorkQueue, StopSignal, Worker};
use crate::error::{ConfigError, TriggerError};
use crate::regime::RegimeChangeEvent;
use crate::retrodiction::snapshot::{RetrodictionSnapshot, SnapshotCause};
use crate::runtime_config::TriggerConfig;
use crate::sink::{persist_logged, RecordKind, RecordSink};
use crate::types::{Metadata, Priority, TimeRange};

/// Callback invoked once per dispatched snapshot.
pub type SnapshotHandler = Arc<dyn Fn(&RetrodictionSnapshot) -> anyhow::Result<()> + Send + Sync>;

/// Confidence above which a regime change gets HIGH priority.
const HIGH_CONFIDENCE: f64 = 0.8;

/// Counter snapshot for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerStats {
    pub enqueued: u64,
    pub dropped: u64,
    pub processed: u64,
    pub scheduled: u64,
    pub handler_failures: u64,
    pub sink_failures: u64,
    pub queue_len: usize,
}

/// Snapshot priority for a confirmed regime change.
pub fn regime_change_priority(change: &RegimeChangeEvent) -> Priority {
    if change.new_regime.is_shock() {
        Priority::Critical
    } else if change.confidence() > HIGH_CONFIDENCE {
        Priority::High
    } else {
        Priority::Medium
    }
}

// ---------------------------------------------------------------------------
// Internal mutable state (behind Mutex)
// ---------------------------------------------------------------------------

struct InFlight {
    id: String,
    staged_results: Option<Metadata>,
}

struct Inner {
    queue: PriorityWorkQueue<RetrodictionSnapshot>,
    handlers: Vec<(String, SnapshotHandler)>,
    in_flight: Option<InFlight>,
    history: HashMap<String, RetrodictionSnapshot>,
    history_order: VecDeque<String>,
    last_scheduled: DateTime<Utc>,
    enqueued: u64,
    processed: u64,
    scheduled: u64,
    handler_failures: u64,
    sink_failures: u64,
}

impl Inner {
    fn remember(&mut self, snapshot: RetrodictionSnapshot, limit: usize) {
        let id = snapshot.id.clone();
        if self.history.insert(id.clone(), snapshot).is_none() {
            self.history_order.push_back(id);
        }
        while self.history_order.len() > limit {
            if let Some(oldest) = self.history_order.pop_front() {
                self.history.remove(&oldest);
            }
        }
    }
}

// =============================================================================
// RetrodictionTrigger
// =============================================================================

pub struct RetrodictionTrigger {
    config: TriggerConfig,
    window: chrono::Duration,
    schedule_period: chrono::Duration,
    sink: Arc<dyn RecordSink>,
    inner: Mutex<Inner>,
    worker: Worker,
}

impl RetrodictionTrigger {
    /// Build a trigger. Invalid configuration is rejected here and never
    /// surfaces once the trigger is running.
    pub fn new(config: TriggerConfig, sink: Arc<dyn RecordSink>) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let window = config.default_window()?;
        let schedule_period = config.schedule_period()?;
        info!(
            queue_capacity = config.queue_capacity,
            window_days = config.default_window_days,
            scheduled = config.enable_scheduled,
            schedule_secs = config.schedule_interval_secs,
            "RetrodictionTrigger initialised"
        );
        Ok(Arc::new(Self {
            inner: Mutex::new(Inner {
                queue: PriorityWorkQueue::new(config.queue_capacity),
                handlers: Vec::new(),
                in_flight: None,
                history: HashMap::new(),
                history_order: VecDeque::new(),
                last_scheduled: Utc::now(),
                enqueued: 0,
                processed: 0,
                scheduled: 0,
                handler_failures: 0,
                sink_failures: 0,
            }),
            config,
            window,
            schedule_period,
            sink,
            worker: Worker::new("retrodiction-trigger"),
        }))
    }

    pub fn register_handler<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&RetrodictionSnapshot) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(handler = %name, "snapshot handler registered");
        self.inner.lock().handlers.push((name, Arc::new(handler)));
    }

    // -------------------------------------------------------------------------
    // Snapshot creation
    // -------------------------------------------------------------------------

    /// Queue a REGIME_CHANGE snapshot for `change` and flag the change as
    /// triggered. A change that was already triggered is ignored. Returns the
    /// snapshot id, or `None` if ignored or dropped by a full queue; a dropped
    /// snapshot clears the flag again so the change can be retried.
    pub fn handle_regime_change(&self, change: &Arc<RegimeChangeEvent>) -> Option<String> {
        if !change.mark_retrodiction_triggered() {
            debug!(change_id = %change.id, "regime change already triggered");
            return None;
        }

        let priority = regime_change_priority(change);
        let mut metadata = Metadata::new();
        metadata.insert(
            "oldRegime".into(),
            change.old_regime.map_or(serde_json::Value::Null, |r| r.as_str().into()),
        );
        metadata.insert("newRegime".into(), change.new_regime.as_str().into());
        metadata.insert("confidence".into(), change.confidence().into());

        let snapshot = RetrodictionSnapshot::new(
            SnapshotCause::RegimeChange,
            priority,
            Some(Arc::clone(change)),
            self.config.default_variables.clone(),
            self.default_window(),
            metadata,
        );
        info!(
            change_id = %change.id,
            new_regime = %change.new_regime,
            priority = %priority,
            "regime change retrodiction requested"
        );
        let queued = self.enqueue(snapshot);
        if queued.is_none() {
            change.clear_retrodiction_triggered();
            warn!(change_id = %change.id, "regime change snapshot dropped, change left untriggered");
        }
        queued
    }

    /// Queue a MANUAL snapshot. `time_range` defaults to the configured
    /// window ending now; empty `variables` fall back to the defaults.
    pub fn trigger_manual_snapshot(
        &self,
        variables: Vec<String>,
        time_range: Option<TimeRange>,
        priority: Priority,
        metadata: Metadata,
    ) -> Result<Option<String>, TriggerError> {
        self.trigger_snapshot(SnapshotCause::Manual, variables, time_range, priority, metadata)
    }

    /// Queue a snapshot for any cause except REGIME_CHANGE, which must go
    /// through [`handle_regime_change`](Self::handle_regime_change).
    pub fn trigger_snapshot(
        &self,
        cause: SnapshotCause,
        variables: Vec<String>,
        time_range: Option<TimeRange>,
        priority: Priority,
        metadata: Metadata,
    ) -> Result<Option<String>, TriggerError> {
        if cause == SnapshotCause::RegimeChange {
            return Err(TriggerError::InvalidCause(cause.to_string()));
        }
        let time_range = time_range.unwrap_or_else(|| self.default_window());
        if !time_range.is_valid() {
            return Err(TriggerError::InvalidTimeRange);
        }
        let variables = if variables.is_empty() {
            self.config.default_variables.clone()
        } else {
            variables
        };

        let snapshot = RetrodictionSnapshot::new(cause, priority, None, variables, time_range, metadata);
        Ok(self.enqueue(snapshot))
    }

    /// Queue a SCHEDULED snapshot if the schedule interval has elapsed since
    /// the last one. Returns its id when one was queued.
    pub fn check_schedule(&self) -> Option<String> {
        if !self.config.enable_scheduled {
            return None;
        }
        let now = Utc::now();
        {
            let mut inner = self.inner.lock();
            if now - inner.last_scheduled < self.schedule_period {
                return None;
            }
            inner.last_scheduled = now;
            inner.scheduled += 1;
        }

        debug!("scheduled retrodiction due");
        let snapshot = RetrodictionSnapshot::new(
            SnapshotCause::Scheduled,
            Priority::Low,
            None,
            self.config.default_variables.clone(),
            TimeRange::ending_at(now, self.window),
            Metadata::new(),
        );
        self.enqueue(snapshot)
    }

    fn default_window(&self) -> TimeRange {
        TimeRange::ending_at(Utc::now(), self.window)
    }

    fn enqueue(&self, snapshot: RetrodictionSnapshot) -> Option<String> {
        let id = snapshot.id.clone();
        let cause = snapshot.cause;
        let priority = snapshot.priority;
        let mut inner = self.inner.lock();
        if inner.queue.push(priority, snapshot) {
            inner.enqueued += 1;
            debug!(snapshot_id = %id, cause = %cause, priority = %priority, "snapshot queued");
            Some(id)
        } else {
            warn!(
                snapshot_id = %id,
                cause = %cause,
                dropped = inner.queue.dropped(),
                "snapshot queue full, dropping snapshot"
            );
            None
        }
    }

    // -------------------------------------------------------------------------
    // Results side channel
    // -------------------------------------------------------------------------

    /// Write results for a snapshot, exactly once. Results for the snapshot
    /// currently being handled are applied when it is marked processed;
    /// results for an already processed snapshot are stored and re-persisted.
    /// An empty map is rejected, so a non-empty `results` always marks the
    /// one recorded write.
    pub fn record_results(&self, snapshot_id: &str, results: Metadata) -> Result<(), TriggerError> {
        if results.is_empty() {
            return Err(TriggerError::EmptyResults(snapshot_id.to_string()));
        }
        let updated = {
            let mut inner = self.inner.lock();
            if let Some(in_flight) = inner.in_flight.as_mut().filter(|f| f.id == snapshot_id) {
                if in_flight.staged_results.is_some() {
                    return Err(TriggerError::ResultsAlreadyRecorded(snapshot_id.to_string()));
                }
                in_flight.staged_results = Some(results);
                debug!(snapshot_id, "results staged for in-flight snapshot");
                return Ok(());
            }

            let snapshot = inner
                .history
                .get_mut(snapshot_id)
                .ok_or_else(|| TriggerError::UnknownSnapshot(snapshot_id.to_string()))?;
            if !snapshot.results.is_empty() {
                return Err(TriggerError::ResultsAlreadyRecorded(snapshot_id.to_string()));
            }
            snapshot.results = results;
            snapshot.clone()
        };

        debug!(snapshot_id, "results recorded");
        if !persist_logged(self.sink.as_ref(), RecordKind::Snapshot, &updated.id, &updated) {
            self.inner.lock().sink_failures += 1;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------------

    /// Dispatch the next queued snapshot, if any. Returns whether one was
    /// processed.
    pub fn dispatch_next(&self) -> bool {
        let (mut snapshot, handlers) = {
            let mut inner = self.inner.lock();
            let Some(snapshot) = inner.queue.pop() else {
                return false;
            };
            inner.in_flight = Some(InFlight {
                id: snapshot.id.clone(),
                staged_results: None,
            });
            (snapshot, inner.handlers.clone())
        };

        snapshot.processing_start = Some(Utc::now());

        let mut failures = 0u64;
        for (name, handler) in &handlers {
            if !run_isolated(RecordKind::Snapshot.as_str(), &snapshot.id, name, || handler(&snapshot)) {
                failures += 1;
            }
        }

        let snapshot = {
            let mut inner = self.inner.lock();
            if let Some(results) = inner.in_flight.take().and_then(|f| f.staged_results) {
                snapshot.results = results;
            }
            snapshot.processed = true;
            snapshot.processing_end = Some(Utc::now());
            inner.processed += 1;
            inner.handler_failures += failures;
            inner.remember(snapshot.clone(), self.config.history_limit);
            snapshot
        };

        info!(
            snapshot_id = %snapshot.id,
            cause = %snapshot.cause,
            priority = %snapshot.priority,
            handlers = handlers.len(),
            failures,
            "snapshot processed"
        );

        if !persist_logged(self.sink.as_ref(), RecordKind::Snapshot, &snapshot.id, &snapshot) {
            self.inner.lock().sink_failures += 1;
        }
        true
    }

    async fn run(self: Arc<Self>, mut stop: StopSignal) {
        info!(poll_ms = self.config.poll_interval_ms, "snapshot dispatch loop started");
        while !stop.is_set() {
            self.check_schedule();
            if self.dispatch_next() {
                tokio::task::yield_now().await;
            } else {
                stop.sleep(self.config.poll_interval()).await;
            }
        }
        info!("snapshot dispatch loop exited");
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Start the dispatch loop. Returns `false` if it is already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let trigger = Arc::clone(self);
        self.worker.start(move |stop| trigger.run(stop))
    }

    pub async fn stop(&self) -> bool {
        self.worker.stop(self.config.stop_timeout()).await
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Processed snapshots, oldest first (bounded by `history_limit`).
    pub fn snapshot_history(&self) -> Vec<RetrodictionSnapshot> {
        let inner = self.inner.lock();
        inner
            .history_order
            .iter()
            .filter_map(|id| inner.history.get(id).cloned())
            .collect()
    }

    pub fn get_snapshot(&self, id: &str) -> Option<RetrodictionSnapshot> {
        self.inner.lock().history.get(id).cloned()
    }

    pub fn stats(&self) -> TriggerStats {
        let inner = self.inner.lock();
        TriggerStats {
            enqueued: inner.enqueued,
            dropped: inner.queue.dropped(),
            processed: inner.processed,
            scheduled: inner.scheduled,
            handler_failures: inner.handler_failures,
            sink_failures: inner.sink_failures,
            queue_len: inner.queue.len(),
        }
    }
}
