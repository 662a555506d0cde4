// =============================================================================
// Regime Detector
// =============================================================================
//
// Single-state machine over `current_regime` (initially EXPANSION unless
// configured otherwise). Every input (a buffered event or a market-data
// update) re-runs all registered detection methods:
//
//   1. Each method sees the rolling event buffer, the latest market data and
//      the current regime, and optionally proposes a candidate.
//   2. The candidate with the highest confidence wins; exact ties go to the
//      method registered first. A method that errors or panics counts as
//      "no candidate" for that evaluation.
//   3. The winner becomes a transition only if its confidence is at least
//      `min_confidence` and it names a regime other than the current one.
//
// On transition: build a RegimeChangeEvent, update the state and history,
// persist via the sink, then invoke every change handler (failure-isolated,
// never rolling the state back).
//
// Thread-safety: one `parking_lot::Mutex` guards all mutable state. Methods
// run on a snapshot of the buffer and handlers run with the lock released, so
// either may call back into the detector.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::dispatch::isolation::call_isolated;
use crate::dispatch::{run_isolated, StopSignal, Worker};
use crate::event_hub::{Event, EventType};
use crate::regime::types::{Regime, RegimeCandidate, RegimeChangeEvent};
use crate::runtime_config::DetectorConfig;
use crate::sink::{persist_logged, RecordKind, RecordSink};
use crate::types::Indicators;

// =============================================================================
// Types
// =============================================================================

/// Read-only view handed to detection methods.
pub struct DetectionContext<'a> {
    /// Buffered events, oldest first.
    pub events: &'a [Arc<Event>],
    /// Latest value per market-data key.
    pub market_data: &'a Indicators,
    pub current_regime: Regime,
}

impl<'a> DetectionContext<'a> {
    pub fn new(events: &'a [Arc<Event>], market_data: &'a Indicators, current_regime: Regime) -> Self {
        Self {
            events,
            market_data,
            current_regime,
        }
    }

    /// A finite market reading, if present.
    pub fn market(&self, key: &str) -> Option<f64> {
        self.market_data.get(key).copied().filter(|v| v.is_finite())
    }

    /// The `count` most recent events of `event_type`, oldest first.
    pub fn latest_of(&self, event_type: EventType, count: usize) -> Vec<Arc<Event>> {
        let mut latest: Vec<Arc<Event>> = self
            .events
            .iter()
            .rev()
            .filter(|e| e.event_type == event_type)
            .take(count)
            .cloned()
            .collect();
        latest.reverse();
        latest
    }
}

/// A detection method: inspect the context, optionally propose a regime.
pub type DetectionFn =
    Arc<dyn Fn(&DetectionContext<'_>) -> anyhow::Result<Option<RegimeCandidate>> + Send + Sync>;

/// Callback invoked once per confirmed regime change.
pub type ChangeHandler = Arc<dyn Fn(&Arc<RegimeChangeEvent>) -> anyhow::Result<()> + Send + Sync>;

/// Counter snapshot for monitoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeDetectorStats {
    pub current_regime: Regime,
    pub evaluations: u64,
    pub strategy_failures: u64,
    pub transitions: u64,
    pub handler_failures: u64,
    pub sink_failures: u64,
    pub buffered_events: usize,
}

// ---------------------------------------------------------------------------
// Internal mutable state (behind Mutex)
// ---------------------------------------------------------------------------

struct Inner {
    current_regime: Regime,
    buffer: VecDeque<Arc<Event>>,
    market_data: Indicators,
    methods: Vec<(String, DetectionFn)>,
    change_handlers: Vec<(String, ChangeHandler)>,
    history: VecDeque<Arc<RegimeChangeEvent>>,
    evaluations: u64,
    strategy_failures: u64,
    transitions: u64,
    handler_failures: u64,
    sink_failures: u64,
}

// =============================================================================
// RegimeDetector
// =============================================================================

pub struct RegimeDetector {
    config: DetectorConfig,
    sink: Arc<dyn RecordSink>,
    inner: Mutex<Inner>,
    worker: Worker,
}

impl RegimeDetector {
    pub fn new(config: DetectorConfig, sink: Arc<dyn RecordSink>) -> Arc<Self> {
        info!(
            initial_regime = %config.initial_regime,
            min_confidence = config.min_confidence,
            buffer_size = config.buffer_size,
            "RegimeDetector initialised"
        );
        Arc::new(Self {
            inner: Mutex::new(Inner {
                current_regime: config.initial_regime,
                buffer: VecDeque::with_capacity(config.buffer_size),
                market_data: Indicators::new(),
                methods: Vec::new(),
                change_handlers: Vec::new(),
                history: VecDeque::new(),
                evaluations: 0,
                strategy_failures: 0,
                transitions: 0,
                handler_failures: 0,
                sink_failures: 0,
            }),
            config,
            sink,
            worker: Worker::new("regime-detector"),
        })
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    /// Register a detection method under `name`. Re-registering a name
    /// replaces the method but keeps its original position in the tie-break
    /// order.
    pub fn register_detection_method<F>(&self, name: impl Into<String>, method: F)
    where
        F: Fn(&DetectionContext<'_>) -> anyhow::Result<Option<RegimeCandidate>> + Send + Sync + 'static,
    {
        let name = name.into();
        let method: DetectionFn = Arc::new(method);
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.methods.iter_mut().find(|(n, _)| *n == name) {
            debug!(method = %name, "detection method replaced");
            slot.1 = method;
        } else {
            debug!(method = %name, "detection method registered");
            inner.methods.push((name, method));
        }
    }

    /// Remove a detection method. Returns whether it existed.
    pub fn unregister_detection_method(&self, name: &str) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.methods.len();
        inner.methods.retain(|(n, _)| n != name);
        inner.methods.len() != before
    }

    /// Method names in registration (tie-break) order.
    pub fn method_names(&self) -> Vec<String> {
        self.inner.lock().methods.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn register_change_handler<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&Arc<RegimeChangeEvent>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(handler = %name, "regime change handler registered");
        self.inner.lock().change_handlers.push((name, Arc::new(handler)));
    }

    // -------------------------------------------------------------------------
    // Inputs
    // -------------------------------------------------------------------------

    /// Buffer one event and re-run detection.
    pub fn process_event(&self, event: Event) -> Option<Arc<RegimeChangeEvent>> {
        self.buffer_events(std::iter::once(event));
        self.evaluate()
    }

    /// Buffer several events, then re-run detection once.
    pub fn process_events_batch(&self, events: impl IntoIterator<Item = Event>) -> Option<Arc<RegimeChangeEvent>> {
        self.buffer_events(events);
        self.evaluate()
    }

    /// Merge readings into the latest market data (last write wins per key)
    /// and re-run detection.
    pub fn update_market_data<I, K>(&self, values: I) -> Option<Arc<RegimeChangeEvent>>
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        {
            let mut inner = self.inner.lock();
            for (key, value) in values {
                inner.market_data.insert(key.into(), value);
            }
        }
        self.evaluate()
    }

    fn buffer_events(&self, events: impl IntoIterator<Item = Event>) {
        let mut inner = self.inner.lock();
        for event in events {
            inner.buffer.push_back(Arc::new(event));
            while inner.buffer.len() > self.config.buffer_size {
                inner.buffer.pop_front();
            }
        }
    }

    // -------------------------------------------------------------------------
    // Evaluation
    // -------------------------------------------------------------------------

    /// Run every detection method once and apply the winning candidate.
    /// Returns the change, if one was confirmed.
    pub fn evaluate(&self) -> Option<Arc<RegimeChangeEvent>> {
        let (events, market_data, current, methods) = {
            let mut inner = self.inner.lock();
            inner.evaluations += 1;
            (
                inner.buffer.iter().cloned().collect::<Vec<_>>(),
                inner.market_data.clone(),
                inner.current_regime,
                inner.methods.clone(),
            )
        };

        let ctx = DetectionContext::new(&events, &market_data, current);
        let (winner, failures) = select_candidate(&methods, &ctx);

        let (change, handlers) = {
            let mut inner = self.inner.lock();
            inner.strategy_failures += failures;

            let (method, candidate) = winner?;
            if candidate.confidence() < self.config.min_confidence {
                trace!(
                    method = %method,
                    regime = %candidate.regime,
                    confidence = candidate.confidence(),
                    "candidate below min confidence"
                );
                return None;
            }
            if candidate.regime == inner.current_regime {
                trace!(regime = %candidate.regime, "candidate matches current regime");
                return None;
            }

            let change = Arc::new(RegimeChangeEvent::new(
                Some(inner.current_regime),
                candidate.regime,
                candidate.confidence(),
                candidate.supporting_evidence,
                candidate.indicators,
            ));
            inner.current_regime = change.new_regime;
            inner.transitions += 1;
            inner.history.push_back(Arc::clone(&change));
            while inner.history.len() > self.config.history_limit {
                inner.history.pop_front();
            }

            info!(
                change_id = %change.id,
                method = %method,
                old_regime = ?change.old_regime,
                new_regime = %change.new_regime,
                confidence = change.confidence(),
                "Regime change detected"
            );
            (change, inner.change_handlers.clone())
        };

        let persisted = persist_logged(self.sink.as_ref(), RecordKind::RegimeChange, &change.id, change.as_ref());

        let mut handler_failures = 0u64;
        for (name, handler) in &handlers {
            if !run_isolated(RecordKind::RegimeChange.as_str(), &change.id, name, || handler(&change)) {
                handler_failures += 1;
            }
        }

        if handler_failures > 0 || !persisted {
            let mut inner = self.inner.lock();
            inner.handler_failures += handler_failures;
            if !persisted {
                inner.sink_failures += 1;
            }
        }

        Some(change)
    }

    async fn run(self: Arc<Self>, mut stop: StopSignal) {
        info!(
            interval_secs = self.config.evaluation_interval_secs,
            "regime re-evaluation loop started"
        );
        loop {
            stop.sleep(self.config.evaluation_interval()).await;
            if stop.is_set() {
                break;
            }
            self.evaluate();
        }
        info!("regime re-evaluation loop exited");
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Start periodic re-evaluation. Returns `false` if already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let detector = Arc::clone(self);
        self.worker.start(move |stop| detector.run(stop))
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

    pub fn current_regime(&self) -> Regime {
        self.inner.lock().current_regime
    }

    /// Confirmed changes, oldest first (bounded by `history_limit`).
    pub fn change_history(&self) -> Vec<Arc<RegimeChangeEvent>> {
        self.inner.lock().history.iter().cloned().collect()
    }

    pub fn latest_market_data(&self) -> Indicators {
        self.inner.lock().market_data.clone()
    }

    pub fn buffered_events(&self) -> Vec<Arc<Event>> {
        self.inner.lock().buffer.iter().cloned().collect()
    }

    pub fn stats(&self) -> RegimeDetectorStats {
        let inner = self.inner.lock();
        RegimeDetectorStats {
            current_regime: inner.current_regime,
            evaluations: inner.evaluations,
            strategy_failures: inner.strategy_failures,
            transitions: inner.transitions,
            handler_failures: inner.handler_failures,
            sink_failures: inner.sink_failures,
            buffered_events: inner.buffer.len(),
        }
    }
}

/// Run all methods in registration order and pick the winner: strictly
/// higher confidence replaces the current best, so ties keep the earlier
/// method. Returns the winner and the number of failed methods.
fn select_candidate(
    methods: &[(String, DetectionFn)],
    ctx: &DetectionContext<'_>,
) -> (Option<(String, RegimeCandidate)>, u64) {
    let mut best: Option<(String, RegimeCandidate)> = None;
    let mut failures = 0u64;

    for (name, method) in methods {
        match call_isolated(|| method(ctx)) {
            Ok(Some(candidate)) => {
                trace!(
                    method = %name,
                    regime = %candidate.regime,
                    confidence = candidate.confidence(),
                    "candidate proposed"
                );
                let better = best
                    .as_ref()
                    .map_or(true, |(_, b)| candidate.confidence() > b.confidence());
                if better {
                    best = Some((name.clone(), candidate));
                }
            }
            Ok(None) => {}
            Err(failure) => {
                failures += 1;
                warn!(method = %name, error = %failure, "detection method failed");
            }
        }
    }

    (best, failures)
}
