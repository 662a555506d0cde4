// =============================================================================
// Event Hub — filter, prioritise and dispatch incoming events
// =============================================================================
//
// Ingestion (`ingest`, `ingest_batch`):
//   1. Every registered filter must accept the event (filters are ANDed).
//   2. Accepted events are pushed onto a bounded priority queue.
//   3. A full queue drops the event and counts it; the caller never blocks
//      and never sees an error.
//
// Dispatch (one background worker):
//   1. Pop the highest-priority, earliest-submitted event.
//   2. Invoke the handlers for its type, then the CUSTOM catch-all handlers,
//      each in registration order and each failure-isolated.
//   3. Append a processing record, mark processed, persist via the sink and
//      keep it in the bounded history.
//
// Thread-safety: one `parking_lot::Mutex` guards all mutable hub state.
// Filters and handlers are cloned out and invoked without the lock held, so a
// handler may call back into the hub.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::dispatch::isolation::call_isolated;
use crate::dispatch::{run_isolated, PriorityWorkQueue, StopSignal, Worker};
use crate::event_hub::event::{Event, EventType};
use crate::runtime_config::EventHubConfig;
use crate::sink::{persist_logged, RecordKind, RecordSink};

/// Handler invoked for each dispatched event of a registered type.
pub type EventHandler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Predicate deciding whether an event is accepted at ingestion.
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// What happened to an event handed to [`EventHub::ingest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted,
    Filtered,
    Dropped,
}

/// Counter snapshot for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHubStats {
    pub received: u64,
    pub accepted: u64,
    pub filtered: u64,
    pub dropped: u64,
    pub processed: u64,
    pub handler_failures: u64,
    pub sink_failures: u64,
    pub queue_len: usize,
}

// ---------------------------------------------------------------------------
// Internal mutable state (behind Mutex)
// ---------------------------------------------------------------------------

struct Inner {
    queue: PriorityWorkQueue<Event>,
    handlers: HashMap<EventType, Vec<(String, EventHandler)>>,
    filters: Vec<(String, EventFilter)>,
    history: HashMap<String, Event>,
    history_order: VecDeque<String>,
    received: u64,
    accepted: u64,
    filtered: u64,
    processed: u64,
    handler_failures: u64,
    sink_failures: u64,
}

impl Inner {
    fn remember(&mut self, event: Event, limit: usize) {
        let id = event.id.clone();
        if self.history.insert(id.clone(), event).is_none() {
            self.history_order.push_back(id);
        }
        while self.history_order.len() > limit {
            if let Some(oldest) = self.history_order.pop_front() {
                self.history.remove(&oldest);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// EventHub
// ---------------------------------------------------------------------------

pub struct EventHub {
    config: EventHubConfig,
    sink: Arc<dyn RecordSink>,
    inner: Mutex<Inner>,
    worker: Worker,
}

impl EventHub {
    pub fn new(config: EventHubConfig, sink: Arc<dyn RecordSink>) -> Arc<Self> {
        info!(
            queue_capacity = config.queue_capacity,
            history_limit = config.history_limit,
            "EventHub initialised"
        );
        Arc::new(Self {
            inner: Mutex::new(Inner {
                queue: PriorityWorkQueue::new(config.queue_capacity),
                handlers: HashMap::new(),
                filters: Vec::new(),
                history: HashMap::new(),
                history_order: VecDeque::new(),
                received: 0,
                accepted: 0,
                filtered: 0,
                processed: 0,
                handler_failures: 0,
                sink_failures: 0,
            }),
            config,
            sink,
            worker: Worker::new("event-hub"),
        })
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    /// Append a handler for `event_type`. Handlers registered for
    /// [`EventType::Custom`] receive every event.
    pub fn register_handler<F>(&self, event_type: EventType, name: impl Into<String>, handler: F)
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(event_type = %event_type, handler = %name, "event handler registered");
        self.inner
            .lock()
            .handlers
            .entry(event_type)
            .or_default()
            .push((name, Arc::new(handler)));
    }

    /// Add a named ingestion predicate. All predicates must pass.
    pub fn add_filter<F>(&self, name: impl Into<String>, predicate: F)
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(filter = %name, "event filter added");
        self.inner.lock().filters.push((name, Arc::new(predicate)));
    }

    /// Remove every filter registered under `name`. Returns whether any was
    /// removed.
    pub fn remove_filter(&self, name: &str) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.filters.len();
        inner.filters.retain(|(n, _)| n != name);
        inner.filters.len() != before
    }

    pub fn filter_names(&self) -> Vec<String> {
        self.inner.lock().filters.iter().map(|(n, _)| n.clone()).collect()
    }

    // -------------------------------------------------------------------------
    // Ingestion
    // -------------------------------------------------------------------------

    /// Filter and enqueue one event. Never blocks and never fails; the
    /// outcome is informational.
    pub fn ingest(&self, event: Event) -> IngestOutcome {
        let filters: Vec<(String, EventFilter)> = {
            let mut inner = self.inner.lock();
            inner.received += 1;
            inner.filters.clone()
        };

        for (name, filter) in &filters {
            let accepted = match call_isolated(|| Ok(filter(&event))) {
                Ok(accepted) => accepted,
                Err(failure) => {
                    warn!(event_id = %event.id, filter = %name, error = %failure, "filter failed, rejecting event");
                    false
                }
            };
            if !accepted {
                debug!(event_id = %event.id, filter = %name, "event filtered out");
                self.inner.lock().filtered += 1;
                return IngestOutcome::Filtered;
            }
        }

        let mut inner = self.inner.lock();
        let id = event.id.clone();
        let priority = event.priority;
        if inner.queue.push(priority, event) {
            inner.accepted += 1;
            debug!(event_id = %id, priority = %priority, "event queued");
            IngestOutcome::Accepted
        } else {
            warn!(
                event_id = %id,
                dropped = inner.queue.dropped(),
                "event queue full, dropping event"
            );
            IngestOutcome::Dropped
        }
    }

    /// Ingest events in order. Returns how many were accepted.
    pub fn ingest_batch(&self, events: impl IntoIterator<Item = Event>) -> usize {
        events
            .into_iter()
            .map(|e| self.ingest(e))
            .filter(|o| *o == IngestOutcome::Accepted)
            .count()
    }

    // -------------------------------------------------------------------------
    // Dispatch
    // -------------------------------------------------------------------------

    /// Dispatch the next queued event, if any. Returns whether one was
    /// processed. Called by the worker loop; also usable directly.
    pub fn dispatch_next(&self) -> bool {
        let (mut event, handlers) = {
            let mut inner = self.inner.lock();
            let Some(event) = inner.queue.pop() else {
                return false;
            };
            let mut handlers: Vec<(String, EventHandler)> = inner
                .handlers
                .get(&event.event_type)
                .cloned()
                .unwrap_or_default();
            if event.event_type != EventType::Custom {
                if let Some(catch_all) = inner.handlers.get(&EventType::Custom) {
                    handlers.extend(catch_all.iter().cloned());
                }
            }
            (event, handlers)
        };

        let mut completed = Vec::with_capacity(handlers.len());
        let mut failures = 0u64;
        for (name, handler) in &handlers {
            if run_isolated(RecordKind::Event.as_str(), &event.id, name, || handler(&event)) {
                completed.push(name.clone());
            } else {
                failures += 1;
            }
        }

        event.mark_processed(completed);
        let persisted = persist_logged(self.sink.as_ref(), RecordKind::Event, &event.id, &event);

        debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            handlers = handlers.len(),
            failures,
            "event dispatched"
        );

        let mut inner = self.inner.lock();
        inner.processed += 1;
        inner.handler_failures += failures;
        if !persisted {
            inner.sink_failures += 1;
        }
        inner.remember(event, self.config.history_limit);
        true
    }

    async fn run(self: Arc<Self>, mut stop: StopSignal) {
        info!(poll_ms = self.config.poll_interval_ms, "event dispatch loop started");
        while !stop.is_set() {
            if self.dispatch_next() {
                tokio::task::yield_now().await;
            } else {
                stop.sleep(self.config.poll_interval()).await;
            }
        }
        info!("event dispatch loop exited");
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Start the dispatch loop. Returns `false` if it is already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let hub = Arc::clone(self);
        self.worker.start(move |stop| hub.run(stop))
    }

    /// Stop the dispatch loop, waiting at most the configured stop timeout.
    /// Returns `false` if it was not running.
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

    /// A processed event still held in history.
    pub fn get_event(&self, id: &str) -> Option<Event> {
        self.inner.lock().history.get(id).cloned()
    }

    /// The `count` most recently processed events, oldest first.
    pub fn recent_events(&self, count: usize) -> Vec<Event> {
        let inner = self.inner.lock();
        let start = inner.history_order.len().saturating_sub(count);
        inner
            .history_order
            .iter()
            .skip(start)
            .filter_map(|id| inner.history.get(id).cloned())
            .collect()
    }

    pub fn stats(&self) -> EventHubStats {
        let inner = self.inner.lock();
        EventHubStats {
            received: inner.received,
            accepted: inner.accepted,
            filtered: inner.filtered,
            dropped: inner.queue.dropped(),
            processed: inner.processed,
            handler_failures: inner.handler_failures,
            sink_failures: inner.sink_failures,
            queue_len: inner.queue.len(),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{FailingSink, MemorySink, NullSink};
    use crate::types::Priority;
    use std::time::Duration;

    fn hub_with(config: EventHubConfig) -> Arc<EventHub> {
        EventHub::new(config, Arc::new(NullSink))
    }

    fn hub() -> Arc<EventHub> {
        hub_with(EventHubConfig {
            poll_interval_ms: 5,
            ..EventHubConfig::default()
        })
    }

    fn recorder(hub: &EventHub, event_type: EventType, name: &str) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        hub.register_handler(event_type, name, move |e: &Event| {
            sink.lock().push(e.id.clone());
            Ok(())
        });
        seen
    }

    fn drain(hub: &EventHub) {
        while hub.dispatch_next() {}
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[test]
    fn dispatch_follows_priority_then_submission_order() {
        let hub = hub();
        let seen = recorder(&hub, EventType::Custom, "all");

        let input = [
            ("a", Priority::Low),
            ("b", Priority::Medium),
            ("c", Priority::Critical),
            ("d", Priority::Medium),
            ("e", Priority::High),
            ("f", Priority::Critical),
            ("g", Priority::Low),
        ];
        for (id, p) in input {
            hub.ingest(Event::new("t", EventType::News, id).with_id(id).with_priority(p));
        }
        drain(&hub);

        assert_eq!(*seen.lock(), vec!["c", "f", "e", "b", "d", "a", "g"]);
    }

    #[test]
    fn filters_are_conjunctive() {
        let hub = hub();
        hub.add_filter("has_source", |e: &Event| !e.source.is_empty());
        hub.add_filter("not_low", |e: &Event| e.priority > Priority::Low);

        let ok = Event::new("feed", EventType::News, "x").with_priority(Priority::High);
        let no_source = Event::new("", EventType::News, "x").with_priority(Priority::High);
        let low = Event::new("feed", EventType::News, "x").with_priority(Priority::Low);

        assert_eq!(hub.ingest(ok), IngestOutcome::Accepted);
        assert_eq!(hub.ingest(no_source), IngestOutcome::Filtered);
        assert_eq!(hub.ingest(low), IngestOutcome::Filtered);

        let stats = hub.stats();
        assert_eq!(stats.received, 3);
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.filtered, 2);
    }

    #[test]
    fn always_false_filter_rejects_everything() {
        let hub = hub();
        hub.add_filter("deny", |_: &Event| false);
        let accepted = hub.ingest_batch((0..10).map(|i| {
            Event::new("feed", EventType::News, format!("n{i}")).with_priority(Priority::Critical)
        }));
        assert_eq!(accepted, 0);
        assert_eq!(hub.queue_len(), 0);

        assert!(hub.remove_filter("deny"));
        assert!(!hub.remove_filter("deny"));
        assert_eq!(
            hub.ingest(Event::new("feed", EventType::News, "n")),
            IngestOutcome::Accepted
        );
    }

    #[test]
    fn panicking_filter_rejects() {
        let hub = hub();
        hub.add_filter("broken", |_: &Event| panic!("filter bug"));
        assert_eq!(
            hub.ingest(Event::new("feed", EventType::News, "n")),
            IngestOutcome::Filtered
        );
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let hub = hub_with(EventHubConfig {
            queue_capacity: 2,
            ..EventHubConfig::default()
        });
        let outcomes: Vec<IngestOutcome> = (0..4)
            .map(|i| hub.ingest(Event::new("feed", EventType::News, format!("{i}"))))
            .collect();

        assert_eq!(
            outcomes,
            vec![
                IngestOutcome::Accepted,
                IngestOutcome::Accepted,
                IngestOutcome::Dropped,
                IngestOutcome::Dropped
            ]
        );
        assert_eq!(hub.stats().dropped, 2);
        assert_eq!(hub.queue_len(), 2);
    }

    #[test]
    fn type_handlers_run_before_catch_all_in_registration_order() {
        let hub = hub();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (event_type, name) in [
            (EventType::Custom, "catch_all"),
            (EventType::News, "news_1"),
            (EventType::MarketMovement, "market"),
            (EventType::News, "news_2"),
        ] {
            let order = order.clone();
            hub.register_handler(event_type, name, move |_: &Event| {
                order.lock().push(name);
                Ok(())
            });
        }

        hub.ingest(Event::new("feed", EventType::News, "n").with_id("n1"));
        drain(&hub);

        assert_eq!(*order.lock(), vec!["news_1", "news_2", "catch_all"]);
        let processed = hub.get_event("n1").unwrap();
        assert!(processed.processed);
        assert_eq!(
            processed.processing_history[0].handler_names,
            vec!["news_1", "news_2", "catch_all"]
        );
    }

    #[test]
    fn custom_events_reach_catch_all_once() {
        let hub = hub();
        let seen = recorder(&hub, EventType::Custom, "all");
        hub.ingest(Event::new("feed", EventType::Custom, "c").with_id("c1"));
        drain(&hub);
        assert_eq!(*seen.lock(), vec!["c1"]);
    }

    #[test]
    fn handler_failures_are_isolated() {
        let hub = hub();
        hub.register_handler(EventType::News, "errors", |_: &Event| anyhow::bail!("bad"));
        hub.register_handler(EventType::News, "panics", |_: &Event| panic!("worse"));
        let seen = recorder(&hub, EventType::News, "healthy");

        hub.ingest(Event::new("feed", EventType::News, "1").with_id("e1"));
        hub.ingest(Event::new("feed", EventType::News, "2").with_id("e2"));
        drain(&hub);

        assert_eq!(*seen.lock(), vec!["e1", "e2"]);
        let stats = hub.stats();
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.handler_failures, 4);

        let event = hub.get_event("e1").unwrap();
        assert!(event.processed);
        assert_eq!(event.processing_history[0].handler_names, vec!["healthy"]);
    }

    #[test]
    fn processed_events_are_persisted_and_history_is_bounded() {
        let sink = Arc::new(MemorySink::new());
        let hub = EventHub::new(
            EventHubConfig {
                history_limit: 3,
                ..EventHubConfig::default()
            },
            sink.clone(),
        );

        for i in 0..5 {
            hub.ingest(Event::new("feed", EventType::News, "n").with_id(format!("e{i}")));
        }
        drain(&hub);

        assert_eq!(sink.count(RecordKind::Event), 5);
        assert!(sink.records()[0].record["processed"].as_bool().unwrap());
        assert!(hub.get_event("e0").is_none());
        let recent: Vec<String> = hub.recent_events(10).into_iter().map(|e| e.id).collect();
        assert_eq!(recent, vec!["e2", "e3", "e4"]);
    }

    #[test]
    fn failing_sink_does_not_stall_dispatch() {
        let hub = EventHub::new(EventHubConfig::default(), Arc::new(FailingSink));
        let seen = recorder(&hub, EventType::Custom, "all");

        hub.ingest(Event::new("feed", EventType::News, "1").with_id("e1"));
        hub.ingest(Event::new("feed", EventType::News, "2").with_id("e2"));
        drain(&hub);

        assert_eq!(*seen.lock(), vec!["e1", "e2"]);
        for id in ["e1", "e2"] {
            assert!(hub.get_event(id).unwrap().processed);
        }
        let stats = hub.stats();
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.sink_failures, 2);
        assert_eq!(stats.handler_failures, 0);
    }

    #[test]
    fn handler_may_reenter_hub() {
        let hub = hub();
        let weak = Arc::downgrade(&hub);
        hub.register_handler(EventType::News, "echo", move |e: &Event| {
            if let Some(hub) = weak.upgrade() {
                if e.id == "first" {
                    hub.ingest(Event::new("echo", EventType::Regulatory, "follow-up").with_id("second"));
                }
            }
            Ok(())
        });
        let seen = recorder(&hub, EventType::Regulatory, "reg");

        hub.ingest(Event::new("feed", EventType::News, "n").with_id("first"));
        drain(&hub);
        assert_eq!(*seen.lock(), vec!["second"]);
    }

    #[tokio::test]
    async fn worker_dispatches_critical_news_before_low_market_move() {
        let hub = hub();
        let seen = recorder(&hub, EventType::Custom, "all");

        // Queue both before the loop starts so ordering is decided by priority.
        hub.ingest(
            Event::new("wire", EventType::News, "Central bank emergency cut")
                .with_id("news")
                .with_priority(Priority::Critical),
        );
        hub.ingest(
            Event::new("ticker", EventType::MarketMovement, "SPX +0.1%")
                .with_id("move")
                .with_priority(Priority::Low),
        );

        assert!(hub.start());
        wait_for(|| seen.lock().len() == 2).await;
        assert!(hub.stop().await);

        assert_eq!(*seen.lock(), vec!["news", "move"]);
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let hub = hub();
        assert!(!hub.stop().await);
        assert!(hub.start());
        assert!(!hub.start());
        assert!(hub.is_running());

        let seen = recorder(&hub, EventType::Custom, "all");
        hub.ingest(Event::new("feed", EventType::News, "n").with_id("live"));
        wait_for(|| seen.lock().len() == 1).await;

        let started = std::time::Instant::now();
        assert!(hub.stop().await);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!hub.is_running());
        assert!(!hub.stop().await);
    }
}
