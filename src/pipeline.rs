// =============================================================================
// Regime Pipeline — wires hub -> detector -> trigger
// =============================================================================
//
// Data flows one way through handler registration only:
//   EventHub (catch-all handler) -> RegimeDetector::process_event
//                                  (+ update_market_data for numeric metadata
//                                   of MARKET_MOVEMENT / ECONOMIC_INDICATOR)
//   RegimeDetector (change handler) -> RetrodictionTrigger::handle_regime_change
//
// External consumers register snapshot handlers on the trigger.
// =============================================================================

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::ConfigError;
use crate::event_hub::{Event, EventHub, EventType, IngestOutcome};
use crate::regime::{install_default_methods, RegimeChangeEvent, RegimeDetector};
use crate::retrodiction::RetrodictionTrigger;
use crate::runtime_config::PipelineConfig;
use crate::sink::RecordSink;

pub struct RegimePipeline {
    config: PipelineConfig,
    hub: Arc<EventHub>,
    detector: Arc<RegimeDetector>,
    trigger: Arc<RetrodictionTrigger>,
}

impl RegimePipeline {
    /// Build and wire all three stages. All stages share `sink`.
    pub fn new(config: PipelineConfig, sink: Arc<dyn RecordSink>) -> Result<Self, ConfigError> {
        config.validate()?;

        let hub = EventHub::new(config.event_hub.clone(), Arc::clone(&sink));
        let detector = RegimeDetector::new(config.detector.clone(), Arc::clone(&sink));
        let trigger = RetrodictionTrigger::new(config.trigger.clone(), sink)?;

        install_default_methods(&detector, &config.strategies);

        let forward_metrics = config.forward_event_metrics;
        let target = Arc::clone(&detector);
        hub.register_handler(EventType::Custom, "regime-detector", move |event: &Event| {
            forward_event(&target, event, forward_metrics);
            Ok(())
        });

        let target = Arc::clone(&trigger);
        detector.register_change_handler("retrodiction-trigger", move |change: &Arc<RegimeChangeEvent>| {
            target.handle_regime_change(change);
            Ok(())
        });

        info!(forward_metrics, "regime pipeline wired");
        Ok(Self {
            config,
            hub,
            detector,
            trigger,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    pub fn detector(&self) -> &Arc<RegimeDetector> {
        &self.detector
    }

    pub fn trigger(&self) -> &Arc<RetrodictionTrigger> {
        &self.trigger
    }

    pub fn ingest(&self, event: Event) -> IngestOutcome {
        self.hub.ingest(event)
    }

    /// Start every stage's worker. Returns `true` if at least one was
    /// started.
    pub fn start(&self) -> bool {
        let trigger = self.trigger.start();
        let detector = self.detector.start();
        let hub = self.hub.start();
        info!(hub, detector, trigger, "regime pipeline started");
        hub || detector || trigger
    }

    /// Stop every stage, producers first. Each stop is bounded by that
    /// stage's own timeout.
    pub async fn stop(&self) {
        let hub = self.hub.stop().await;
        let detector = self.detector.stop().await;
        let trigger = self.trigger.stop().await;
        info!(hub, detector, trigger, "regime pipeline stopped");
    }

    pub fn is_running(&self) -> bool {
        self.hub.is_running() || self.detector.is_running() || self.trigger.is_running()
    }
}

fn forward_event(detector: &RegimeDetector, event: &Event, forward_metrics: bool) {
    let metrics: Vec<(String, f64)> = if forward_metrics
        && matches!(event.event_type, EventType::MarketMovement | EventType::EconomicIndicator)
    {
        event
            .numeric_metadata()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    } else {
        Vec::new()
    };

    detector.process_event(event.clone());
    if !metrics.is_empty() {
        debug!(event_id = %event.id, readings = metrics.len(), "forwarding event metrics");
        detector.update_market_data(metrics);
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::regime::strategies::{self, VOLATILITY_SPIKE};
    use crate::regime::{DetectionContext, Regime};
    use crate::retrodiction::{RetrodictionSnapshot, SnapshotCause};
    use crate::runtime_config::{DetectorConfig, EventHubConfig, StrategyParams, TriggerConfig};
    use crate::sink::{MemorySink, NullSink, RecordKind};
    use crate::types::Priority;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn fast_config() -> PipelineConfig {
        PipelineConfig {
            event_hub: EventHubConfig {
                poll_interval_ms: 5,
                ..EventHubConfig::default()
            },
            trigger: TriggerConfig {
                poll_interval_ms: 5,
                enable_scheduled: false,
                ..TriggerConfig::default()
            },
            ..PipelineConfig::default()
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..300 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    /// Each stage driven by hand, in the order events would flow.
    #[test]
    fn stage_by_stage_scenario() {
        // Hub: CRITICAL NEWS submitted before LOW MARKET_MOVEMENT.
        let hub = EventHub::new(EventHubConfig::default(), Arc::new(NullSink));
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = order.clone();
        hub.register_handler(EventType::Custom, "order", move |e: &Event| {
            seen.lock().push(e.event_type);
            Ok(())
        });
        hub.ingest(Event::new("wire", EventType::News, "headline").with_priority(Priority::Critical));
        hub.ingest(Event::new("tape", EventType::MarketMovement, "tick").with_priority(Priority::Low));
        while hub.dispatch_next() {}
        assert_eq!(*order.lock(), vec![EventType::News, EventType::MarketMovement]);

        // Detector: only the volatility method, min confidence 0.7.
        let detector = RegimeDetector::new(DetectorConfig::default(), Arc::new(NullSink));
        let params = StrategyParams::default();
        detector.register_detection_method(VOLATILITY_SPIKE, move |ctx: &DetectionContext<'_>| {
            Ok(strategies::volatility_spike(ctx, &params))
        });
        let changes = Arc::new(Mutex::new(Vec::new()));
        let collected = changes.clone();
        detector.register_change_handler("collect", move |c: &Arc<RegimeChangeEvent>| {
            collected.lock().push(Arc::clone(c));
            Ok(())
        });
        detector.update_market_data([("volatility", 35.0)]);
        let changes = changes.lock().clone();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].new_regime, Regime::VolatilityShock);

        // Trigger: one CRITICAL regime-change snapshot.
        let trigger = RetrodictionTrigger::new(
            TriggerConfig {
                enable_scheduled: false,
                ..TriggerConfig::default()
            },
            Arc::new(NullSink),
        )
        .unwrap();
        trigger.handle_regime_change(&changes[0]).unwrap();
        assert_eq!(trigger.queue_len(), 1);
        while trigger.dispatch_next() {}

        let history = trigger.snapshot_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].cause, SnapshotCause::RegimeChange);
        assert_eq!(history[0].priority, Priority::Critical);
        assert!(changes[0].retrodiction_triggered());
    }

    #[tokio::test]
    async fn market_event_flows_to_snapshot() {
        let sink = Arc::new(MemorySink::new());
        let pipeline = RegimePipeline::new(fast_config(), sink.clone()).unwrap();

        let snapshots = Arc::new(Mutex::new(Vec::<RetrodictionSnapshot>::new()));
        let seen = snapshots.clone();
        pipeline.trigger().register_handler("engine", move |s: &RetrodictionSnapshot| {
            seen.lock().push(s.clone());
            Ok(())
        });

        assert!(pipeline.start());
        assert!(!pipeline.start());

        let outcome = pipeline.ingest(
            Event::new("tape", EventType::MarketMovement, "VIX spikes")
                .with_priority(Priority::High)
                .with_metadata("volatility", 45.0)
                .with_metadata("venue", "CBOE"),
        );
        assert_eq!(outcome, IngestOutcome::Accepted);

        wait_for(|| !snapshots.lock().is_empty()).await;
        pipeline.stop().await;
        assert!(!pipeline.is_running());

        let snapshot = snapshots.lock()[0].clone();
        assert_eq!(snapshot.cause, SnapshotCause::RegimeChange);
        assert_eq!(snapshot.priority, Priority::Critical);
        let change = snapshot.regime_change.unwrap();
        assert_eq!(change.new_regime, Regime::VolatilityShock);
        assert!(change.retrodiction_triggered());
        assert_eq!(change.supporting_evidence.len(), 1);
        assert_eq!(pipeline.detector().latest_market_data()["volatility"], 45.0);

        assert_eq!(sink.count(RecordKind::Event), 1);
        assert_eq!(sink.count(RecordKind::RegimeChange), 1);
        wait_for(|| sink.count(RecordKind::Snapshot) == 1).await;
    }

    #[test]
    fn metrics_forwarding_can_be_disabled() {
        let config = PipelineConfig {
            forward_event_metrics: false,
            ..PipelineConfig::default()
        };
        let pipeline = RegimePipeline::new(config, Arc::new(NullSink)).unwrap();
        pipeline.ingest(
            Event::new("tape", EventType::MarketMovement, "VIX spikes").with_metadata("volatility", 45.0),
        );
        while pipeline.hub().dispatch_next() {}

        assert_eq!(pipeline.detector().buffered_events().len(), 1);
        assert!(pipeline.detector().latest_market_data().is_empty());
        assert_eq!(pipeline.detector().current_regime(), Regime::Expansion);
    }

    #[test]
    fn news_events_do_not_forward_metrics() {
        let pipeline = RegimePipeline::new(PipelineConfig::default(), Arc::new(NullSink)).unwrap();
        pipeline.ingest(Event::new("wire", EventType::News, "calm day").with_metadata("volatility", 80.0));
        while pipeline.hub().dispatch_next() {}
        assert!(pipeline.detector().latest_market_data().is_empty());
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let mut config = PipelineConfig::default();
        config.detector.buffer_size = 0;
        assert!(RegimePipeline::new(config, Arc::new(NullSink)).is_err());

        let mut config = PipelineConfig::default();
        config.trigger.schedule_interval_secs = u64::MAX;
        assert!(RegimePipeline::new(config, Arc::new(NullSink)).is_err());
    }
}
