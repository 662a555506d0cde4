// =============================================================================
// Regime Sensor — Main Entry Point
// =============================================================================
//
// Runs the full pipeline against a short synthetic feed. Records land as JSON
// lines under the data directory; snapshots are logged by a stand-in consumer
// that also writes placeholder results back through the side channel.
// =============================================================================

use std::sync::{Arc, Weak};

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use regime_sensor::retrodiction::RetrodictionSnapshot;
use regime_sensor::types::Metadata;
use regime_sensor::{
    Event, EventType, JsonLinesSink, PipelineConfig, Priority, RegimePipeline, RetrodictionTrigger,
};

const DEFAULT_CONFIG_PATH: &str = "pipeline_config.json";
const DEFAULT_DATA_DIR: &str = "data";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Regime Sensor — Starting Up                       ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("REGIME_SENSOR_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let config = PipelineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, path = %config_path, "Failed to load config, using defaults");
        PipelineConfig::default()
    });

    // ── 2. Sink & pipeline ───────────────────────────────────────────────
    let data_dir =
        std::env::var("REGIME_SENSOR_DATA_DIR").unwrap_or_else(|_| DEFAULT_DATA_DIR.into());
    let sink = Arc::new(JsonLinesSink::new(&data_dir)?);
    info!(dir = %data_dir, "Persisting records as JSON lines");

    let pipeline = RegimePipeline::new(config, sink)?;

    // ── 3. Snapshot consumer ─────────────────────────────────────────────
    let trigger: Weak<RetrodictionTrigger> = Arc::downgrade(pipeline.trigger());
    pipeline
        .trigger()
        .register_handler("log-consumer", move |snapshot: &RetrodictionSnapshot| {
            info!(
                snapshot_id = %snapshot.id,
                cause = %snapshot.cause,
                priority = %snapshot.priority,
                variables = ?snapshot.variables,
                start = %snapshot.time_range.start,
                end = %snapshot.time_range.end,
                "retrodiction snapshot received"
            );
            if let Some(trigger) = trigger.upgrade() {
                let mut results = Metadata::new();
                results.insert("consumer".into(), "log-consumer".into());
                results.insert("variables".into(), snapshot.variables.len().into());
                trigger.record_results(&snapshot.id, results)?;
            }
            Ok(())
        });

    pipeline.start();

    // ── 4. Synthetic feed ────────────────────────────────────────────────
    let feed = vec![
        Event::new("newswire", EventType::News, "Central bank holds rates steady")
            .with_entities(["FED"]),
        Event::new("macro-feed", EventType::EconomicIndicator, "Quarterly macro release")
            .with_metadata("gdpGrowth", 3.1)
            .with_metadata("unemployment", 4.2)
            .with_metadata("inflation", 2.4)
            .with_metadata("interestRates", 3.5),
        Event::new("newswire", EventType::Geopolitical, "Border tensions escalate")
            .with_priority(Priority::High)
            .with_entities(["NATO"]),
        Event::new("tape", EventType::MarketMovement, "Volatility index jumps 40%")
            .with_priority(Priority::Critical)
            .with_metadata("volatility", 42.0)
            .with_metadata("price", 4_150.0),
    ];
    let accepted = pipeline.hub().ingest_batch(feed);
    info!(accepted, "Synthetic feed submitted");

    info!("All stages running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    pipeline.stop().await;
    if pipeline.is_running() {
        error!("A pipeline stage did not stop cleanly");
    }

    info!(
        hub = ?pipeline.hub().stats(),
        detector = ?pipeline.detector().stats(),
        trigger = ?pipeline.trigger().stats(),
        "Final pipeline counters"
    );
    info!("Regime Sensor shut down complete.");
    Ok(())
}
