// =============================================================================
// Runtime Configuration — pipeline tunables with atomic save
// =============================================================================
//
// Every tunable of the three pipeline stages lives here. All fields carry a
// serde default so a partial (or empty) JSON file loads with the documented
// defaults. Values are validated once, when the pipeline is built; nothing is
// re-validated mid-stream.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;
use crate::regime::Regime;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_hub_queue_capacity() -> usize {
    10_000
}

fn default_history_limit() -> usize {
    1_000
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_stop_timeout_ms() -> u64 {
    2_000
}

fn default_buffer_size() -> usize {
    1_000
}

fn default_min_confidence() -> f64 {
    0.7
}

fn default_initial_regime() -> Regime {
    Regime::Expansion
}

fn default_evaluation_interval_secs() -> u64 {
    60
}

fn default_trigger_queue_capacity() -> usize {
    1_000
}

fn default_window_days() -> i64 {
    365
}

fn default_schedule_interval_secs() -> u64 {
    24 * 60 * 60
}

fn default_variables() -> Vec<String> {
    vec![
        "price".to_string(),
        "volatility".to_string(),
        "gdpGrowth".to_string(),
        "unemployment".to_string(),
        "inflation".to_string(),
        "interestRates".to_string(),
    ]
}

fn default_volatility_threshold() -> f64 {
    30.0
}

fn default_news_window() -> usize {
    50
}

fn default_news_min_events() -> usize {
    5
}

fn default_sentiment_threshold() -> f64 {
    0.4
}

fn default_crisis_share() -> f64 {
    0.3
}

fn require_positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            field,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

// =============================================================================
// EventHubConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventHubConfig {
    /// Maximum queued (not yet dispatched) events; extra events are dropped.
    #[serde(default = "default_hub_queue_capacity")]
    pub queue_capacity: usize,

    /// Processed events retained in the in-memory history.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

impl Default for EventHubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_hub_queue_capacity(),
            history_limit: default_history_limit(),
            poll_interval_ms: default_poll_interval_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }
}

impl EventHubConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("event_hub.queue_capacity", self.queue_capacity as u64)?;
        require_positive("event_hub.history_limit", self.history_limit as u64)?;
        require_positive("event_hub.poll_interval_ms", self.poll_interval_ms)
    }
}

// =============================================================================
// DetectorConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Size of the rolling event buffer seen by detection methods.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Minimum confidence a winning candidate needs to change regime.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// Regime assumed before any transition.
    #[serde(default = "default_initial_regime")]
    pub initial_regime: Regime,

    /// Regime changes retained in the in-memory history.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Period of the background re-evaluation.
    #[serde(default = "default_evaluation_interval_secs")]
    pub evaluation_interval_secs: u64,

    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            min_confidence: default_min_confidence(),
            initial_regime: default_initial_regime(),
            history_limit: default_history_limit(),
            evaluation_interval_secs: default_evaluation_interval_secs(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }
}

impl DetectorConfig {
    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_secs(self.evaluation_interval_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(ConfigError::InvalidValue {
                field: "detector.min_confidence",
                reason: format!("{} is outside [0, 1]", self.min_confidence),
            });
        }
        require_positive("detector.buffer_size", self.buffer_size as u64)?;
        require_positive("detector.history_limit", self.history_limit as u64)?;
        require_positive("detector.evaluation_interval_secs", self.evaluation_interval_secs)
    }
}

// =============================================================================
// TriggerConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Maximum queued snapshots; extra snapshots are dropped.
    #[serde(default = "default_trigger_queue_capacity")]
    pub queue_capacity: usize,

    /// Processed snapshots retained in the in-memory history.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Length of the default retrodiction window, ending now.
    #[serde(default = "default_window_days")]
    pub default_window_days: i64,

    /// Gap between two self-scheduled snapshots.
    #[serde(default = "default_schedule_interval_secs")]
    pub schedule_interval_secs: u64,

    #[serde(default = "default_true")]
    pub enable_scheduled: bool,

    /// Variables retrodicted by regime-change and scheduled snapshots.
    #[serde(default = "default_variables")]
    pub default_variables: Vec<String>,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_trigger_queue_capacity(),
            history_limit: default_history_limit(),
            default_window_days: default_window_days(),
            schedule_interval_secs: default_schedule_interval_secs(),
            enable_scheduled: true,
            default_variables: default_variables(),
            poll_interval_ms: default_poll_interval_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }
}

impl TriggerConfig {
    /// Default retrodiction window. Fails unless the window is positive and a
    /// window ending now still starts at a representable date.
    pub fn default_window(&self) -> Result<chrono::Duration, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidValue {
            field: "trigger.default_window_days",
            reason: reason.to_string(),
        };
        if self.default_window_days <= 0 {
            return Err(invalid("must be greater than zero"));
        }
        let window = chrono::Duration::try_days(self.default_window_days)
            .ok_or_else(|| invalid("out of range"))?;
        Utc::now()
            .checked_sub_signed(window)
            .ok_or_else(|| invalid("window starts before the earliest representable date"))?;
        Ok(window)
    }

    /// Gap between scheduled snapshots as a calendar duration.
    pub fn schedule_period(&self) -> Result<chrono::Duration, ConfigError> {
        require_positive("trigger.schedule_interval_secs", self.schedule_interval_secs)?;
        i64::try_from(self.schedule_interval_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "trigger.schedule_interval_secs",
                reason: "out of range".to_string(),
            })
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_secs(self.schedule_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("trigger.queue_capacity", self.queue_capacity as u64)?;
        require_positive("trigger.history_limit", self.history_limit as u64)?;
        require_positive("trigger.poll_interval_ms", self.poll_interval_ms)?;
        self.schedule_period()?;
        self.default_window()?;
        Ok(())
    }
}

// =============================================================================
// StrategyParams
// =============================================================================

/// Thresholds for the bundled detection methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyParams {
    /// `volatility` reading above which a volatility shock is proposed.
    #[serde(default = "default_volatility_threshold")]
    pub volatility_threshold: f64,

    /// Most recent NEWS events scored by the sentiment method.
    #[serde(default = "default_news_window")]
    pub news_window: usize,

    /// Minimum NEWS events before sentiment is scored at all.
    #[serde(default = "default_news_min_events")]
    pub news_min_events: usize,

    /// Absolute net sentiment needed for a bull/bear proposal.
    #[serde(default = "default_sentiment_threshold")]
    pub sentiment_threshold: f64,

    /// Share of crisis-keyword articles needed for a geopolitical crisis.
    #[serde(default = "default_crisis_share")]
    pub crisis_share: f64,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            volatility_threshold: default_volatility_threshold(),
            news_window: default_news_window(),
            news_min_events: default_news_min_events(),
            sentiment_threshold: default_sentiment_threshold(),
            crisis_share: default_crisis_share(),
        }
    }
}

impl StrategyParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.volatility_threshold > 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "strategies.volatility_threshold",
                reason: "must be greater than zero".to_string(),
            });
        }
        require_positive("strategies.news_window", self.news_window as u64)
    }
}

// =============================================================================
// PipelineConfig
// =============================================================================

/// Top-level configuration for the whole sensor pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub event_hub: EventHubConfig,

    #[serde(default)]
    pub detector: DetectorConfig,

    #[serde(default)]
    pub trigger: TriggerConfig,

    #[serde(default)]
    pub strategies: StrategyParams,

    /// Forward numeric metadata of MARKET_MOVEMENT / ECONOMIC_INDICATOR
    /// events to the detector as market data.
    #[serde(default = "default_true")]
    pub forward_event_metrics: bool,
}

impl PipelineConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read pipeline config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse pipeline config from {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("invalid pipeline config in {}", path.display()))?;

        info!(
            path = %path.display(),
            min_confidence = config.detector.min_confidence,
            initial_regime = %config.detector.initial_regime,
            "pipeline config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise pipeline config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "pipeline config saved (atomic)");
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.event_hub.validate()?;
        self.detector.validate()?;
        self.trigger.validate()?;
        self.strategies.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.event_hub.queue_capacity, 10_000);
        assert_eq!(cfg.detector.buffer_size, 1_000);
        assert!((cfg.detector.min_confidence - 0.7).abs() < f64::EPSILON);
        assert_eq!(cfg.detector.initial_regime, Regime::Expansion);
        assert_eq!(cfg.trigger.default_window(), Ok(chrono::Duration::days(365)));
        assert_eq!(cfg.trigger.schedule_period(), Ok(chrono::Duration::hours(24)));
        assert_eq!(cfg.trigger.schedule_interval(), Duration::from_secs(86_400));
        assert!(cfg.trigger.enable_scheduled);
        assert!(cfg.forward_event_metrics);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: PipelineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.trigger.queue_capacity, 1_000);
        assert_eq!(cfg.event_hub.poll_interval(), Duration::from_millis(50));
        assert!((cfg.strategies.volatility_threshold - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "detector": { "min_confidence": 0.5, "initial_regime": "BEAR_MARKET" } }"#;
        let cfg: PipelineConfig = serde_json::from_str(json).unwrap();
        assert!((cfg.detector.min_confidence - 0.5).abs() < f64::EPSILON);
        assert_eq!(cfg.detector.initial_regime, Regime::BearMarket);
        assert_eq!(cfg.detector.buffer_size, 1_000);
    }

    #[test]
    fn unknown_regime_tag_fails_to_load() {
        let json = r#"{ "detector": { "initial_regime": "SIDEWAYS" } }"#;
        assert!(serde_json::from_str::<PipelineConfig>(json).is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let mut cfg = PipelineConfig::default();
        cfg.detector.min_confidence = 1.5;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidValue { field: "detector.min_confidence", .. })
        ));

        let mut cfg = PipelineConfig::default();
        cfg.event_hub.queue_capacity = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::default();
        cfg.trigger.default_window_days = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_unrepresentable_trigger_durations() {
        for days in [200_000_000, i64::MAX] {
            let mut cfg = PipelineConfig::default();
            cfg.trigger.default_window_days = days;
            assert!(matches!(
                cfg.validate(),
                Err(ConfigError::InvalidValue { field: "trigger.default_window_days", .. })
            ));
        }

        for secs in [10_u64.pow(16), u64::MAX] {
            let mut cfg = PipelineConfig::default();
            cfg.trigger.schedule_interval_secs = secs;
            assert!(matches!(
                cfg.validate(),
                Err(ConfigError::InvalidValue { field: "trigger.schedule_interval_secs", .. })
            ));
        }

        let mut cfg = PipelineConfig::default();
        cfg.trigger.default_window_days = 100 * 365;
        cfg.trigger.schedule_interval_secs = 7 * 24 * 60 * 60;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");

        let mut cfg = PipelineConfig::default();
        cfg.detector.min_confidence = 0.65;
        cfg.trigger.default_variables = vec!["price".into()];
        cfg.save(&path).unwrap();

        let loaded = PipelineConfig::load(&path).unwrap();
        assert!((loaded.detector.min_confidence - 0.65).abs() < f64::EPSILON);
        assert_eq!(loaded.trigger.default_variables, vec!["price"]);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{ "trigger": { "queue_capacity": 0 } }"#).unwrap();
        assert!(PipelineConfig::load(&path).is_err());
    }
}
