// =============================================================================
// Regime types — labels, detection candidates and confirmed changes
// =============================================================================

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::ConfigError;
use crate::event_hub::{Event, EventType};
use crate::types::{clamp_confidence, Indicators};

/// Macro behaviour currently assumed for the monitored system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Regime {
    BullMarket,
    BearMarket,
    VolatilityShock,
    Recession,
    Expansion,
    Inflation,
    Deflation,
    MonetaryTightening,
    MonetaryEasing,
    GeopoliticalCrisis,
    Custom,
}

impl Regime {
    pub const ALL: [Regime; 11] = [
        Self::BullMarket,
        Self::BearMarket,
        Self::VolatilityShock,
        Self::Recession,
        Self::Expansion,
        Self::Inflation,
        Self::Deflation,
        Self::MonetaryTightening,
        Self::MonetaryEasing,
        Self::GeopoliticalCrisis,
        Self::Custom,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::BullMarket => "BULL_MARKET",
            Self::BearMarket => "BEAR_MARKET",
            Self::VolatilityShock => "VOLATILITY_SHOCK",
            Self::Recession => "RECESSION",
            Self::Expansion => "EXPANSION",
            Self::Inflation => "INFLATION",
            Self::Deflation => "DEFLATION",
            Self::MonetaryTightening => "MONETARY_TIGHTENING",
            Self::MonetaryEasing => "MONETARY_EASING",
            Self::GeopoliticalCrisis => "GEOPOLITICAL_CRISIS",
            Self::Custom => "CUSTOM",
        }
    }

    /// Regimes that always warrant immediate retrodiction.
    pub fn is_shock(self) -> bool {
        matches!(self, Self::VolatilityShock | Self::GeopoliticalCrisis)
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Regime {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|r| r.as_str() == tag)
            .ok_or(ConfigError::UnknownTag { kind: "regime", tag })
    }
}

// =============================================================================
// RegimeCandidate
// =============================================================================

/// A detection method's proposal for the next regime.
#[derive(Debug, Clone)]
pub struct RegimeCandidate {
    pub regime: Regime,
    confidence: f64,
    pub supporting_evidence: Vec<Arc<Event>>,
    pub indicators: Indicators,
}

impl RegimeCandidate {
    /// Confidence is clamped into `[0, 1]`.
    pub fn new(regime: Regime, confidence: f64) -> Self {
        Self {
            regime,
            confidence: clamp_confidence(confidence),
            supporting_evidence: Vec::new(),
            indicators: Indicators::new(),
        }
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn with_evidence(mut self, evidence: Vec<Arc<Event>>) -> Self {
        self.supporting_evidence = evidence;
        self
    }

    pub fn with_indicator(mut self, name: impl Into<String>, value: f64) -> Self {
        self.indicators.insert(name.into(), value);
        self
    }
}

// =============================================================================
// RegimeChangeEvent
// =============================================================================

/// A confirmed regime transition.
///
/// `supporting_evidence` holds shared read-only references to buffered events.
/// `retrodiction_triggered` flips to `true` exactly once, when the retrodiction
/// trigger turns this change into a snapshot.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegimeChangeEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub old_regime: Option<Regime>,
    pub new_regime: Regime,
    #[serde(deserialize_with = "deserialize_confidence")]
    confidence: f64,
    #[serde(default)]
    pub supporting_evidence: Vec<Arc<Event>>,
    #[serde(default)]
    pub market_indicators: Indicators,
    #[serde(
        default,
        serialize_with = "serialize_flag",
        deserialize_with = "deserialize_flag"
    )]
    retrodiction_triggered: AtomicBool,
}

impl RegimeChangeEvent {
    /// Confidence is clamped into `[0, 1]` (1.7 -> 1.0, -0.3 -> 0.0).
    pub fn new(
        old_regime: Option<Regime>,
        new_regime: Regime,
        confidence: f64,
        supporting_evidence: Vec<Arc<Event>>,
        market_indicators: Indicators,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            old_regime,
            new_regime,
            confidence: clamp_confidence(confidence),
            supporting_evidence,
            market_indicators,
            retrodiction_triggered: AtomicBool::new(false),
        }
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn retrodiction_triggered(&self) -> bool {
        self.retrodiction_triggered.load(Ordering::SeqCst)
    }

    /// Set the triggered flag. Returns `true` only for the call that flipped
    /// it.
    pub fn mark_retrodiction_triggered(&self) -> bool {
        !self.retrodiction_triggered.swap(true, Ordering::SeqCst)
    }

    /// Undo the flag after the snapshot for this change could not be queued.
    pub(crate) fn clear_retrodiction_triggered(&self) {
        self.retrodiction_triggered.store(false, Ordering::SeqCst);
    }

    /// Supporting events of one type.
    pub fn evidence_of(&self, event_type: EventType) -> impl Iterator<Item = &Arc<Event>> {
        self.supporting_evidence
            .iter()
            .filter(move |e| e.event_type == event_type)
    }
}

impl Clone for RegimeChangeEvent {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            timestamp: self.timestamp,
            old_regime: self.old_regime,
            new_regime: self.new_regime,
            confidence: self.confidence,
            supporting_evidence: self.supporting_evidence.clone(),
            market_indicators: self.market_indicators.clone(),
            retrodiction_triggered: AtomicBool::new(self.retrodiction_triggered()),
        }
    }
}

fn deserialize_confidence<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    f64::deserialize(deserializer).map(clamp_confidence)
}

fn serialize_flag<S: Serializer>(flag: &AtomicBool, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_bool(flag.load(Ordering::SeqCst))
}

fn deserialize_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<AtomicBool, D::Error> {
    bool::deserialize(deserializer).map(AtomicBool::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_is_clamped_on_construction() {
        let high = RegimeChangeEvent::new(None, Regime::BullMarket, 1.7, vec![], Indicators::new());
        let low = RegimeChangeEvent::new(None, Regime::BearMarket, -0.3, vec![], Indicators::new());
        assert_eq!(high.confidence(), 1.0);
        assert_eq!(low.confidence(), 0.0);
        assert_eq!(RegimeCandidate::new(Regime::Recession, 2.0).confidence(), 1.0);
    }

    #[test]
    fn confidence_is_clamped_on_deserialise() {
        let json = r#"{
            "id": "r1",
            "timestamp": "2024-03-01T00:00:00Z",
            "oldRegime": null,
            "newRegime": "RECESSION",
            "confidence": 3.2
        }"#;
        let change: RegimeChangeEvent = serde_json::from_str(json).unwrap();
        assert_eq!(change.confidence(), 1.0);
        assert!(!change.retrodiction_triggered());
        assert!(change.supporting_evidence.is_empty());
    }

    #[test]
    fn triggered_flag_flips_once() {
        let change = RegimeChangeEvent::new(None, Regime::Inflation, 0.8, vec![], Indicators::new());
        assert!(change.mark_retrodiction_triggered());
        assert!(!change.mark_retrodiction_triggered());
        assert!(change.retrodiction_triggered());
    }

    #[test]
    fn serialised_record_keeps_null_old_regime_and_evidence() {
        let evidence = Arc::new(
            Event::new("wire", EventType::News, "Markets tumble").with_id("n1"),
        );
        let mut indicators = Indicators::new();
        indicators.insert("volatility".into(), 41.0);
        let change = RegimeChangeEvent::new(
            None,
            Regime::VolatilityShock,
            0.9,
            vec![evidence.clone()],
            indicators,
        );
        change.mark_retrodiction_triggered();

        let value = serde_json::to_value(&change).unwrap();
        assert!(value.get("oldRegime").unwrap().is_null());
        assert_eq!(value["newRegime"], "VOLATILITY_SHOCK");
        assert_eq!(value["retrodictionTriggered"], true);
        assert_eq!(value["supportingEvidence"][0]["id"], "n1");

        let back: RegimeChangeEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back.id, change.id);
        assert_eq!(back.old_regime, None);
        assert_eq!(back.supporting_evidence[0].as_ref(), evidence.as_ref());
        assert_eq!(back.market_indicators["volatility"], 41.0);
        assert!(back.retrodiction_triggered());
    }

    #[test]
    fn unknown_regime_tag_is_a_config_error() {
        assert_eq!("bull_market".parse::<Regime>().unwrap(), Regime::BullMarket);
        assert_eq!(
            "SIDEWAYS".parse::<Regime>(),
            Err(ConfigError::UnknownTag {
                kind: "regime",
                tag: "SIDEWAYS".into()
            })
        );
    }

    #[test]
    fn shock_regimes() {
        assert!(Regime::VolatilityShock.is_shock());
        assert!(Regime::GeopoliticalCrisis.is_shock());
        assert!(!Regime::Recession.is_shock());
    }
}
