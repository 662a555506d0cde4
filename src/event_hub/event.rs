// =============================================================================
// Event — a single typed, prioritised signal from an external feed
// =============================================================================
//
// Life-cycle:
//   created by a producer  ->  queued  ->  dispatched (processed = true)
//
// Only the hub's dispatch loop mutates an event after creation: it appends a
// processing record and then sets `processed`, so a processed event always
// has a non-empty `processing_history`.
// =============================================================================

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;
use crate::types::{Metadata, Priority};

/// Category of an incoming event. `Custom` handlers act as a catch-all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    News,
    CorporateAnnouncement,
    MarketMovement,
    EconomicIndicator,
    Geopolitical,
    Regulatory,
    Custom,
}

impl EventType {
    pub const ALL: [EventType; 7] = [
        Self::News,
        Self::CorporateAnnouncement,
        Self::MarketMovement,
        Self::EconomicIndicator,
        Self::Geopolitical,
        Self::Regulatory,
        Self::Custom,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::News => "NEWS",
            Self::CorporateAnnouncement => "CORPORATE_ANNOUNCEMENT",
            Self::MarketMovement => "MARKET_MOVEMENT",
            Self::EconomicIndicator => "ECONOMIC_INDICATOR",
            Self::Geopolitical => "GEOPOLITICAL",
            Self::Regulatory => "REGULATORY",
            Self::Custom => "CUSTOM",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == tag)
            .ok_or(ConfigError::UnknownTag {
                kind: "event type",
                tag,
            })
    }
}

/// One dispatch of an event: when it happened and which handlers completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingRecord {
    pub timestamp: DateTime<Utc>,
    pub handler_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Caller-supplied stable identifier (UUID v4 when not supplied).
    pub id: String,
    /// Label of the originating feed.
    pub source: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    /// Related entity names, in the order the producer listed them.
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub processed: bool,
    #[serde(default)]
    pub processing_history: Vec<ProcessingRecord>,
}

impl Event {
    /// New unprocessed event with a generated id, MEDIUM priority and the
    /// current time.
    pub fn new(source: impl Into<String>, event_type: EventType, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source: source.into(),
            event_type,
            timestamp: Utc::now(),
            content: content.into(),
            entities: Vec::new(),
            metadata: Metadata::new(),
            priority: Priority::Medium,
            processed: false,
            processing_history: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_entities<I, S>(mut self, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entities = entities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Record one dispatch and mark the event processed.
    pub(crate) fn mark_processed(&mut self, handler_names: Vec<String>) {
        self.processing_history.push(ProcessingRecord {
            timestamp: Utc::now(),
            handler_names,
        });
        self.processed = true;
    }

    /// Numeric metadata entries, used to forward market readings.
    pub fn numeric_metadata(&self) -> impl Iterator<Item = (&str, f64)> {
        self.metadata
            .iter()
            .filter_map(|(k, v)| v.as_f64().map(|n| (k.as_str(), n)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let event = Event::new("reuters", EventType::News, "Rates unchanged")
            .with_id("evt-1")
            .with_priority(Priority::High)
            .with_entities(["FED", "ECB"])
            .with_metadata("region", "US");

        assert_eq!(event.id, "evt-1");
        assert_eq!(event.priority, Priority::High);
        assert_eq!(event.entities, vec!["FED", "ECB"]);
        assert_eq!(event.metadata["region"], "US");
        assert!(!event.processed);
        assert!(event.processing_history.is_empty());
    }

    #[test]
    fn mark_processed_appends_history() {
        let mut event = Event::new("feed", EventType::Custom, "x");
        event.mark_processed(vec!["logger".into()]);

        assert!(event.processed);
        assert_eq!(event.processing_history.len(), 1);
        assert_eq!(event.processing_history[0].handler_names, vec!["logger"]);
    }

    #[test]
    fn serialised_shape_uses_wire_names() {
        let mut event = Event::new("feed", EventType::MarketMovement, "SPX -3%")
            .with_id("m1")
            .with_priority(Priority::Critical);
        event.mark_processed(Vec::new());

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "MARKET_MOVEMENT");
        assert_eq!(value["priority"], "CRITICAL");
        assert_eq!(value["processed"], true);
        assert!(value["processingHistory"][0]["handlerNames"].is_array());

        let back: Event = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        assert_eq!("news".parse::<EventType>().unwrap(), EventType::News);
        assert!("WEATHER".parse::<EventType>().is_err());
        let bad = r#"{"id":"1","source":"s","type":"WEATHER","timestamp":"2024-01-01T00:00:00Z","content":""}"#;
        assert!(serde_json::from_str::<Event>(bad).is_err());
    }

    #[test]
    fn numeric_metadata_skips_non_numbers() {
        let event = Event::new("feed", EventType::EconomicIndicator, "CPI")
            .with_metadata("inflation", 4.2)
            .with_metadata("country", "US");
        let numbers: Vec<(&str, f64)> = event.numeric_metadata().collect();
        assert_eq!(numbers, vec![("inflation", 4.2)]);
    }
}
