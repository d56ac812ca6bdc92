// =============================================================================
// Signal Ingestor — raw bus messages to canonical signals
// =============================================================================
//
// Producers publish loosely structured JSON. The ingestor pulls out the
// instrument, producer and direction, fills in a default confidence and
// appends the result to the signal window. Auxiliary status messages are
// handed back to the caller for the regime classifier instead.
//
// Rejections are values (`IngestError`); nothing here panics on bad input.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::bus::topic_matches;
use crate::regime::StatusUpdate;
use crate::signals::SignalWindow;
use crate::types::{Direction, Signal};

/// Fields searched for the instrument key, in priority order.
const INSTRUMENT_FIELDS: [&str; 3] = ["instrument", "pair", "symbol"];
/// Fields searched for the producer id, in priority order.
const PRODUCER_FIELDS: [&str; 3] = ["producer", "agent", "agent_id"];
/// Fields searched for the direction vocabulary, in priority order.
const DIRECTION_FIELDS: [&str; 3] = ["signal", "sentiment", "direction"];

#[derive(Debug, Error, PartialEq)]
pub enum IngestError {
    #[error("payload is not valid JSON: {0}")]
    Undecodable(String),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("no instrument in payload or topic {0}")]
    MissingInstrument(String),
    #[error("status payload on {0} carries no recognised fields")]
    EmptyStatus(String),
}

/// What a message turned into.
#[derive(Debug, Clone, PartialEq)]
pub enum Ingested {
    /// A signal, already appended to the window.
    Signal(Signal),
    /// Auxiliary market status for the regime classifier.
    Status(StatusUpdate),
}

pub struct SignalIngestor {
    window: Arc<SignalWindow>,
    default_confidence: f64,
    status_topics: Vec<String>,
}

impl SignalIngestor {
    pub fn new(window: Arc<SignalWindow>, default_confidence: f64, status_topics: Vec<String>) -> Self {
        Self {
            window,
            default_confidence: default_confidence.clamp(0.0, 1.0),
            status_topics,
        }
    }

    /// Parse a raw message and, for signals, append it to the window.
    pub fn ingest(&self, topic: &str, payload: &str) -> Result<Ingested, IngestError> {
        self.ingest_at(topic, payload, Utc::now())
    }

    pub fn ingest_at(
        &self,
        topic: &str,
        payload: &str,
        now: DateTime<Utc>,
    ) -> Result<Ingested, IngestError> {
        let parsed = self.parse(topic, payload, now)?;
        if let Ingested::Signal(signal) = &parsed {
            let len = self.window.append_at(&signal.instrument, signal.clone(), now);
            debug!(
                instrument = %signal.instrument,
                producer = %signal.producer_id,
                direction = %signal.direction,
                confidence = signal.confidence,
                window_len = len,
                "signal ingested"
            );
        }
        Ok(parsed)
    }

    /// Normalize a message without touching the window.
    pub fn parse(&self, topic: &str, payload: &str, now: DateTime<Utc>) -> Result<Ingested, IngestError> {
        let value: Value =
            serde_json::from_str(payload).map_err(|e| IngestError::Undecodable(e.to_string()))?;
        let record = value.as_object().ok_or(IngestError::NotAnObject)?;

        let instrument = first_str(record, &INSTRUMENT_FIELDS)
            .map(str::to_string)
            .or_else(|| topic_instrument(topic));

        if self.is_status_topic(topic) || (instrument.is_none() && record.contains_key("state")) {
            return StatusUpdate::from_json(record, now)
                .map(Ingested::Status)
                .ok_or_else(|| IngestError::EmptyStatus(topic.to_string()));
        }

        let instrument = instrument.ok_or_else(|| IngestError::MissingInstrument(topic.to_string()))?;

        let producer = first_str(record, &PRODUCER_FIELDS)
            .map(str::to_string)
            .or_else(|| topic_producer(topic))
            .unwrap_or_else(|| "unknown".to_string());

        let direction = first_str(record, &DIRECTION_FIELDS)
            .map(Direction::normalize)
            .unwrap_or(Direction::Unknown);

        let confidence = record
            .get("confidence")
            .and_then(number)
            .filter(|c| c.is_finite())
            .unwrap_or(self.default_confidence);

        Ok(Ingested::Signal(Signal::new(
            producer, instrument, direction, confidence, now,
        )))
    }

    fn is_status_topic(&self, topic: &str) -> bool {
        self.status_topics.iter().any(|t| topic_matches(t, topic))
    }
}

/// First non-empty string among `fields`.
fn first_str<'a>(record: &'a Map<String, Value>, fields: &[&str]) -> Option<&'a str> {
    fields
        .iter()
        .filter_map(|f| record.get(*f).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
}

/// Confidence may arrive as a number or a numeric string.
fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// `signals:<producer>:<instrument>` -> instrument (may itself contain `:`).
fn topic_instrument(topic: &str) -> Option<String> {
    let mut parts = topic.splitn(3, ':');
    parts.next()?;
    parts.next()?;
    parts
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn topic_producer(topic: &str) -> Option<String> {
    topic
        .split(':')
        .nth(1)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
