//! Event envelope wire format.
//!
//! Every event travels as a JSON envelope:
//!
//! ```text
//! {"topic": "...", "eventType": "...", "timestamp": <epoch ms>, "payload": <any>}
//! ```
//!
//! Two decode paths exist:
//! - [`EventEnvelope<T>`]: full typed encode/decode, used when publishing.
//! - [`EventHeader`]: header-only decode. The payload is kept as an
//!   uninterpreted JSON span so routing decisions (topic, event type) can be
//!   made before committing to a concrete payload type.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tracing::debug;

/// Errors from envelope encode/decode.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("failed to serialize event: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to parse event header: {0}")]
    Header(#[source] serde_json::Error),

    #[error("failed to decode event: {0}")]
    Decode(#[source] serde_json::Error),

    /// Payload span was absent or the literal `null`.
    #[error("event has no payload to unmarshal")]
    NoPayload,

    #[error("failed to unmarshal event payload for type {type_name}: {source}")]
    Payload {
        type_name: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Typed event envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope<T> {
    pub topic: String,
    pub event_type: String,
    /// Milliseconds since the Unix epoch, fixed at construction.
    pub timestamp: i64,
    pub payload: T,
}

impl<T> EventEnvelope<T> {
    /// Wrap a payload, stamping the current time.
    pub fn new(topic: impl Into<String>, event_type: impl Into<String>, payload: T) -> Self {
        Self::with_timestamp(
            topic,
            event_type,
            chrono::Utc::now().timestamp_millis(),
            payload,
        )
    }

    /// Wrap a payload with an explicit timestamp.
    pub fn with_timestamp(
        topic: impl Into<String>,
        event_type: impl Into<String>,
        timestamp: i64,
        payload: T,
    ) -> Self {
        Self {
            topic: topic.into(),
            event_type: event_type.into(),
            timestamp,
            payload,
        }
    }
}

impl<T: Serialize> EventEnvelope<T> {
    /// Serialize the full envelope to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Serialize)
    }

    /// Serialize the full envelope to a JSON string.
    pub fn to_json_string(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(EnvelopeError::Serialize)
    }
}

impl<T: DeserializeOwned> EventEnvelope<T> {
    /// Decode a full envelope in one step.
    pub fn from_bytes(data: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(data).map_err(EnvelopeError::Decode)
    }
}

/// Envelope metadata with the payload left undecoded.
///
/// Header fields are lenient: a missing `topic`, `eventType` or `timestamp`
/// decodes to its empty value. Only malformed JSON, a non-object body, or a
/// wrongly typed field fails [`EventHeader::parse`].
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventHeader {
    pub topic: String,
    pub event_type: String,
    pub timestamp: i64,
    /// `None` when the payload was absent or `null`.
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<Box<RawValue>>,
}

impl EventHeader {
    /// Parse the header from raw message bytes.
    pub fn parse(data: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(data).map_err(EnvelopeError::Header)
    }

    /// Whether a non-null payload span is present.
    pub fn has_payload(&self) -> bool {
        self.payload.is_some()
    }

    /// The payload exactly as it appeared on the wire.
    pub fn raw_payload(&self) -> Option<&str> {
        self.payload.as_deref().map(RawValue::get)
    }

    /// Decode the payload span into `T`.
    ///
    /// Reports [`EnvelopeError::NoPayload`] rather than a generic decode error
    /// when the span is absent or `null`.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        let raw = self.payload.as_deref().ok_or(EnvelopeError::NoPayload)?;
        serde_json::from_str(raw.get()).map_err(|source| EnvelopeError::Payload {
            type_name: std::any::type_name::<T>(),
            source,
        })
    }

    /// Complete the two-phase decode into a typed envelope.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<EventEnvelope<T>, EnvelopeError> {
        Ok(EventEnvelope {
            topic: self.topic.clone(),
            event_type: self.event_type.clone(),
            timestamp: self.timestamp,
            payload: self.payload()?,
        })
    }

    /// Re-serialize the header (payload included) as JSON.
    pub fn raw_json(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string_pretty(self).map_err(EnvelopeError::Serialize)
    }

    /// Log the header with a pretty-printed payload at debug level.
    pub fn log_pretty(&self) {
        let payload = self
            .raw_payload()
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
            .and_then(|value| serde_json::to_string_pretty(&value).ok())
            .unwrap_or_else(|| "null".to_string());

        debug!(
            topic = %self.topic,
            event_type = %self.event_type,
            timestamp = self.timestamp,
            "Consumed event\n{}",
            payload
        );
    }
}

impl fmt::Debug for EventHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHeader")
            .field("topic", &self.topic)
            .field("event_type", &self.event_type)
            .field("timestamp", &self.timestamp)
            .field("payload", &self.raw_payload())
            .finish()
    }
}

#[cfg(test)]
mod tests;
