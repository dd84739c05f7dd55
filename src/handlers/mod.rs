//! Event handler contract and built-in handlers.

use async_trait::async_trait;
use tracing::info;

use crate::envelope::{EnvelopeError, EventHeader};

/// Errors returned by an [`EventHandler`]. Any error negatively
/// acknowledges the message so the broker redelivers it.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Payload(#[from] EnvelopeError),

    #[error("handler failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Application callback for consumed events.
///
/// Receives the header with the payload still undecoded; call
/// [`EventHeader::payload`] or [`EventHeader::decode`] to decode it.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, header: &EventHeader) -> Result<(), HandlerError>;
}

/// Handler that logs every event it receives and accepts it.
#[derive(Debug, Clone)]
pub struct LoggingHandler {
    name: String,
}

impl LoggingHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl EventHandler for LoggingHandler {
    async fn handle_event(&self, header: &EventHeader) -> Result<(), HandlerError> {
        info!(
            handler = %self.name,
            topic = %header.topic,
            event_type = %header.event_type,
            timestamp = header.timestamp,
            payload_bytes = header.raw_payload().map(str::len).unwrap_or(0),
            "Event received"
        );
        Ok(())
    }
}
