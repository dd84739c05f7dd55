//! Per-message processing: decode, dispatch, acknowledge.
//!
//! ```text
//! RECEIVED ─▶ parse header
//!   ├─ fails ─▶ forward to dead-letter topic
//!   │             ├─ ok    ─▶ ack   (DeadLettered)
//!   │             └─ fails ─▶ nack  (DeadLetterFailed)
//!   └─ ok ────▶ handler
//!                 ├─ ok    ─▶ ack   (Acked)
//!                 └─ fails ─▶ nack  (Nacked)
//! ```

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::broker::{Consumer, InboundMessage};
use crate::dlq::{self, DeadLetter, UNPARSEABLE_PAYLOAD};
use crate::envelope::{EnvelopeError, EventHeader};
use crate::handlers::EventHandler;
use crate::registry::ProducerRegistry;

/// Terminal state of one processed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handler succeeded; acknowledged.
    Acked,
    /// Handler failed; negatively acknowledged for redelivery.
    Nacked,
    /// Unparseable; forwarded to the dead-letter topic and acknowledged.
    DeadLettered,
    /// Unparseable and the forward failed; negatively acknowledged.
    DeadLetterFailed,
}

/// Processes messages of one subscribed topic.
pub struct MessageProcessor {
    handler: Arc<dyn EventHandler>,
    consumer: Arc<dyn Consumer>,
    registry: Arc<ProducerRegistry>,
    dead_letter_topic: String,
}

impl MessageProcessor {
    pub fn new(
        handler: Arc<dyn EventHandler>,
        consumer: Arc<dyn Consumer>,
        registry: Arc<ProducerRegistry>,
        dead_letter_topic: impl Into<String>,
    ) -> Self {
        Self {
            handler,
            consumer,
            registry,
            dead_letter_topic: dead_letter_topic.into(),
        }
    }

    pub async fn process(&self, message: InboundMessage) -> Disposition {
        let header = match EventHeader::parse(&message.payload) {
            Ok(header) => header,
            Err(e) => return self.dead_letter(&message, e).await,
        };

        header.log_pretty();

        match self.handler.handle_event(&header).await {
            Ok(()) => {
                self.ack(&message).await;
                Disposition::Acked
            }
            Err(e) => {
                warn!(
                    topic = %message.topic,
                    id = %message.id,
                    event_type = %header.event_type,
                    error = %e,
                    "Handler failed, message will be redelivered"
                );
                self.nack(&message).await;
                Disposition::Nacked
            }
        }
    }

    async fn dead_letter(&self, message: &InboundMessage, cause: EnvelopeError) -> Disposition {
        warn!(
            topic = %message.topic,
            id = %message.id,
            error = %cause,
            "Unparseable message, forwarding to dead letter topic"
        );

        let dead_letter = DeadLetter::from_message(message, UNPARSEABLE_PAYLOAD, cause.to_string());
        match dlq::forward(&self.registry, &self.dead_letter_topic, dead_letter).await {
            Ok(()) => {
                self.ack(message).await;
                Disposition::DeadLettered
            }
            Err(e) => {
                error!(
                    topic = %message.topic,
                    id = %message.id,
                    dead_letter_topic = %self.dead_letter_topic,
                    error = %e,
                    "Dead letter forward failed"
                );
                self.nack(message).await;
                Disposition::DeadLetterFailed
            }
        }
    }

    async fn ack(&self, message: &InboundMessage) {
        match self.consumer.ack(message).await {
            Ok(()) => debug!(topic = %message.topic, id = %message.id, "Acked"),
            Err(e) => warn!(topic = %message.topic, id = %message.id, error = %e, "Ack failed"),
        }
    }

    async fn nack(&self, message: &InboundMessage) {
        if let Err(e) = self.consumer.nack(message).await {
            warn!(topic = %message.topic, id = %message.id, error = %e, "Nack failed");
        }
    }
}
