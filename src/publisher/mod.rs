//! Retrying event publisher.
//!
//! Every attempt sends through the registry's cached producer for the topic.
//! A failed send closes and evicts that producer, waits the retry delay, and
//! tries again on a freshly created one. The failure of the last attempt is
//! returned without evicting.

use std::sync::Arc;

use backon::{BackoffBuilder, ConstantBuilder};
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::broker::{BrokerError, OutboundMessage};
use crate::config::PublishConfig;
use crate::envelope::{EnvelopeError, EventEnvelope};
use crate::registry::ProducerRegistry;

/// Publish errors.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("failed to get producer for topic {topic} (attempt {attempt}): {source}")]
    Producer {
        topic: String,
        attempt: usize,
        #[source]
        source: BrokerError,
    },

    #[error("failed to publish to topic {topic} after {attempts} attempts: {source}")]
    RetriesExhausted {
        topic: String,
        attempts: usize,
        #[source]
        source: BrokerError,
    },
}

/// Publishes envelopes through a [`ProducerRegistry`].
#[derive(Clone)]
pub struct Publisher {
    registry: Arc<ProducerRegistry>,
    config: PublishConfig,
}

impl Publisher {
    pub fn new(registry: Arc<ProducerRegistry>, config: PublishConfig) -> Self {
        Self { registry, config }
    }

    /// Wrap `payload` in an envelope stamped now and publish it to `topic`.
    #[tracing::instrument(name = "publisher.publish", skip_all, fields(topic = %topic, event_type = %event_type))]
    pub async fn publish_event<T>(
        &self,
        topic: &str,
        event_type: &str,
        payload: &T,
    ) -> Result<(), PublishError>
    where
        T: Serialize + ?Sized + Sync,
    {
        let bytes = EventEnvelope::new(topic, event_type, payload).to_bytes()?;
        self.send_with_retry(topic, bytes).await
    }

    /// Publish a caller-built envelope to its own topic.
    #[tracing::instrument(name = "publisher.publish_envelope", skip_all, fields(topic = %envelope.topic, event_type = %envelope.event_type))]
    pub async fn publish_envelope<T>(&self, envelope: &EventEnvelope<T>) -> Result<(), PublishError>
    where
        T: Serialize + Sync,
    {
        let bytes = envelope.to_bytes()?;
        self.send_with_retry(&envelope.topic, bytes).await
    }

    async fn send_with_retry(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        let max_attempts = self.config.max_attempts();
        let mut delays = ConstantBuilder::default()
            .with_delay(self.config.retry_delay())
            .with_max_times(self.config.max_retries)
            .build();

        let mut attempt = 1;
        let mut producer = self.producer(topic, attempt).await?;

        loop {
            let message = OutboundMessage::new(payload.clone());
            let error = match producer.send(message).await {
                Ok(()) => {
                    debug!(topic = %topic, attempt, bytes = payload.len(), "Published event");
                    return Ok(());
                }
                Err(e) => e,
            };

            let Some(delay) = delays.next() else {
                error!(
                    topic = %topic,
                    attempts = attempt,
                    error = %error,
                    "Publish failed, retries exhausted"
                );
                return Err(PublishError::RetriesExhausted {
                    topic: topic.to_string(),
                    attempts: attempt,
                    source: error,
                });
            };

            warn!(
                topic = %topic,
                attempt,
                max_attempts,
                error = %error,
                retry_delay_ms = %delay.as_millis(),
                "Publish failed, recreating producer"
            );

            self.registry.evict(topic, &producer).await;
            tokio::time::sleep(delay).await;

            attempt += 1;
            producer = self.producer(topic, attempt).await?;
        }
    }

    async fn producer(
        &self,
        topic: &str,
        attempt: usize,
    ) -> Result<Arc<dyn crate::broker::Producer>, PublishError> {
        self.registry
            .get_or_create(topic)
            .await
            .map_err(|source| PublishError::Producer {
                topic: topic.to_string(),
                attempt,
                source,
            })
    }
}

#[cfg(test)]
mod tests;
