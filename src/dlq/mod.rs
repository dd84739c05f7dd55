//! Dead-letter routing and replay.
//!
//! ## Topic Naming
//!
//! Every consumed topic `t` has a dead-letter topic `t.dead_letter`. Messages
//! land there two ways:
//! - the broker routes a message after it exhausted its delivery attempts
//!   (handler kept failing)
//! - the message processor forwards a message whose body is not a valid
//!   envelope, tagging it with provenance properties
//!
//! ## Provenance
//!
//! Forwarded messages carry the original payload bytes unchanged plus:
//! - `dlq_reason`: machine-readable reason (`unparseable_payload`)
//! - `dlq_error_detail`: the decode error
//! - `original_topic`, `original_message_id`
//! - `original_prop_<key>` for every property of the original message
//!
//! ## Replay
//!
//! [`DeadLetterReprocessor::process`] drains a dead-letter topic back into a
//! target topic, republishing payload and properties unchanged.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::broker::{
    BrokerClient, BrokerError, InboundMessage, OutboundMessage, Properties, SubscribeOptions,
};
use crate::config::DlqConfig;
use crate::crypto::KeyMaterial;
use crate::registry::ProducerRegistry;

/// Suffix appended to a topic to name its dead-letter topic.
pub const DEAD_LETTER_SUFFIX: &str = ".dead_letter";

pub const REASON_PROPERTY: &str = "dlq_reason";
pub const ERROR_DETAIL_PROPERTY: &str = "dlq_error_detail";
pub const ORIGINAL_TOPIC_PROPERTY: &str = "original_topic";
pub const ORIGINAL_MESSAGE_ID_PROPERTY: &str = "original_message_id";
/// Prefix for copied properties of the original message.
pub const ORIGINAL_PROPERTY_PREFIX: &str = "original_prop_";

/// Reason recorded for a body that is not a valid event envelope.
pub const UNPARSEABLE_PAYLOAD: &str = "unparseable_payload";

/// Suffix of the subscription the reprocessor drains with.
pub const REPROCESSOR_SUBSCRIPTION_SUFFIX: &str = "-dlq-processor";

/// Build the dead-letter topic name for a topic.
pub fn dead_letter_topic(topic: &str) -> String {
    format!("{}{}", topic, DEAD_LETTER_SUFFIX)
}

/// Errors that can occur during DLQ operations.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("failed to subscribe to dead letter topic {topic}: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: BrokerError,
    },

    #[error("failed to get producer for {topic}: {source}")]
    Producer {
        topic: String,
        #[source]
        source: BrokerError,
    },

    #[error("failed to send to {topic}: {source}")]
    Send {
        topic: String,
        #[source]
        source: BrokerError,
    },
}

/// A message on its way to a dead-letter topic.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub payload: Vec<u8>,
    pub reason: String,
    pub error_detail: String,
    pub original_topic: String,
    pub original_message_id: String,
    pub original_properties: Properties,
}

impl DeadLetter {
    /// Capture a consumed message with the reason it is being dead-lettered.
    pub fn from_message(
        message: &InboundMessage,
        reason: impl Into<String>,
        error_detail: impl Into<String>,
    ) -> Self {
        Self {
            payload: message.payload.clone(),
            reason: reason.into(),
            error_detail: error_detail.into(),
            original_topic: message.topic.clone(),
            original_message_id: message.id.to_string(),
            original_properties: message.properties.clone(),
        }
    }

    /// Provenance properties for the dead-letter message.
    pub fn properties(&self) -> Properties {
        let mut properties = Properties::with_capacity(self.original_properties.len() + 4);
        properties.insert(REASON_PROPERTY.to_string(), self.reason.clone());
        properties.insert(ERROR_DETAIL_PROPERTY.to_string(), self.error_detail.clone());
        properties.insert(
            ORIGINAL_TOPIC_PROPERTY.to_string(),
            self.original_topic.clone(),
        );
        properties.insert(
            ORIGINAL_MESSAGE_ID_PROPERTY.to_string(),
            self.original_message_id.clone(),
        );
        for (key, value) in &self.original_properties {
            properties.insert(format!("{}{}", ORIGINAL_PROPERTY_PREFIX, key), value.clone());
        }
        properties
    }

    pub fn into_message(self) -> OutboundMessage {
        let properties = self.properties();
        OutboundMessage::new(self.payload).with_properties(properties)
    }
}

/// Send `dead_letter` to `topic` through the registry.
///
/// A send failure closes and evicts the dead-letter producer so the next
/// forward starts on a fresh one.
pub async fn forward(
    registry: &ProducerRegistry,
    topic: &str,
    dead_letter: DeadLetter,
) -> Result<(), DlqError> {
    let producer = registry
        .get_or_create(topic)
        .await
        .map_err(|source| DlqError::Producer {
            topic: topic.to_string(),
            source,
        })?;

    let original_topic = dead_letter.original_topic.clone();
    let reason = dead_letter.reason.clone();

    if let Err(source) = producer.send(dead_letter.into_message()).await {
        registry.evict(topic, &producer).await;
        return Err(DlqError::Send {
            topic: topic.to_string(),
            source,
        });
    }

    info!(
        dead_letter_topic = %topic,
        original_topic = %original_topic,
        reason = %reason,
        "Forwarded message to dead letter topic"
    );
    Ok(())
}

/// Drains dead-letter topics back into their targets.
pub struct DeadLetterReprocessor {
    client: Arc<dyn BrokerClient>,
    registry: Arc<ProducerRegistry>,
    keys: Option<Arc<KeyMaterial>>,
    config: DlqConfig,
}

impl DeadLetterReprocessor {
    pub fn new(
        client: Arc<dyn BrokerClient>,
        registry: Arc<ProducerRegistry>,
        keys: Option<Arc<KeyMaterial>>,
        config: DlqConfig,
    ) -> Self {
        Self {
            client,
            registry,
            keys,
            config,
        }
    }

    /// Subscription name the reprocessor drains with.
    pub fn subscription_name(&self) -> String {
        format!(
            "{}{}",
            self.registry.service_name(),
            REPROCESSOR_SUBSCRIPTION_SUFFIX
        )
    }

    /// Republish up to `max_messages` messages from `dlq_topic` to `target_topic`.
    ///
    /// Stops early once no message arrives within the idle timeout. Returns the
    /// number of messages republished and acknowledged. Per-message failures
    /// are negatively acknowledged and skipped; only subscription setup fails
    /// the call.
    #[tracing::instrument(name = "dlq.process", skip(self))]
    pub async fn process(
        &self,
        dlq_topic: &str,
        target_topic: &str,
        max_messages: usize,
    ) -> Result<usize, DlqError> {
        let mut options = SubscribeOptions::shared(vec![dlq_topic.to_string()], self.subscription_name());
        options.decryption = self.keys.clone();
        options.channel_capacity = self.config.channel_capacity;

        let mut subscription =
            self.client
                .subscribe(options)
                .await
                .map_err(|source| DlqError::Subscribe {
                    topic: dlq_topic.to_string(),
                    source,
                })?;
        let consumer = subscription.consumer.clone();

        info!(
            dlq_topic = %dlq_topic,
            target_topic = %target_topic,
            max_messages,
            "Reprocessing dead letter messages"
        );

        let idle_timeout = self.config.idle_timeout();
        let mut processed = 0;

        for _ in 0..max_messages {
            let message =
                match tokio::time::timeout(idle_timeout, subscription.messages.recv()).await {
                    Ok(Some(message)) => message,
                    Ok(None) => {
                        debug!(dlq_topic = %dlq_topic, "Dead letter subscription closed");
                        break;
                    }
                    Err(_) => {
                        debug!(dlq_topic = %dlq_topic, "No more dead letter messages");
                        break;
                    }
                };

            if self.republish(target_topic, &message).await {
                if let Err(e) = consumer.ack(&message).await {
                    warn!(id = %message.id, error = %e, "Failed to ack dead letter message");
                }
                processed += 1;
            } else if let Err(e) = consumer.nack(&message).await {
                warn!(id = %message.id, error = %e, "Failed to nack dead letter message");
            }
        }

        consumer.close().await;

        info!(
            dlq_topic = %dlq_topic,
            target_topic = %target_topic,
            processed,
            "Dead letter reprocessing complete"
        );
        Ok(processed)
    }

    async fn republish(&self, target_topic: &str, message: &InboundMessage) -> bool {
        let producer = match self.registry.get_or_create(target_topic).await {
            Ok(producer) => producer,
            Err(e) => {
                warn!(
                    target_topic = %target_topic,
                    id = %message.id,
                    error = %e,
                    "Failed to get producer for reprocessing"
                );
                return false;
            }
        };

        let outbound =
            OutboundMessage::new(message.payload.clone()).with_properties(message.properties.clone());

        match producer.send(outbound).await {
            Ok(()) => {
                debug!(target_topic = %target_topic, id = %message.id, "Republished dead letter message");
                true
            }
            Err(e) => {
                warn!(
                    target_topic = %target_topic,
                    id = %message.id,
                    error = %e,
                    "Failed to republish dead letter message"
                );
                self.registry.evict(target_topic, &producer).await;
                false
            }
        }
    }
}
