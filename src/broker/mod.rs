//! Broker-client contract.
//!
//! The core never speaks a broker wire protocol. It talks to a collaborator
//! through these traits:
//!
//! ```text
//! ┌──────────────────┐  connect   ┌──────────────────┐
//! │ BrokerConnector  │ ─────────▶ │   BrokerClient   │
//! └──────────────────┘            └──────────────────┘
//!                          create_producer │      │ subscribe
//!                                          ▼      ▼
//!                              ┌──────────────┐ ┌────────────────────────┐
//!                              │   Producer   │ │ Subscription           │
//!                              │ send / close │ │  consumer: ack/nack    │
//!                              └──────────────┘ │  messages: mpsc::Recv  │
//!                                               └────────────────────────┘
//! ```
//!
//! Implementations:
//! - [`memory::InMemoryBroker`]: in-process broker (tests, local runs)
//! - `pulsar::PulsarConnector`: Apache Pulsar (feature `pulsar`)

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::crypto::KeyMaterial;

pub mod memory;
#[cfg(feature = "pulsar")]
pub mod pulsar;

pub use memory::InMemoryBroker;
#[cfg(feature = "pulsar")]
pub use self::pulsar::PulsarConnector;

/// Message properties (string key/value metadata).
pub type Properties = HashMap<String, String>;

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors reported by a broker client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Failed to create producer for topic {topic}: {message}")]
    CreateProducer { topic: String, message: String },

    #[error("Send to topic {topic} failed: {message}")]
    Send { topic: String, message: String },

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Acknowledgement failed: {0}")]
    Acknowledge(String),

    #[error("{0} is closed")]
    Closed(String),

    #[error("End-to-end encryption is not supported by the {0} backend")]
    EncryptionUnsupported(&'static str),
}

/// Broker-assigned message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message to send.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutboundMessage {
    pub payload: Vec<u8>,
    pub properties: Properties,
}

impl OutboundMessage {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            properties: Properties::new(),
        }
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }
}

/// A message received from a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub id: MessageId,
    /// Topic the message was published to.
    pub topic: String,
    pub payload: Vec<u8>,
    pub properties: Properties,
}

/// Subscription sharing mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SubscriptionType {
    Exclusive,
    /// Competing consumers: each message goes to one consumer of the subscription.
    #[default]
    Shared,
    Failover,
}

/// What a consumer does with a message it cannot decrypt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CryptoFailureAction {
    /// Hold the message back until decryption succeeds.
    Fail,
    /// Acknowledge silently without delivering.
    #[default]
    Discard,
    /// Deliver the still-encrypted payload.
    Consume,
}

/// Broker-side redelivery cap with automatic dead-letter routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterPolicy {
    /// Total deliveries before the broker routes the message to `dead_letter_topic`.
    pub max_deliveries: u32,
    pub dead_letter_topic: String,
    /// Subscription created on the dead-letter topic so routed messages are retained.
    pub initial_subscription_name: Option<String>,
}

/// Connection parameters handed to a [`BrokerConnector`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub url: String,
    pub operation_timeout: Duration,
    pub connection_timeout: Duration,
    pub key_material: Option<Arc<KeyMaterial>>,
}

/// Parameters for creating a producer.
#[derive(Debug, Clone)]
pub struct ProducerOptions {
    pub topic: String,
    pub name: String,
    /// Encrypt with these keys when set.
    pub encryption: Option<Arc<KeyMaterial>>,
    pub send_timeout: Duration,
}

/// Parameters for a subscription.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub topics: Vec<String>,
    pub subscription_name: String,
    pub consumer_name: Option<String>,
    pub subscription_type: SubscriptionType,
    pub dead_letter: Option<DeadLetterPolicy>,
    /// Decrypt with these keys when set.
    pub decryption: Option<Arc<KeyMaterial>>,
    pub crypto_failure_action: CryptoFailureAction,
    /// Capacity of the bounded delivery channel.
    pub channel_capacity: usize,
}

impl SubscribeOptions {
    /// Shared subscription on the given topics with default settings.
    pub fn shared(topics: Vec<String>, subscription_name: impl Into<String>) -> Self {
        Self {
            topics,
            subscription_name: subscription_name.into(),
            consumer_name: None,
            subscription_type: SubscriptionType::Shared,
            dead_letter: None,
            decryption: None,
            crypto_failure_action: CryptoFailureAction::default(),
            channel_capacity: 1000,
        }
    }
}

/// A per-topic send handle.
#[async_trait]
pub trait Producer: Send + Sync {
    fn topic(&self) -> &str;

    fn name(&self) -> &str;

    /// Send a message and wait for the broker's acknowledgement.
    async fn send(&self, message: OutboundMessage) -> Result<()>;

    /// Release the handle. Sends after close fail.
    async fn close(&self);
}

/// Consumer side of a subscription.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Positive acknowledgement: the message is delivered.
    async fn ack(&self, message: &InboundMessage) -> Result<()>;

    /// Negative acknowledgement: the message is eligible for redelivery.
    async fn nack(&self, message: &InboundMessage) -> Result<()>;

    /// Stop delivery and close the delivery channel.
    async fn close(&self);
}

/// A live subscription: the consumer plus the channel it delivers into.
pub struct Subscription {
    pub consumer: Arc<dyn Consumer>,
    pub messages: mpsc::Receiver<InboundMessage>,
}

/// Broker client: creates producers and subscriptions.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn create_producer(&self, options: ProducerOptions) -> Result<Arc<dyn Producer>>;

    async fn subscribe(&self, options: SubscribeOptions) -> Result<Subscription>;
}

/// Establishes a [`BrokerClient`].
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn BrokerClient>>;
}

/// Compare two producer handles by identity.
pub(crate) fn same_producer(a: &Arc<dyn Producer>, b: &Arc<dyn Producer>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const u8,
        Arc::as_ptr(b) as *const u8,
    )
}
