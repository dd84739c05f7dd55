//! athari-events - topic-based event messaging client.
//!
//! Publishes JSON event envelopes with retry over a per-topic producer pool,
//! consumes topics with bounded worker pools, routes poison messages to
//! dead-letter topics and replays them on demand.
//!
//! ```text
//!  EventClient
//!   ├─ ConnectionManager ──▶ BrokerConnector ──▶ BrokerClient
//!   │     └─ ProducerRegistry (one producer per topic)
//!   ├─ Publisher            (retry, evict, recreate)
//!   ├─ ConsumerSupervisor   (subscription + workers per topic)
//!   │     └─ MessageProcessor ──▶ EventHandler / EventRouter
//!   └─ DeadLetterReprocessor
//! ```
//!
//! The in-memory broker supports end-to-end encryption. The Pulsar backend
//! (feature `pulsar`) does not: connecting it with key material configured
//! fails with [`broker::BrokerError::EncryptionUnsupported`], so leave the
//! `pulsar.pubkey`, `pulsar.privkey` and `pulsar.encryption.key` settings
//! unset when deploying against Pulsar.

pub mod broker;
pub mod client;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod crypto;
pub mod dispatch;
pub mod dlq;
pub mod envelope;
pub mod handlers;
pub mod publisher;
pub mod registry;
pub mod utils;

pub use client::{ClientError, EventClient};
pub use config::Config;
pub use dispatch::EventRouter;
pub use envelope::{EnvelopeError, EventEnvelope, EventHeader};
pub use handlers::{EventHandler, HandlerError};
