//! Client façade.
//!
//! [`EventClient`] is the single entry point a service uses: connect once,
//! then publish, listen and replay dead letters over that connection.
//!
//! ```ignore
//! let client = EventClient::new(Config::load(None)?, Arc::new(PulsarConnector));
//! client.connect().await?;
//! client.publish_event("orders", "OrderPlaced", &order).await?;
//! let listeners = client
//!     .listen_on_topics(&client.topics()?, "billing", Arc::new(router))
//!     .await?;
//! ```

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::broker::{BrokerConnector, BrokerError, Producer};
use crate::config::{Config, ConfigError};
use crate::connection::{ConnectError, Connection, ConnectionManager};
use crate::consumer::{ConsumerError, ConsumerSupervisor, ListenerGroup};
use crate::dlq::{DeadLetterReprocessor, DlqError};
use crate::envelope::EventEnvelope;
use crate::handlers::EventHandler;
use crate::publisher::{PublishError, Publisher};

/// Errors surfaced by [`EventClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("client is not connected; call connect() first")]
    NotConnected,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Consumer(#[from] ConsumerError),

    #[error(transparent)]
    Dlq(#[from] DlqError),
}

/// Messaging client owning one broker connection.
pub struct EventClient {
    manager: ConnectionManager,
}

impl EventClient {
    pub fn new(config: Config, connector: Arc<dyn BrokerConnector>) -> Self {
        Self {
            manager: ConnectionManager::new(config, connector),
        }
    }

    pub fn config(&self) -> &Config {
        self.manager.config()
    }

    /// Connect to the broker. Idempotent.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.manager.connect().await?;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.manager.get().is_some()
    }

    /// Topics from the `EVENT_TOPICS` setting.
    pub fn topics(&self) -> Result<Vec<String>, ClientError> {
        Ok(self.config().topics()?)
    }

    /// Publish `payload` as `event_type` on `topic`, retrying on failure.
    pub async fn publish_event<T>(
        &self,
        topic: &str,
        event_type: &str,
        payload: &T,
    ) -> Result<(), ClientError>
    where
        T: Serialize + ?Sized + Sync,
    {
        self.publisher()?
            .publish_event(topic, event_type, payload)
            .await?;
        Ok(())
    }

    /// Publish a caller-built envelope to its topic.
    pub async fn publish_envelope<T>(&self, envelope: &EventEnvelope<T>) -> Result<(), ClientError>
    where
        T: Serialize + Sync,
    {
        self.publisher()?.publish_envelope(envelope).await?;
        Ok(())
    }

    /// Start consuming `topics` under `subscription_name`.
    pub async fn listen_on_topics(
        &self,
        topics: &[String],
        subscription_name: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<ListenerGroup, ClientError> {
        let connection = self.connection()?;
        let supervisor = ConsumerSupervisor::new(
            connection.client().clone(),
            connection.producers().clone(),
            connection.keys().cloned(),
            self.config().consumer.clone(),
        );
        Ok(supervisor
            .listen_on_topics(topics, subscription_name, handler)
            .await?)
    }

    /// Drain up to `max_messages` from `dlq_topic` back into `target_topic`.
    pub async fn process_dlq_messages(
        &self,
        dlq_topic: &str,
        target_topic: &str,
        max_messages: usize,
    ) -> Result<usize, ClientError> {
        let connection = self.connection()?;
        let reprocessor = DeadLetterReprocessor::new(
            connection.client().clone(),
            connection.producers().clone(),
            connection.keys().cloned(),
            self.config().dlq.clone(),
        );
        Ok(reprocessor
            .process(dlq_topic, target_topic, max_messages)
            .await?)
    }

    /// The cached producer for `topic`, created on first use.
    pub async fn get_or_create_producer(
        &self,
        topic: &str,
    ) -> Result<Arc<dyn Producer>, ClientError> {
        Ok(self.connection()?.producers().get_or_create(topic).await?)
    }

    /// Close every producer of the connection.
    pub async fn close(&self) {
        if let Some(connection) = self.manager.get() {
            connection.producers().close_all().await;
            info!(service = %connection.service_name(), "Client closed");
        }
    }

    fn connection(&self) -> Result<Arc<Connection>, ClientError> {
        self.manager.get().ok_or(ClientError::NotConnected)
    }

    fn publisher(&self) -> Result<Publisher, ClientError> {
        let connection = self.connection()?;
        Ok(Publisher::new(
            connection.producers().clone(),
            self.config().publish.clone(),
        ))
    }
}
