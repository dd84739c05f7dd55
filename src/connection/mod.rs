//! One-time broker connection.
//!
//! [`ConnectionManager::connect`] validates the configuration, loads key
//! material, connects the broker client and builds the connection's
//! [`ProducerRegistry`]. Repeated and concurrent calls share one
//! initialisation; a failed attempt leaves the manager unconnected so a later
//! call may retry.

use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::info;

use crate::broker::{BrokerClient, BrokerConnector, BrokerError, ConnectOptions};
use crate::config::Config;
use crate::crypto::{KeyError, KeyMaterial};
use crate::registry::ProducerRegistry;

/// Connection errors. All are fatal for a service.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("broker URL is not configured (pulsar.url / PULSAR.URL)")]
    MissingBrokerUrl,

    #[error("service name is not configured (app.service.name / APP.SERVICE.NAME)")]
    MissingServiceName,

    #[error("invalid encryption key material: {0}")]
    Key(#[from] KeyError),

    #[error("failed to create broker client: {0}")]
    Client(#[source] BrokerError),
}

/// A live broker connection.
pub struct Connection {
    client: Arc<dyn BrokerClient>,
    keys: Option<Arc<KeyMaterial>>,
    producers: Arc<ProducerRegistry>,
    service_name: String,
}

impl Connection {
    pub fn client(&self) -> &Arc<dyn BrokerClient> {
        &self.client
    }

    /// Key material, when end-to-end encryption is enabled.
    pub fn keys(&self) -> Option<&Arc<KeyMaterial>> {
        self.keys.as_ref()
    }

    pub fn producers(&self) -> &Arc<ProducerRegistry> {
        &self.producers
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}

/// Establishes and holds the connection.
pub struct ConnectionManager {
    config: Config,
    connector: Arc<dyn BrokerConnector>,
    connection: OnceCell<Arc<Connection>>,
}

impl ConnectionManager {
    pub fn new(config: Config, connector: Arc<dyn BrokerConnector>) -> Self {
        Self {
            config,
            connector,
            connection: OnceCell::new(),
        }
    }

    /// Connect once; later calls return the same connection.
    pub async fn connect(&self) -> Result<Arc<Connection>, ConnectError> {
        self.connection
            .get_or_try_init(|| self.establish())
            .await
            .cloned()
    }

    /// The connection, if [`connect`](Self::connect) has succeeded.
    pub fn get(&self) -> Option<Arc<Connection>> {
        self.connection.get().cloned()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn establish(&self) -> Result<Arc<Connection>, ConnectError> {
        let broker = &self.config.pulsar;
        let url = broker
            .url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConnectError::MissingBrokerUrl)?;
        let service_name = self
            .config
            .service_name()
            .ok_or(ConnectError::MissingServiceName)?;

        let keys = KeyMaterial::from_parts(
            broker.pubkey.as_deref(),
            broker.privkey.as_deref(),
            broker.encryption.key.as_deref(),
        )?
        .map(Arc::new);

        match &keys {
            Some(keys) => info!(key_name = %keys.key_name(), "End-to-end encryption enabled"),
            None => info!("Encryption keys not configured, sending plaintext"),
        }

        let client = self
            .connector
            .connect(&ConnectOptions {
                url: url.to_string(),
                operation_timeout: broker.operation_timeout(),
                connection_timeout: broker.connection_timeout(),
                key_material: keys.clone(),
            })
            .await
            .map_err(ConnectError::Client)?;

        let producers = Arc::new(ProducerRegistry::new(
            client.clone(),
            service_name,
            keys.clone(),
            broker.send_timeout(),
        ));

        info!(url = %url, service = %service_name, "Broker connection established");

        Ok(Arc::new(Connection {
            client,
            keys,
            producers,
            service_name: service_name.to_string(),
        }))
    }
}

#[cfg(test)]
mod tests;
