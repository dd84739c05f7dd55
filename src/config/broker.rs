//! Broker connection and service identity configuration.

use std::time::Duration;

use serde::Deserialize;

/// Default operation and connection timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Pulsar connection configuration (`pulsar.*`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker service URL, e.g. `pulsar://localhost:6650`.
    pub url: Option<String>,
    /// Public key PEM (SubjectPublicKeyInfo). Literal `\n` sequences are accepted.
    pub pubkey: Option<String>,
    /// Private key PEM (PKCS#8 or PKCS#1).
    pub privkey: Option<String>,
    pub encryption: EncryptionConfig,
    pub operation_timeout_secs: u64,
    pub connection_timeout_secs: u64,
    /// How long a send waits for the broker receipt.
    pub send_timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: None,
            pubkey: None,
            privkey: None,
            encryption: EncryptionConfig::default(),
            operation_timeout_secs: DEFAULT_TIMEOUT_SECS,
            connection_timeout_secs: DEFAULT_TIMEOUT_SECS,
            send_timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl BrokerConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

/// Encryption key selection (`pulsar.encryption.*`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Name of the key producers encrypt with.
    pub key: Option<String>,
}

/// Application identity (`app.*`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceIdentity,
}

/// Logical service identity (`app.service.*`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceIdentity {
    /// Prefix for producer, consumer and subscription names.
    pub name: Option<String>,
}
