use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::broker::{InMemoryBroker, OutboundMessage};

const PUBLIC_PEM: &str = include_str!("../../tests/fixtures/rsa_public.pem");
const PRIVATE_PEM: &str = include_str!("../../tests/fixtures/rsa_private_pkcs8.pem");

/// Connector that counts connects and can refuse them.
#[derive(Default)]
struct CountingConnector {
    broker: InMemoryBroker,
    connects: AtomicUsize,
    refuse: bool,
}

#[async_trait]
impl BrokerConnector for CountingConnector {
    async fn connect(&self, options: &ConnectOptions) -> crate::broker::Result<Arc<dyn BrokerClient>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if self.refuse {
            return Err(BrokerError::Connection("refused".to_string()));
        }
        self.broker.connect(options).await
    }
}

fn config() -> Config {
    Config::for_service("pulsar://localhost:6650", "billing")
}

#[tokio::test]
async fn test_concurrent_connects_share_one_connection() {
    let connector = Arc::new(CountingConnector::default());
    let manager = Arc::new(ConnectionManager::new(config(), connector.clone()));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect().await.unwrap() })
        })
        .collect();
    let mut connections = Vec::new();
    for handle in handles {
        connections.push(handle.await.unwrap());
    }

    assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    for connection in &connections {
        assert!(Arc::ptr_eq(connection, &connections[0]));
    }
    assert_eq!(connections[0].service_name(), "billing");
    assert!(connections[0].keys().is_none());
}

#[tokio::test]
async fn test_missing_url_is_fatal() {
    let mut config = config();
    config.pulsar.url = None;
    let manager = ConnectionManager::new(config, Arc::new(InMemoryBroker::new()));

    assert!(matches!(
        manager.connect().await,
        Err(ConnectError::MissingBrokerUrl)
    ));
    assert!(manager.get().is_none());
}

#[tokio::test]
async fn test_missing_service_name_is_fatal() {
    let mut config = config();
    config.app.service.name = None;
    let manager = ConnectionManager::new(config, Arc::new(InMemoryBroker::new()));

    assert!(matches!(
        manager.connect().await,
        Err(ConnectError::MissingServiceName)
    ));
}

#[tokio::test]
async fn test_invalid_key_material_is_fatal() {
    let mut config = config();
    config.pulsar.pubkey = Some("not a key".to_string());
    config.pulsar.privkey = Some(PRIVATE_PEM.to_string());
    config.pulsar.encryption.key = Some("k1".to_string());
    let manager = ConnectionManager::new(config, Arc::new(InMemoryBroker::new()));

    assert!(matches!(
        manager.connect().await,
        Err(ConnectError::Key(KeyError::PublicKey(_)))
    ));
}

#[tokio::test]
async fn test_client_failure_can_be_retried() {
    let refusing = Arc::new(CountingConnector {
        refuse: true,
        ..Default::default()
    });
    let manager = ConnectionManager::new(config(), refusing.clone());

    assert!(matches!(
        manager.connect().await,
        Err(ConnectError::Client(_))
    ));
    assert!(matches!(
        manager.connect().await,
        Err(ConnectError::Client(_))
    ));
    assert_eq!(refusing.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_keys_flow_to_producers() {
    let broker = InMemoryBroker::new();
    let mut config = config();
    config.pulsar.pubkey = Some(PUBLIC_PEM.replace('\n', "\\n"));
    config.pulsar.privkey = Some(PRIVATE_PEM.replace('\n', "\\n"));
    config.pulsar.encryption.key = Some("k1".to_string());
    let manager = ConnectionManager::new(config, Arc::new(broker.clone()));

    let connection = manager.connect().await.unwrap();
    assert_eq!(connection.keys().unwrap().key_name(), "k1");

    let producer = connection.producers().get_or_create("secure").await.unwrap();
    producer.send(OutboundMessage::new(vec![1])).await.unwrap();

    assert_eq!(
        broker.encryption_keys("secure").await,
        vec![Some("k1".to_string())]
    );
}

#[tokio::test]
async fn test_partial_key_material_means_plaintext() {
    let mut config = config();
    config.pulsar.pubkey = Some(PUBLIC_PEM.to_string());
    let manager = ConnectionManager::new(config, Arc::new(InMemoryBroker::new()));

    assert!(manager.connect().await.unwrap().keys().is_none());
}
