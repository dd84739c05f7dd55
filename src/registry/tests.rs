use super::*;
use crate::broker::{BrokerError, InMemoryBroker, OutboundMessage};

fn registry(broker: &InMemoryBroker) -> ProducerRegistry {
    ProducerRegistry::new(
        Arc::new(broker.clone()),
        "billing",
        None,
        Duration::from_secs(1),
    )
}

#[tokio::test]
async fn test_concurrent_get_or_create_builds_one_producer() {
    let broker = InMemoryBroker::new();
    let registry = Arc::new(registry(&broker));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get_or_create("invoices").await.unwrap() })
        })
        .collect();

    let mut producers = Vec::new();
    for handle in handles {
        producers.push(handle.await.unwrap());
    }

    assert_eq!(broker.producers_created(), 1);
    assert_eq!(registry.len().await, 1);
    for producer in &producers {
        assert!(broker::same_producer(producer, &producers[0]));
    }
}

#[tokio::test]
async fn test_producer_name_uses_service_pid_and_sequence() {
    let broker = InMemoryBroker::new();
    let registry = registry(&broker);

    let first = registry.get_or_create("a").await.unwrap();
    let second = registry.get_or_create("b").await.unwrap();

    let pid = std::process::id();
    assert_eq!(first.name(), format!("billing-producer-{}-00", pid));
    assert_eq!(second.name(), format!("billing-producer-{}-01", pid));
}

#[tokio::test]
async fn test_creation_failure_registers_nothing() {
    let broker = InMemoryBroker::new();
    broker.fail_producer_creation("invoices", 1).await;
    let registry = registry(&broker);

    let result = registry.get_or_create("invoices").await;

    assert!(matches!(result, Err(BrokerError::CreateProducer { .. })));
    assert!(!registry.contains("invoices").await);

    registry.get_or_create("invoices").await.unwrap();
    assert!(registry.contains("invoices").await);
}

#[tokio::test]
async fn test_evict_closes_and_removes() {
    let broker = InMemoryBroker::new();
    let registry = registry(&broker);
    let producer = registry.get_or_create("invoices").await.unwrap();

    registry.evict("invoices", &producer).await;

    assert!(registry.is_empty().await);
    assert_eq!(broker.producers_closed(), 1);
    assert!(producer.send(OutboundMessage::new(vec![1])).await.is_err());

    let fresh = registry.get_or_create("invoices").await.unwrap();
    assert!(!broker::same_producer(&fresh, &producer));
    assert_eq!(broker.producers_created(), 2);
}

#[tokio::test]
async fn test_evict_keeps_replacement_handle() {
    let broker = InMemoryBroker::new();
    let registry = registry(&broker);
    let stale = registry.get_or_create("invoices").await.unwrap();
    registry.evict("invoices", &stale).await;
    let current = registry.get_or_create("invoices").await.unwrap();

    // A second caller reporting the same stale handle must not drop the new one.
    registry.evict("invoices", &stale).await;

    assert!(registry.contains("invoices").await);
    let again = registry.get_or_create("invoices").await.unwrap();
    assert!(broker::same_producer(&again, &current));
}

#[tokio::test]
async fn test_close_all_closes_every_producer() {
    let broker = InMemoryBroker::new();
    let registry = registry(&broker);
    registry.get_or_create("a").await.unwrap();
    registry.get_or_create("b").await.unwrap();

    registry.close_all().await;

    assert!(registry.is_empty().await);
    assert_eq!(broker.producers_closed(), 2);
}
