use super::*;
use std::time::Duration;

use crate::broker::InMemoryBroker;
use crate::envelope::EventHeader;

fn publisher(broker: &InMemoryBroker) -> Publisher {
    let registry = Arc::new(ProducerRegistry::new(
        Arc::new(broker.clone()),
        "billing",
        None,
        Duration::from_secs(1),
    ));
    Publisher::new(
        registry,
        PublishConfig {
            max_retries: 5,
            retry_delay_ms: 1,
        },
    )
}

#[derive(Serialize)]
struct InvoiceIssued {
    invoice_id: u32,
}

#[tokio::test]
async fn test_publish_wraps_payload_in_envelope() {
    let broker = InMemoryBroker::new();

    publisher(&broker)
        .publish_event("invoices", "InvoiceIssued", &InvoiceIssued { invoice_id: 9 })
        .await
        .unwrap();

    let published = broker.published("invoices").await;
    assert_eq!(published.len(), 1);
    let header = EventHeader::parse(&published[0]).unwrap();
    assert_eq!(header.topic, "invoices");
    assert_eq!(header.event_type, "InvoiceIssued");
    assert_eq!(header.raw_payload(), Some(r#"{"invoice_id":9}"#));
}

#[tokio::test]
async fn test_publish_envelope_keeps_timestamp() {
    let broker = InMemoryBroker::new();
    let envelope = EventEnvelope::with_timestamp("invoices", "InvoiceVoided", 1234, "inv-1");

    publisher(&broker).publish_envelope(&envelope).await.unwrap();

    let header = EventHeader::parse(&broker.published("invoices").await[0]).unwrap();
    assert_eq!(header.timestamp, 1234);
}

#[tokio::test]
async fn test_transient_failures_recreate_producer() {
    for failures in 1..=5u32 {
        let broker = InMemoryBroker::new();
        broker.fail_sends("invoices", failures).await;

        publisher(&broker)
            .publish_event("invoices", "InvoiceIssued", &InvoiceIssued { invoice_id: 1 })
            .await
            .unwrap();

        assert_eq!(broker.producers_closed(), failures as usize);
        assert_eq!(broker.producers_created(), failures as usize + 1);
        assert_eq!(broker.published("invoices").await.len(), 1);
    }
}

#[tokio::test]
async fn test_retries_exhausted_after_six_attempts() {
    let broker = InMemoryBroker::new();
    broker.fail_sends("invoices", 6).await;

    let result = publisher(&broker)
        .publish_event("invoices", "InvoiceIssued", &InvoiceIssued { invoice_id: 1 })
        .await;

    match result {
        Err(PublishError::RetriesExhausted { topic, attempts, .. }) => {
            assert_eq!(topic, "invoices");
            assert_eq!(attempts, 6);
        }
        other => panic!("Expected RetriesExhausted, got {:?}", other),
    }
    assert_eq!(broker.producers_created(), 6);
    assert_eq!(broker.producers_closed(), 5);
    assert!(broker.published("invoices").await.is_empty());
}

#[tokio::test]
async fn test_producer_creation_failure_is_reported() {
    let broker = InMemoryBroker::new();
    broker.fail_producer_creation("invoices", 1).await;

    let result = publisher(&broker)
        .publish_event("invoices", "InvoiceIssued", &InvoiceIssued { invoice_id: 1 })
        .await;

    assert!(matches!(
        result,
        Err(PublishError::Producer { attempt: 1, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_retry_waits_configured_delay() {
    let broker = InMemoryBroker::new();
    broker.fail_sends("invoices", 2).await;
    let registry = Arc::new(ProducerRegistry::new(
        Arc::new(broker.clone()),
        "billing",
        None,
        Duration::from_secs(1),
    ));
    let publisher = Publisher::new(
        registry,
        PublishConfig {
            max_retries: 5,
            retry_delay_ms: 1000,
        },
    );

    let started = tokio::time::Instant::now();
    publisher
        .publish_event("invoices", "InvoiceIssued", &InvoiceIssued { invoice_id: 1 })
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_secs(2));
}
