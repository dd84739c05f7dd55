use super::*;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use async_trait::async_trait;

use crate::broker::{InMemoryBroker, Properties};
use crate::envelope::{EventEnvelope, EventHeader};
use crate::handlers::HandlerError;

#[derive(Default)]
struct SlowHandler {
    started: AtomicUsize,
    finished: AtomicUsize,
    delay: Duration,
}

#[async_trait]
impl EventHandler for SlowHandler {
    async fn handle_event(&self, _header: &EventHeader) -> Result<(), HandlerError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn supervisor(broker: &InMemoryBroker, workers: usize) -> ConsumerSupervisor {
    let registry = Arc::new(ProducerRegistry::new(
        Arc::new(broker.clone()),
        "billing",
        None,
        Duration::from_secs(1),
    ));
    ConsumerSupervisor::new(
        Arc::new(broker.clone()),
        registry,
        None,
        ConsumerConfig {
            workers,
            channel_capacity: 16,
            max_deliveries: 3,
        },
    )
}

async fn publish(broker: &InMemoryBroker, topic: &str, count: usize) {
    for i in 0..count {
        let bytes = EventEnvelope::new(topic, "Tick", i).to_bytes().unwrap();
        broker.publish_raw(topic, bytes, Properties::new()).await;
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_listen_on_topics_starts_workers_per_topic() {
    let broker = InMemoryBroker::new();
    let handler = Arc::new(SlowHandler::default());

    let group = supervisor(&broker, 3)
        .listen_on_topics(&["a".to_string(), "b".to_string()], "sub", handler.clone())
        .await
        .unwrap();

    assert_eq!(group.topics(), vec!["a", "b"]);
    assert_eq!(group.worker_count(), 6);
    assert!(broker.has_subscription("a.dead_letter", "sub").await);
    assert!(broker.has_subscription("b.dead_letter", "sub").await);

    publish(&broker, "a", 5).await;
    publish(&broker, "b", 5).await;
    wait_for(|| handler.finished.load(Ordering::SeqCst) == 10).await;

    group.shutdown().await;
    assert_eq!(broker.backlog("a", "sub").await, 0);
    assert_eq!(broker.backlog("b", "sub").await, 0);
}

#[tokio::test]
async fn test_empty_topic_list_is_rejected() {
    let broker = InMemoryBroker::new();
    let result = supervisor(&broker, 1)
        .listen_on_topics(&[], "sub", Arc::new(SlowHandler::default()))
        .await;

    assert!(matches!(result, Err(ConsumerError::NoTopics)));
}

#[tokio::test]
async fn test_setup_failure_stops_started_topics() {
    let broker = InMemoryBroker::new();
    broker.fail_subscriptions("b").await;
    let handler = Arc::new(SlowHandler::default());

    let result = supervisor(&broker, 2)
        .listen_on_topics(&["a".to_string(), "b".to_string()], "sub", handler.clone())
        .await;

    match result {
        Err(ConsumerError::Subscribe { topic, .. }) => assert_eq!(topic, "b"),
        Err(other) => panic!("Expected Subscribe error, got {:?}", other),
        Ok(_) => panic!("Expected Subscribe error, got a running group"),
    }

    // Topic "a" is no longer consumed.
    publish(&broker, "a", 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handler.started.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_messages() {
    let broker = InMemoryBroker::new();
    let handler = Arc::new(SlowHandler {
        delay: Duration::from_millis(100),
        ..Default::default()
    });

    let group = supervisor(&broker, 2)
        .listen_on_topics(&["a".to_string()], "sub", handler.clone())
        .await
        .unwrap();

    publish(&broker, "a", 2).await;
    wait_for(|| handler.started.load(Ordering::SeqCst) == 2).await;

    group.shutdown().await;

    assert_eq!(handler.finished.load(Ordering::SeqCst), 2);
    assert_eq!(broker.backlog("a", "sub").await, 0);
}

#[tokio::test]
async fn test_consumer_names_are_sequenced() {
    let broker = InMemoryBroker::new();
    let supervisor = supervisor(&broker, 1);
    let pid = std::process::id();

    assert_eq!(
        supervisor.next_consumer_name(),
        format!("billing-consumer-{}-00", pid)
    );
    assert_eq!(
        supervisor.next_consumer_name(),
        format!("billing-consumer-{}-01", pid)
    );
}
