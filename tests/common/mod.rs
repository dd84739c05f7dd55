//! Shared utilities for integration tests.
//!
//! Builds clients over the in-memory broker and provides recording handlers.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use athari_events::broker::InMemoryBroker;
use athari_events::config::{ConsumerConfig, DlqConfig, PublishConfig};
use athari_events::{Config, EventClient, EventHandler, EventHeader, HandlerError};

pub const SERVICE: &str = "billing";

/// Configuration with short delays and small pools for tests.
pub fn test_config(topics: &str) -> Config {
    let mut config = Config::for_service("memory://local", SERVICE);
    config.event_topics = Some(topics.to_string());
    config.publish = PublishConfig {
        max_retries: 5,
        retry_delay_ms: 1,
    };
    config.consumer = ConsumerConfig {
        workers: 4,
        channel_capacity: 32,
        max_deliveries: 3,
    };
    config.dlq = DlqConfig {
        idle_timeout_ms: 100,
        channel_capacity: 100,
    };
    config
}

/// Connected client over a fresh in-memory broker.
pub async fn connected_client(topics: &str) -> (InMemoryBroker, EventClient) {
    let broker = InMemoryBroker::new();
    let client = EventClient::new(test_config(topics), Arc::new(broker.clone()));
    client.connect().await.expect("connect to in-memory broker");
    (broker, client)
}

/// Records every header it is handed.
#[derive(Default)]
pub struct RecordingHandler {
    pub events: Mutex<Vec<EventHeader>>,
}

impl RecordingHandler {
    pub async fn event_types(&self) -> Vec<String> {
        self.events
            .lock()
            .await
            .iter()
            .map(|h| h.event_type.clone())
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.events.lock().await.len()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle_event(&self, header: &EventHeader) -> Result<(), HandlerError> {
        self.events.lock().await.push(header.clone());
        Ok(())
    }
}

/// Fails every event and counts the attempts.
#[derive(Default)]
pub struct FailingHandler {
    pub attempts: AtomicUsize,
}

impl FailingHandler {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for FailingHandler {
    async fn handle_event(&self, _header: &EventHeader) -> Result<(), HandlerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(HandlerError::Failed("downstream unavailable".to_string()))
    }
}

/// Poll `condition` until it holds or a few seconds pass.
pub async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached in time");
}
