//! Per-topic producer cache.
//!
//! At most one producer exists per topic. Lookups take the read lock; a miss
//! upgrades to the write lock, re-checks, and only then creates. Producers
//! leave the registry on send failure ([`ProducerRegistry::evict`]) or on
//! shutdown ([`ProducerRegistry::close_all`]).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::broker::{self, BrokerClient, Producer, ProducerOptions};
use crate::crypto::KeyMaterial;

/// Cache of producer handles keyed by topic.
pub struct ProducerRegistry {
    client: Arc<dyn BrokerClient>,
    service_name: String,
    keys: Option<Arc<KeyMaterial>>,
    send_timeout: Duration,
    producers: RwLock<HashMap<String, Arc<dyn Producer>>>,
    sequence: AtomicU64,
}

impl ProducerRegistry {
    pub fn new(
        client: Arc<dyn BrokerClient>,
        service_name: impl Into<String>,
        keys: Option<Arc<KeyMaterial>>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            client,
            service_name: service_name.into(),
            keys,
            send_timeout,
            producers: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
        }
    }

    /// Return the cached producer for `topic`, creating it on first use.
    ///
    /// Concurrent callers for the same topic all receive the same handle.
    pub async fn get_or_create(&self, topic: &str) -> broker::Result<Arc<dyn Producer>> {
        if let Some(producer) = self.producers.read().await.get(topic) {
            return Ok(producer.clone());
        }

        let mut producers = self.producers.write().await;
        if let Some(producer) = producers.get(topic) {
            return Ok(producer.clone());
        }

        let name = self.next_name();
        let producer = self
            .client
            .create_producer(ProducerOptions {
                topic: topic.to_string(),
                name: name.clone(),
                encryption: self.keys.clone(),
                send_timeout: self.send_timeout,
            })
            .await?;

        info!(
            topic = %topic,
            producer = %name,
            encrypted = self.keys.is_some(),
            "Created producer"
        );

        producers.insert(topic.to_string(), producer.clone());
        Ok(producer)
    }

    /// Close `failed` and drop it from the registry.
    ///
    /// The entry is only removed while it still refers to `failed`, so a
    /// handle another caller installed in the meantime survives.
    pub async fn evict(&self, topic: &str, failed: &Arc<dyn Producer>) {
        let mut producers = self.producers.write().await;
        failed.close().await;

        match producers.get(topic) {
            Some(current) if broker::same_producer(current, failed) => {
                producers.remove(topic);
                debug!(topic = %topic, producer = %failed.name(), "Evicted producer");
            }
            Some(_) => {
                debug!(topic = %topic, "Producer already replaced, keeping current entry");
            }
            None => {}
        }
    }

    /// Close every producer and empty the registry.
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.producers.write().await.drain().collect();
        for (topic, producer) in drained {
            producer.close().await;
            debug!(topic = %topic, "Closed producer");
        }
        if !self.producers.read().await.is_empty() {
            warn!("Producers were created during shutdown");
        }
    }

    pub async fn len(&self) -> usize {
        self.producers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.producers.read().await.is_empty()
    }

    pub async fn contains(&self, topic: &str) -> bool {
        self.producers.read().await.contains_key(topic)
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    fn next_name(&self) -> String {
        format!(
            "{}-producer-{}-{:02}",
            self.service_name,
            std::process::id(),
            self.sequence.fetch_add(1, Ordering::Relaxed)
        )
    }
}

#[cfg(test)]
mod tests;
