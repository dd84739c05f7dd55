//! Concurrent topic consumption.
//!
//! For each topic, [`ConsumerSupervisor::listen_on_topics`] opens one shared
//! subscription (with a dead-letter policy routing to `{topic}.dead_letter`)
//! and starts a fixed pool of worker tasks that all read the subscription's
//! bounded delivery channel:
//!
//! ```text
//!  broker ──▶ mpsc (capacity N) ──▶ worker 0 ─┐
//!                                 ├▶ worker 1 ─┼─▶ MessageProcessor ─▶ ack / nack / DLQ
//!                                 └▶ worker K ─┘
//! ```
//!
//! The returned [`ListenerGroup`] owns the workers. Shutdown cancels them,
//! waits for each to finish the message it is processing, then closes the
//! consumers.

pub mod processor;

pub use processor::{Disposition, MessageProcessor};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::broker::{
    BrokerClient, BrokerError, Consumer, CryptoFailureAction, DeadLetterPolicy, InboundMessage,
    SubscribeOptions, SubscriptionType,
};
use crate::config::ConsumerConfig;
use crate::crypto::KeyMaterial;
use crate::dlq::dead_letter_topic;
use crate::handlers::EventHandler;
use crate::registry::ProducerRegistry;

/// Consumer setup errors.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("no topics to listen on")]
    NoTopics,

    #[error("failed to subscribe to topic {topic}: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: BrokerError,
    },
}

/// Starts subscriptions and their worker pools.
pub struct ConsumerSupervisor {
    client: Arc<dyn BrokerClient>,
    registry: Arc<ProducerRegistry>,
    keys: Option<Arc<KeyMaterial>>,
    config: ConsumerConfig,
    sequence: AtomicU64,
}

impl ConsumerSupervisor {
    pub fn new(
        client: Arc<dyn BrokerClient>,
        registry: Arc<ProducerRegistry>,
        keys: Option<Arc<KeyMaterial>>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            client,
            registry,
            keys,
            config,
            sequence: AtomicU64::new(0),
        }
    }

    /// Subscribe to every topic and start its worker pool.
    ///
    /// Either every topic is running when this returns `Ok`, or none is.
    pub async fn listen_on_topics(
        &self,
        topics: &[String],
        subscription_name: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<ListenerGroup, ConsumerError> {
        if topics.is_empty() {
            return Err(ConsumerError::NoTopics);
        }

        let mut group = ListenerGroup::new();
        for topic in topics {
            if let Err(e) = self
                .listen_on_topic(&mut group, topic, subscription_name, handler.clone())
                .await
            {
                error!(topic = %topic, error = %e, "Subscription failed, stopping started topics");
                group.shutdown().await;
                return Err(e);
            }
        }

        info!(
            topics = ?topics,
            subscription = %subscription_name,
            workers_per_topic = self.workers(),
            "Listening on topics"
        );
        Ok(group)
    }

    async fn listen_on_topic(
        &self,
        group: &mut ListenerGroup,
        topic: &str,
        subscription_name: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), ConsumerError> {
        let dead_letter_topic = dead_letter_topic(topic);

        let subscription = self
            .client
            .subscribe(SubscribeOptions {
                topics: vec![topic.to_string()],
                subscription_name: subscription_name.to_string(),
                consumer_name: Some(self.next_consumer_name()),
                subscription_type: SubscriptionType::Shared,
                dead_letter: Some(DeadLetterPolicy {
                    max_deliveries: self.config.max_deliveries,
                    dead_letter_topic: dead_letter_topic.clone(),
                    initial_subscription_name: Some(subscription_name.to_string()),
                }),
                decryption: self.keys.clone(),
                crypto_failure_action: CryptoFailureAction::Discard,
                channel_capacity: self.config.channel_capacity,
            })
            .await
            .map_err(|source| ConsumerError::Subscribe {
                topic: topic.to_string(),
                source,
            })?;

        let processor = Arc::new(MessageProcessor::new(
            handler,
            subscription.consumer.clone(),
            self.registry.clone(),
            dead_letter_topic,
        ));
        let receiver = Arc::new(Mutex::new(subscription.messages));

        for worker in 0..self.workers() {
            group.workers.push(tokio::spawn(run_worker(
                worker,
                topic.to_string(),
                receiver.clone(),
                processor.clone(),
                group.token.clone(),
            )));
        }
        group
            .consumers
            .push((topic.to_string(), subscription.consumer));

        debug!(topic = %topic, workers = self.workers(), "Started topic workers");
        Ok(())
    }

    fn workers(&self) -> usize {
        self.config.workers.max(1)
    }

    fn next_consumer_name(&self) -> String {
        format!(
            "{}-consumer-{}-{:02}",
            self.registry.service_name(),
            std::process::id(),
            self.sequence.fetch_add(1, Ordering::Relaxed)
        )
    }
}

async fn run_worker(
    worker: usize,
    topic: String,
    receiver: Arc<Mutex<mpsc::Receiver<InboundMessage>>>,
    processor: Arc<MessageProcessor>,
    token: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            message = async { receiver.lock().await.recv().await } => message,
        };

        let Some(message) = message else {
            break;
        };

        let disposition = processor.process(message).await;
        debug!(topic = %topic, worker, ?disposition, "Processed message");
    }

    debug!(topic = %topic, worker, "Worker stopped");
}

/// Running subscriptions and their workers.
pub struct ListenerGroup {
    token: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    consumers: Vec<(String, Arc<dyn Consumer>)>,
}

impl ListenerGroup {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            workers: Vec::new(),
            consumers: Vec::new(),
        }
    }

    /// Topics this group consumes.
    pub fn topics(&self) -> Vec<&str> {
        self.consumers.iter().map(|(t, _)| t.as_str()).collect()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Token that stops the workers when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stop the workers, wait for in-flight messages, then close the consumers.
    pub async fn shutdown(self) {
        self.token.cancel();

        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Worker task failed");
            }
        }

        for (topic, consumer) in &self.consumers {
            consumer.close().await;
            debug!(topic = %topic, "Consumer closed");
        }

        info!(topics = self.consumers.len(), "Listeners stopped");
    }
}

#[cfg(test)]
mod tests;
