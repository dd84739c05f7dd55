//! In-process broker.
//!
//! Implements the full broker contract inside one process: topics with an
//! append-only log, shared subscriptions with per-subscription backlogs,
//! ack/nack with redelivery, a redelivery cap with automatic dead-letter
//! routing, and encryption-key bookkeeping. Fault injection hooks let tests
//! drive the retry and eviction paths.
//!
//! A subscription created on a topic starts at the beginning of the topic
//! log, so messages published before anyone subscribed are retained.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    BrokerClient, BrokerConnector, BrokerError, ConnectOptions, Consumer, CryptoFailureAction,
    DeadLetterPolicy, InboundMessage, MessageId, OutboundMessage, Producer, ProducerOptions,
    Properties, Result, SubscribeOptions, Subscription,
};
use crate::crypto::KeyMaterial;

/// Property naming the topic a dead-lettered message came from.
pub const REAL_TOPIC_PROPERTY: &str = "REAL_TOPIC";
/// Property naming the id of a dead-lettered message on its original topic.
pub const ORIGIN_MESSAGE_ID_PROPERTY: &str = "ORIGIN_MESSAGE_ID";

#[derive(Debug, Clone)]
struct StoredMessage {
    id: MessageId,
    topic: String,
    payload: Vec<u8>,
    properties: Properties,
    /// Name of the key the producer encrypted with.
    encryption_key: Option<String>,
}

impl StoredMessage {
    fn to_inbound(&self) -> InboundMessage {
        InboundMessage {
            id: self.id.clone(),
            topic: self.topic.clone(),
            payload: self.payload.clone(),
            properties: self.properties.clone(),
        }
    }
}

#[derive(Default)]
struct SubscriptionQueue {
    backlog: VecDeque<StoredMessage>,
    /// Delivered and awaiting ack, keyed by id, tagged with the consumer holding it.
    unacked: HashMap<MessageId, (u64, StoredMessage)>,
    /// Negative acknowledgements seen per message.
    nacks: HashMap<MessageId, u32>,
    /// Undecryptable messages held back under [`CryptoFailureAction::Fail`].
    held: Vec<StoredMessage>,
}

struct SubscriptionState {
    queue: Mutex<SubscriptionQueue>,
    notify: Notify,
}

impl SubscriptionState {
    fn new(backlog: VecDeque<StoredMessage>) -> Self {
        Self {
            queue: Mutex::new(SubscriptionQueue {
                backlog,
                ..Default::default()
            }),
            notify: Notify::new(),
        }
    }
}

#[derive(Default)]
struct TopicState {
    log: Vec<StoredMessage>,
    subscriptions: HashMap<String, Arc<SubscriptionState>>,
}

#[derive(Default)]
struct Faults {
    send_failures: HashMap<String, u32>,
    producer_failures: HashMap<String, u32>,
    subscribe_failures: HashSet<String>,
}

#[derive(Default)]
struct Inner {
    topics: Mutex<HashMap<String, TopicState>>,
    faults: Mutex<Faults>,
    next_message: AtomicU64,
    next_consumer: AtomicU64,
    producers_created: AtomicUsize,
    producers_closed: AtomicUsize,
}

impl Inner {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        properties: Properties,
        encryption_key: Option<String>,
    ) -> MessageId {
        let id = MessageId::new(format!(
            "mem:{}",
            self.next_message.fetch_add(1, Ordering::Relaxed)
        ));
        let message = StoredMessage {
            id: id.clone(),
            topic: topic.to_string(),
            payload,
            properties,
            encryption_key,
        };

        let mut topics = self.topics.lock().await;
        let state = topics.entry(topic.to_string()).or_default();
        state.log.push(message.clone());
        for subscription in state.subscriptions.values() {
            subscription.queue.lock().await.backlog.push_back(message.clone());
            subscription.notify.notify_waiters();
        }

        id
    }

    async fn subscription(&self, topic: &str, name: &str) -> Arc<SubscriptionState> {
        let mut topics = self.topics.lock().await;
        let state = topics.entry(topic.to_string()).or_default();
        if let Some(existing) = state.subscriptions.get(name) {
            return existing.clone();
        }

        let backlog = state.log.iter().cloned().collect();
        let subscription = Arc::new(SubscriptionState::new(backlog));
        state
            .subscriptions
            .insert(name.to_string(), subscription.clone());
        subscription
    }

    /// Consume one injected failure for `topic` from `counters`.
    fn take_fault(counters: &mut HashMap<String, u32>, topic: &str) -> bool {
        match counters.get_mut(topic) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

/// In-process broker. Cloning shares the same topics.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish directly, bypassing producers.
    pub async fn publish_raw(
        &self,
        topic: &str,
        payload: Vec<u8>,
        properties: Properties,
    ) -> MessageId {
        self.inner.publish(topic, payload, properties, None).await
    }

    /// Fail the next `count` sends to `topic`.
    pub async fn fail_sends(&self, topic: &str, count: u32) {
        self.inner
            .faults
            .lock()
            .await
            .send_failures
            .insert(topic.to_string(), count);
    }

    /// Fail the next `count` producer creations for `topic`.
    pub async fn fail_producer_creation(&self, topic: &str, count: u32) {
        self.inner
            .faults
            .lock()
            .await
            .producer_failures
            .insert(topic.to_string(), count);
    }

    /// Fail every subscription that includes `topic`.
    pub async fn fail_subscriptions(&self, topic: &str) {
        self.inner
            .faults
            .lock()
            .await
            .subscribe_failures
            .insert(topic.to_string());
    }

    pub fn producers_created(&self) -> usize {
        self.inner.producers_created.load(Ordering::SeqCst)
    }

    pub fn producers_closed(&self) -> usize {
        self.inner.producers_closed.load(Ordering::SeqCst)
    }

    /// Payloads ever published to `topic`, in order.
    pub async fn published(&self, topic: &str) -> Vec<Vec<u8>> {
        self.messages(topic)
            .await
            .into_iter()
            .map(|m| m.payload)
            .collect()
    }

    /// Messages ever published to `topic`, in order.
    pub async fn messages(&self, topic: &str) -> Vec<InboundMessage> {
        self.inner
            .topics
            .lock()
            .await
            .get(topic)
            .map(|state| state.log.iter().map(StoredMessage::to_inbound).collect())
            .unwrap_or_default()
    }

    /// Encryption key name recorded for each message on `topic`.
    pub async fn encryption_keys(&self, topic: &str) -> Vec<Option<String>> {
        self.inner
            .topics
            .lock()
            .await
            .get(topic)
            .map(|state| state.log.iter().map(|m| m.encryption_key.clone()).collect())
            .unwrap_or_default()
    }

    /// Messages on `subscription` not yet acknowledged (queued or in flight).
    pub async fn backlog(&self, topic: &str, subscription: &str) -> usize {
        let state = {
            let topics = self.inner.topics.lock().await;
            topics
                .get(topic)
                .and_then(|t| t.subscriptions.get(subscription))
                .cloned()
        };
        match state {
            Some(state) => {
                let queue = state.queue.lock().await;
                queue.backlog.len() + queue.unacked.len()
            }
            None => 0,
        }
    }

    /// Whether a subscription named `subscription` exists on `topic`.
    pub async fn has_subscription(&self, topic: &str, subscription: &str) -> bool {
        self.inner
            .topics
            .lock()
            .await
            .get(topic)
            .is_some_and(|t| t.subscriptions.contains_key(subscription))
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn BrokerClient>> {
        info!(
            url = %options.url,
            encrypted = options.key_material.is_some(),
            "Connected to in-memory broker"
        );
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn create_producer(&self, options: ProducerOptions) -> Result<Arc<dyn Producer>> {
        // Yield so concurrent creators interleave like they would on a network round trip.
        tokio::task::yield_now().await;

        let fail = {
            let mut faults = self.inner.faults.lock().await;
            Inner::take_fault(&mut faults.producer_failures, &options.topic)
        };
        if fail {
            return Err(BrokerError::CreateProducer {
                topic: options.topic,
                message: "injected producer failure".to_string(),
            });
        }

        self.inner.producers_created.fetch_add(1, Ordering::SeqCst);
        debug!(topic = %options.topic, producer = %options.name, "Producer created");

        Ok(Arc::new(MemoryProducer {
            topic: options.topic,
            name: options.name,
            encryption_key: options.encryption.map(|k| k.key_name().to_string()),
            inner: self.inner.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn subscribe(&self, options: SubscribeOptions) -> Result<Subscription> {
        if options.topics.is_empty() {
            return Err(BrokerError::Subscribe("no topics given".to_string()));
        }
        {
            let faults = self.inner.faults.lock().await;
            if let Some(topic) = options
                .topics
                .iter()
                .find(|t| faults.subscribe_failures.contains(*t))
            {
                return Err(BrokerError::Subscribe(format!(
                    "injected subscribe failure on {}",
                    topic
                )));
            }
        }

        if let Some(policy) = &options.dead_letter {
            if let Some(initial) = &policy.initial_subscription_name {
                self.inner
                    .subscription(&policy.dead_letter_topic, initial)
                    .await;
            }
        }

        let consumer_id = self.inner.next_consumer.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(options.channel_capacity.max(1));
        let token = CancellationToken::new();
        let decryption_key = options.decryption.as_deref().map(KeyMaterial::key_name);

        let mut subscriptions = HashMap::new();
        let mut dispatchers = Vec::with_capacity(options.topics.len());
        for topic in &options.topics {
            let state = self
                .inner
                .subscription(topic, &options.subscription_name)
                .await;
            subscriptions.insert(topic.clone(), state.clone());
            dispatchers.push(tokio::spawn(dispatch(
                Dispatcher {
                    consumer_id,
                    state,
                    decryption_key: decryption_key.map(str::to_string),
                    crypto_failure_action: options.crypto_failure_action,
                },
                tx.clone(),
                token.clone(),
            )));
        }

        debug!(
            topics = ?options.topics,
            subscription = %options.subscription_name,
            consumer = ?options.consumer_name,
            "Subscribed"
        );

        let consumer = MemoryConsumer {
            id: consumer_id,
            inner: self.inner.clone(),
            subscriptions,
            dead_letter: options.dead_letter,
            token,
            dispatchers: Mutex::new(dispatchers),
            closed: AtomicBool::new(false),
        };

        Ok(Subscription {
            consumer: Arc::new(consumer),
            messages: rx,
        })
    }
}

struct MemoryProducer {
    topic: String,
    name: String,
    encryption_key: Option<String>,
    inner: Arc<Inner>,
    closed: AtomicBool,
}

#[async_trait]
impl Producer for MemoryProducer {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: OutboundMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed(format!("producer {}", self.name)));
        }

        let fail = {
            let mut faults = self.inner.faults.lock().await;
            Inner::take_fault(&mut faults.send_failures, &self.topic)
        };
        if fail {
            return Err(BrokerError::Send {
                topic: self.topic.clone(),
                message: "injected send failure".to_string(),
            });
        }

        self.inner
            .publish(
                &self.topic,
                message.payload,
                message.properties,
                self.encryption_key.clone(),
            )
            .await;
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.inner.producers_closed.fetch_add(1, Ordering::SeqCst);
            debug!(topic = %self.topic, producer = %self.name, "Producer closed");
        }
    }
}

struct Dispatcher {
    consumer_id: u64,
    state: Arc<SubscriptionState>,
    decryption_key: Option<String>,
    crypto_failure_action: CryptoFailureAction,
}

impl Dispatcher {
    /// Take the next deliverable message, applying the crypto failure action.
    async fn next(&self) -> Option<InboundMessage> {
        let mut queue = self.state.queue.lock().await;
        while let Some(message) = queue.backlog.pop_front() {
            let readable = match &message.encryption_key {
                Some(key) => self.decryption_key.as_deref() == Some(key.as_str()),
                None => true,
            };
            if !readable {
                match self.crypto_failure_action {
                    CryptoFailureAction::Discard => {
                        warn!(id = %message.id, "Discarding undecryptable message");
                        continue;
                    }
                    CryptoFailureAction::Fail => {
                        warn!(id = %message.id, "Holding undecryptable message");
                        queue.held.push(message);
                        continue;
                    }
                    CryptoFailureAction::Consume => {}
                }
            }

            let inbound = message.to_inbound();
            queue
                .unacked
                .insert(message.id.clone(), (self.consumer_id, message));
            return Some(inbound);
        }
        None
    }
}

/// Move messages from one subscription backlog into the delivery channel.
async fn dispatch(
    dispatcher: Dispatcher,
    tx: mpsc::Sender<InboundMessage>,
    token: CancellationToken,
) {
    loop {
        // Reserve channel space before taking a message so none is lost on cancel.
        let permit = tokio::select! {
            _ = token.cancelled() => return,
            permit = tx.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        let message = loop {
            let notified = dispatcher.state.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = dispatcher.next().await {
                break message;
            }

            tokio::select! {
                _ = token.cancelled() => return,
                _ = &mut notified => {}
            }
        };

        permit.send(message);
    }
}

struct MemoryConsumer {
    id: u64,
    inner: Arc<Inner>,
    subscriptions: HashMap<String, Arc<SubscriptionState>>,
    dead_letter: Option<DeadLetterPolicy>,
    token: CancellationToken,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MemoryConsumer {
    fn state_for(&self, message: &InboundMessage) -> Result<&Arc<SubscriptionState>> {
        self.subscriptions.get(&message.topic).ok_or_else(|| {
            BrokerError::Acknowledge(format!(
                "message {} is not from a subscribed topic ({})",
                message.id, message.topic
            ))
        })
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn ack(&self, message: &InboundMessage) -> Result<()> {
        let state = self.state_for(message)?;
        let mut queue = state.queue.lock().await;
        queue.unacked.remove(&message.id);
        queue.nacks.remove(&message.id);
        Ok(())
    }

    async fn nack(&self, message: &InboundMessage) -> Result<()> {
        let state = self.state_for(message)?;

        let dead_lettered = {
            let mut queue = state.queue.lock().await;
            let Some((_, stored)) = queue.unacked.remove(&message.id) else {
                return Ok(());
            };

            let nacks = {
                let count = queue.nacks.entry(message.id.clone()).or_insert(0);
                *count += 1;
                *count
            };

            match &self.dead_letter {
                Some(policy) if nacks >= policy.max_deliveries => {
                    queue.nacks.remove(&message.id);
                    Some((policy.dead_letter_topic.clone(), stored))
                }
                _ => {
                    queue.backlog.push_back(stored);
                    state.notify.notify_waiters();
                    None
                }
            }
        };

        if let Some((dead_letter_topic, stored)) = dead_lettered {
            warn!(
                id = %stored.id,
                topic = %stored.topic,
                dead_letter_topic = %dead_letter_topic,
                "Max deliveries reached, routing to dead letter topic"
            );
            let mut properties = stored.properties;
            properties.insert(REAL_TOPIC_PROPERTY.to_string(), stored.topic);
            properties.insert(ORIGIN_MESSAGE_ID_PROPERTY.to_string(), stored.id.to_string());
            self.inner
                .publish(
                    &dead_letter_topic,
                    stored.payload,
                    properties,
                    stored.encryption_key,
                )
                .await;
        }

        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();

        let dispatchers = std::mem::take(&mut *self.dispatchers.lock().await);
        for handle in dispatchers {
            let _ = handle.await;
        }

        // Return in-flight messages to their subscriptions for redelivery.
        for state in self.subscriptions.values() {
            let mut queue = state.queue.lock().await;
            let mine: Vec<MessageId> = queue
                .unacked
                .iter()
                .filter(|(_, (owner, _))| *owner == self.id)
                .map(|(id, _)| id.clone())
                .collect();
            for id in mine {
                if let Some((_, stored)) = queue.unacked.remove(&id) {
                    queue.backlog.push_front(stored);
                }
            }
            state.notify.notify_waiters();
        }

        debug!(consumer = self.id, "Consumer closed");
    }
}
