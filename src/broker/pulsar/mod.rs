//! Apache Pulsar backend.
//!
//! Producers wrap a `pulsar::Producer` behind a mutex (sends need `&mut`).
//! Each subscription runs a pump task that owns the `pulsar::Consumer`,
//! forwards messages into the bounded delivery channel, and serves
//! ack/nack/close requests from the [`Consumer`] handle over a command
//! channel.
//!
//! The `pulsar` crate has no end-to-end encryption support, so connecting
//! with key material configured fails with
//! [`BrokerError::EncryptionUnsupported`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use pulsar::consumer::{DeadLetterPolicy as PulsarDeadLetterPolicy, InitialPosition};
use pulsar::message::proto::MessageIdData;
use pulsar::producer::Message as PulsarMessage;
use pulsar::{
    ConnectionRetryOptions, ConsumerOptions, OperationRetryOptions, Pulsar, SerializeMessage,
    SubType, TokioExecutor,
};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};

use super::{
    BrokerClient, BrokerConnector, BrokerError, ConnectOptions, Consumer, DeadLetterPolicy,
    InboundMessage, MessageId, OutboundMessage, Producer, ProducerOptions, Result,
    SubscribeOptions, Subscription, SubscriptionType,
};
use crate::crypto::KeyMaterial;

const BACKEND: &str = "pulsar";

/// Connects to a Pulsar cluster.
#[derive(Debug, Clone, Copy, Default)]
pub struct PulsarConnector;

#[async_trait]
impl BrokerConnector for PulsarConnector {
    async fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn BrokerClient>> {
        refuse_encryption(options.key_material.as_ref())?;

        info!(url = %options.url, "Connecting to Pulsar");

        let client = Pulsar::builder(options.url.clone(), TokioExecutor)
            .with_connection_retry_options(ConnectionRetryOptions {
                connection_timeout: options.connection_timeout,
                ..Default::default()
            })
            .with_operation_retry_options(OperationRetryOptions {
                operation_timeout: options.operation_timeout,
                ..Default::default()
            })
            .build()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        info!(url = %options.url, "Connected to Pulsar");

        Ok(Arc::new(PulsarClient { client }))
    }
}

/// Pulsar-backed [`BrokerClient`].
pub struct PulsarClient {
    client: Pulsar<TokioExecutor>,
}

#[async_trait]
impl BrokerClient for PulsarClient {
    async fn create_producer(&self, options: ProducerOptions) -> Result<Arc<dyn Producer>> {
        refuse_encryption(options.encryption.as_ref())?;

        let producer = self
            .client
            .producer()
            .with_topic(&options.topic)
            .with_name(&options.name)
            .build()
            .await
            .map_err(|e| BrokerError::CreateProducer {
                topic: options.topic.clone(),
                message: e.to_string(),
            })?;

        debug!(topic = %options.topic, producer = %options.name, "Pulsar producer created");

        Ok(Arc::new(PulsarProducer {
            topic: options.topic,
            name: options.name,
            send_timeout: options.send_timeout,
            producer: Mutex::new(Some(producer)),
        }))
    }

    async fn subscribe(&self, options: SubscribeOptions) -> Result<Subscription> {
        refuse_encryption(options.decryption.as_ref())?;

        let mut builder = self
            .client
            .consumer()
            .with_topics(&options.topics)
            .with_subscription(&options.subscription_name)
            .with_subscription_type(sub_type(options.subscription_type))
            .with_options(ConsumerOptions {
                initial_position: InitialPosition::Earliest,
                ..Default::default()
            });
        if let Some(name) = &options.consumer_name {
            builder = builder.with_consumer_name(name);
        }
        if let Some(policy) = &options.dead_letter {
            builder = builder.with_dead_letter_policy(dead_letter_policy(policy));
        }

        let consumer: pulsar::Consumer<Vec<u8>, TokioExecutor> = builder
            .build()
            .await
            .map_err(|e| BrokerError::Subscribe(e.to_string()))?;

        let (tx, rx) = mpsc::channel(options.channel_capacity.max(1));
        let (commands_tx, commands_rx) = mpsc::channel(64);
        tokio::spawn(pump(consumer, tx, commands_rx));

        debug!(
            topics = ?options.topics,
            subscription = %options.subscription_name,
            "Pulsar subscription started"
        );

        Ok(Subscription {
            consumer: Arc::new(PulsarConsumer {
                commands: commands_tx,
            }),
            messages: rx,
        })
    }
}

fn refuse_encryption(keys: Option<&Arc<KeyMaterial>>) -> Result<()> {
    match keys {
        Some(_) => Err(BrokerError::EncryptionUnsupported(BACKEND)),
        None => Ok(()),
    }
}

/// Pulsar dead-letters a message once its redelivery count reaches
/// `max_redeliver_count`. The first delivery has count 0, so the redelivery
/// cap equals the total delivery count.
fn dead_letter_policy(policy: &DeadLetterPolicy) -> PulsarDeadLetterPolicy {
    PulsarDeadLetterPolicy {
        max_redeliver_count: policy.max_deliveries.max(1) as usize,
        dead_letter_topic: policy.dead_letter_topic.clone(),
    }
}

fn sub_type(subscription_type: SubscriptionType) -> SubType {
    match subscription_type {
        SubscriptionType::Exclusive => SubType::Exclusive,
        SubscriptionType::Shared => SubType::Shared,
        SubscriptionType::Failover => SubType::Failover,
    }
}

/// Adapter turning an [`OutboundMessage`] into a Pulsar message.
struct Outbound(OutboundMessage);

impl SerializeMessage for Outbound {
    fn serialize_message(input: Self) -> std::result::Result<PulsarMessage, pulsar::Error> {
        Ok(PulsarMessage {
            payload: input.0.payload,
            properties: input.0.properties,
            ..Default::default()
        })
    }
}

struct PulsarProducer {
    topic: String,
    name: String,
    send_timeout: Duration,
    producer: Mutex<Option<pulsar::Producer<TokioExecutor>>>,
}

impl PulsarProducer {
    fn send_error(&self, message: impl ToString) -> BrokerError {
        BrokerError::Send {
            topic: self.topic.clone(),
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl Producer for PulsarProducer {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: OutboundMessage) -> Result<()> {
        let receipt = {
            let mut guard = self.producer.lock().await;
            let producer = guard
                .as_mut()
                .ok_or_else(|| BrokerError::Closed(format!("producer {}", self.name)))?;
            producer
                .send_non_blocking(Outbound(message))
                .await
                .map_err(|e| self.send_error(e))?
        };

        match tokio::time::timeout(self.send_timeout, receipt).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(self.send_error(e)),
            Err(_) => Err(self.send_error(format!(
                "no receipt within {:?}",
                self.send_timeout
            ))),
        }
    }

    async fn close(&self) {
        if let Some(mut producer) = self.producer.lock().await.take() {
            if let Err(e) = producer.close().await {
                warn!(topic = %self.topic, producer = %self.name, error = %e, "Producer close failed");
            }
        }
    }
}

enum Command {
    Ack(String, oneshot::Sender<Result<()>>),
    Nack(String, oneshot::Sender<Result<()>>),
    Close(oneshot::Sender<()>),
}

struct PulsarConsumer {
    commands: mpsc::Sender<Command>,
}

impl PulsarConsumer {
    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<()>>) -> Command,
    ) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(make(reply_tx))
            .await
            .map_err(|_| BrokerError::Closed("consumer".to_string()))?;
        reply_rx
            .await
            .map_err(|_| BrokerError::Closed("consumer".to_string()))?
    }
}

#[async_trait]
impl Consumer for PulsarConsumer {
    async fn ack(&self, message: &InboundMessage) -> Result<()> {
        let key = message.id.as_str().to_string();
        self.request(|reply| Command::Ack(key, reply)).await
    }

    async fn nack(&self, message: &InboundMessage) -> Result<()> {
        let key = message.id.as_str().to_string();
        self.request(|reply| Command::Nack(key, reply)).await
    }

    async fn close(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(Command::Close(reply_tx)).await.is_ok() {
            let _ = reply_rx.await;
        }
    }
}

fn message_key(id: &MessageIdData) -> String {
    format!(
        "{}:{}:{}:{}",
        id.ledger_id,
        id.entry_id,
        id.partition.unwrap_or(-1),
        id.batch_index.unwrap_or(-1)
    )
}

enum PumpEvent {
    Command(Option<Command>),
    Delivery(std::result::Result<Option<pulsar::consumer::Message<Vec<u8>>>, pulsar::Error>),
    Permit(std::result::Result<mpsc::OwnedPermit<InboundMessage>, mpsc::error::SendError<()>>),
}

/// Owns the Pulsar consumer: forwards deliveries and serves acknowledgements.
async fn pump(
    mut consumer: pulsar::Consumer<Vec<u8>, TokioExecutor>,
    tx: mpsc::Sender<InboundMessage>,
    mut commands: mpsc::Receiver<Command>,
) {
    let mut in_flight: HashMap<String, pulsar::consumer::Message<Vec<u8>>> = HashMap::new();
    let mut pending: Option<InboundMessage> = None;

    loop {
        let event = tokio::select! {
            command = commands.recv() => PumpEvent::Command(command),
            delivery = consumer.try_next(), if pending.is_none() => PumpEvent::Delivery(delivery),
            permit = tx.clone().reserve_owned(), if pending.is_some() => PumpEvent::Permit(permit),
        };

        match event {
            PumpEvent::Delivery(Ok(Some(message))) => {
                let key = message_key(message.message_id());
                let properties = message
                    .payload
                    .metadata
                    .properties
                    .iter()
                    .map(|kv| (kv.key.clone(), kv.value.clone()))
                    .collect();
                pending = Some(InboundMessage {
                    id: MessageId::new(key.clone()),
                    topic: message.topic.clone(),
                    payload: message.payload.data.clone(),
                    properties,
                });
                in_flight.insert(key, message);
            }
            PumpEvent::Delivery(Ok(None)) => {
                debug!("Pulsar consumer stream ended");
                break;
            }
            PumpEvent::Delivery(Err(e)) => {
                error!(error = %e, "Pulsar consumer error");
            }
            PumpEvent::Permit(Ok(permit)) => {
                if let Some(message) = pending.take() {
                    permit.send(message);
                }
            }
            PumpEvent::Permit(Err(_)) => {
                debug!("Delivery channel dropped, closing Pulsar consumer");
                break;
            }
            PumpEvent::Command(Some(Command::Ack(key, reply))) => {
                let result = match in_flight.remove(&key) {
                    Some(message) => consumer
                        .ack(&message)
                        .await
                        .map_err(|e| BrokerError::Acknowledge(e.to_string())),
                    None => Ok(()),
                };
                let _ = reply.send(result);
            }
            PumpEvent::Command(Some(Command::Nack(key, reply))) => {
                let result = match in_flight.remove(&key) {
                    Some(message) => consumer
                        .nack(&message)
                        .await
                        .map_err(|e| BrokerError::Acknowledge(e.to_string())),
                    None => Ok(()),
                };
                let _ = reply.send(result);
            }
            PumpEvent::Command(Some(Command::Close(reply))) => {
                close_consumer(&mut consumer).await;
                let _ = reply.send(());
                return;
            }
            PumpEvent::Command(None) => break,
        }
    }

    close_consumer(&mut consumer).await;
}

async fn close_consumer(consumer: &mut pulsar::Consumer<Vec<u8>, TokioExecutor>) {
    if let Err(e) = consumer.close().await {
        warn!(error = %e, "Pulsar consumer close failed");
    }
}
