//! AMQP (RabbitMQ) event bus implementation.
//!
//! Publishes to a durable topic exchange and consumes from durable queues
//! bound by routing pattern. One connection and one channel per process,
//! owned by [`ConnectionManager`]; publisher confirms are enabled, so a
//! publish resolves only once the broker has accepted the message.
//!
//! Redelivery is crate-managed: a failed delivery is republished to its own
//! queue through the default exchange with a bumped `x-attempts` header and
//! the original is acknowledged. The attempt budget therefore survives
//! consumer restarts and does not depend on the broker's single-bit
//! redelivered flag.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use bytes::Bytes;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel};
use tracing::{debug, error, info, warn};

use super::{
    disposition, AckPolicy, BusError, Disposition, EventBus, InboundMessage, MessageHandler,
    QueueBinding, Result, DEFAULT_PREFETCH, EVENTS_EXCHANGE,
};
use crate::connection::ConnectionManager;
use crate::dlq::{DeadLetter, DeadLetterPublisher, DlqError, DLQ_QUEUE, DLQ_TOPIC_PREFIX};

/// Message header carrying the crate-managed delivery attempt counter.
const ATTEMPTS_HEADER: &str = "x-attempts";

/// Message header preserving the original routing key across requeues.
/// Requeued copies travel through the default exchange, whose routing key
/// is the queue name, so the topic must ride along separately.
const TOPIC_HEADER: &str = "x-topic";

/// Configuration for the AMQP event bus.
#[derive(Clone, Debug)]
pub struct AmqpConfig {
    /// AMQP connection URL (e.g., amqp://localhost:5672).
    pub url: String,
    /// Topic exchange to declare and publish to.
    pub exchange: String,
    /// Unacknowledged deliveries in flight per consumer.
    pub prefetch: u16,
    /// Acknowledgment protocol applied by consumers.
    pub ack_policy: AckPolicy,
    /// Floor of the reconnect backoff window.
    pub reconnect_min_delay: Duration,
    /// Ceiling of the reconnect backoff window.
    pub reconnect_max_delay: Duration,
}

impl AmqpConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            exchange: EVENTS_EXCHANGE.to_string(),
            prefetch: DEFAULT_PREFETCH,
            ack_policy: AckPolicy::default(),
            reconnect_min_delay: Duration::from_millis(100),
            reconnect_max_delay: Duration::from_secs(30),
        }
    }
}

/// AMQP event bus over RabbitMQ.
pub struct AmqpEventBus {
    manager: Arc<ConnectionManager>,
    ack_policy: AckPolicy,
    prefetch: u16,
    dlq: Arc<dyn DeadLetterPublisher>,
}

impl AmqpEventBus {
    /// Connect and declare the shared topology (exchange plus the catch-all
    /// DLQ queue). Fails fast when the broker is unreachable; reconnection
    /// only starts once a first connection has succeeded.
    pub async fn new(config: AmqpConfig) -> Result<Self> {
        let manager = ConnectionManager::connect(&config).await?;
        let dlq = AmqpDeadLetterPublisher::declare(manager.clone()).await?;

        Ok(Self {
            manager,
            ack_policy: config.ack_policy,
            prefetch: config.prefetch,
            dlq: Arc::new(dlq),
        })
    }

    /// Replace the dead letter publisher (tests, or routing dead letters
    /// into other tooling).
    pub fn with_dead_letter_publisher(mut self, dlq: Arc<dyn DeadLetterPublisher>) -> Self {
        self.dlq = dlq;
        self
    }

    /// The connection manager this bus publishes and consumes through.
    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Idempotently declare a durable queue and bind it to the exchange.
    async fn declare_queue(channel: &Channel, exchange: &str, binding: &QueueBinding) -> Result<()> {
        channel
            .queue_declare(
                binding.queue_group(),
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to declare queue: {}", e)))?;

        channel
            .queue_bind(
                binding.queue_group(),
                exchange,
                binding.pattern().as_str(),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to bind queue: {}", e)))?;

        info!(
            queue = binding.queue_group(),
            routing_key = %binding.pattern(),
            "Bound queue to exchange"
        );
        Ok(())
    }

    /// Set prefetch, declare, bind, and register the consumer on `channel`.
    /// Once this resolves the broker routes matching publishes to the queue.
    async fn start_consumer(
        channel: &Channel,
        exchange: &str,
        binding: &QueueBinding,
        prefetch: u16,
    ) -> Result<lapin::Consumer> {
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to set prefetch: {}", e)))?;

        Self::declare_queue(channel, exchange, binding).await?;

        // Server-generated consumer tag: several listeners share the channel.
        channel
            .basic_consume(
                binding.queue_group(),
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))
    }

    /// Wait for a live channel, then register the consumer on it.
    async fn setup_consumer(
        manager: &Arc<ConnectionManager>,
        binding: &QueueBinding,
        prefetch: u16,
    ) -> Result<(Channel, lapin::Consumer)> {
        let channel = manager.ensure_channel().await;
        let consumer =
            Self::start_consumer(&channel, manager.exchange(), binding, prefetch).await?;
        Ok((channel, consumer))
    }

    /// Consumer loop with automatic reconnection and exponential backoff
    /// with jitter. The first consumer arrives already registered by
    /// [`EventBus::consume`]; queue and binding are re-declared after every
    /// reconnect.
    async fn consume_with_reconnect(
        manager: Arc<ConnectionManager>,
        binding: QueueBinding,
        prefetch: u16,
        ack_policy: AckPolicy,
        handler: Arc<dyn MessageHandler>,
        dlq: Arc<dyn DeadLetterPublisher>,
        first: (Channel, lapin::Consumer),
    ) {
        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(manager.reconnect_min_delay())
            .with_max_delay(manager.reconnect_max_delay())
            .with_jitter();

        let mut backoff_iter = backoff_builder.build();
        let mut first = Some(first);

        loop {
            let setup = match first.take() {
                Some(ready) => Ok(ready),
                None => Self::setup_consumer(&manager, &binding, prefetch).await,
            };

            match setup {
                Ok((channel, mut consumer)) => {
                    info!(
                        queue = binding.queue_group(),
                        routing_key = %binding.pattern(),
                        "Consumer connected"
                    );
                    // A successful connect resets the backoff window
                    backoff_iter = backoff_builder.build();

                    while let Some(delivery) = consumer.next().await {
                        match delivery {
                            Ok(delivery) => {
                                Self::process_delivery(
                                    delivery, &channel, &binding, ack_policy, &handler, &dlq,
                                )
                                .await;
                            }
                            Err(e) => {
                                error!(error = %e, "Consumer delivery error, will reconnect");
                                break;
                            }
                        }
                    }

                    info!(queue = binding.queue_group(), "Consumer stream ended, reconnecting...");
                }
                Err(e) => {
                    let delay = backoff_iter.next().unwrap_or(manager.reconnect_max_delay());
                    error!(
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        queue = binding.queue_group(),
                        "Failed to set up consumer, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }

            // Stream ended without a delivery error; pause before redialing
            let delay = backoff_iter.next().unwrap_or(manager.reconnect_max_delay());
            tokio::time::sleep(delay).await;
        }
    }

    /// Process a single delivery: run the handler, then apply the
    /// acknowledgment protocol to the outcome.
    async fn process_delivery(
        delivery: Delivery,
        channel: &Channel,
        binding: &QueueBinding,
        ack_policy: AckPolicy,
        handler: &Arc<dyn MessageHandler>,
        dlq: &Arc<dyn DeadLetterPublisher>,
    ) {
        let msg = inbound_from_delivery(&delivery, binding.queue_group());
        debug!(
            topic = %msg.topic,
            queue = %msg.queue_group,
            attempt = msg.attempt,
            "Received message"
        );

        let outcome = handler.handle(msg.clone()).await;

        match outcome {
            Ok(()) => ack(&delivery).await,
            Err(handler_error) => match disposition(ack_policy, msg.attempt, &handler_error) {
                Disposition::Ack => {
                    error!(
                        topic = %msg.topic,
                        queue = %msg.queue_group,
                        error = %handler_error,
                        "Handler failed; acknowledging anyway (ack-always)"
                    );
                    ack(&delivery).await;
                }
                Disposition::Retry { next_attempt } => {
                    warn!(
                        topic = %msg.topic,
                        queue = %msg.queue_group,
                        attempt = msg.attempt,
                        error = %handler_error,
                        "Handler failed; re-enqueueing"
                    );
                    match requeue(channel, binding.queue_group(), &msg, next_attempt).await {
                        Ok(()) => ack(&delivery).await,
                        Err(e) => {
                            // No retry copy made it to the broker; fall back
                            // to broker redelivery rather than lose the message.
                            error!(error = %e, "Failed to requeue, nacking for broker redelivery");
                            nack_requeue(&delivery).await;
                        }
                    }
                }
                Disposition::DeadLetter => {
                    warn!(
                        topic = %msg.topic,
                        queue = %msg.queue_group,
                        attempt = msg.attempt,
                        error = %handler_error,
                        "Routing message to dead letter queue"
                    );
                    let dead_letter = DeadLetter::from_failure(&msg, &handler_error);
                    match dlq.publish(dead_letter).await {
                        Ok(()) => ack(&delivery).await,
                        Err(e) => {
                            error!(
                                error = %e,
                                "Failed to publish dead letter, nacking for broker redelivery"
                            );
                            nack_requeue(&delivery).await;
                        }
                    }
                }
            },
        }
    }
}

#[async_trait]
impl EventBus for AmqpEventBus {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(topic = %topic))]
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        // Fail fast while disconnected. Reconnection belongs to the consumer
        // loops; the caller decides whether this publish is worth retrying.
        let channel = self.manager.channel().await?;

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2); // persistent

        let confirm = channel
            .basic_publish(
                self.manager.exchange(),
                topic,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?;

        confirm
            .await
            .map_err(|e| BusError::Publish(format!("Publish confirmation failed: {}", e)))?;

        debug!(
            exchange = %self.manager.exchange(),
            topic = %topic,
            "Published message"
        );
        Ok(())
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<()> {
        let channel = self.manager.channel().await?;
        Self::declare_queue(&channel, self.manager.exchange(), binding).await
    }

    async fn consume(
        &self,
        binding: QueueBinding,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        // Register before returning so a publish issued right after this
        // call cannot race the binding. Setup errors surface here; only
        // reconnects after a drop retry in the background.
        let channel = self.manager.channel().await?;
        let consumer =
            Self::start_consumer(&channel, self.manager.exchange(), &binding, self.prefetch)
                .await?;

        let manager = self.manager.clone();
        let prefetch = self.prefetch;
        let ack_policy = self.ack_policy;
        let dlq = self.dlq.clone();

        // Spawn consumer task with reconnection loop
        tokio::spawn(async move {
            Self::consume_with_reconnect(
                manager,
                binding,
                prefetch,
                ack_policy,
                handler,
                dlq,
                (channel, consumer),
            )
            .await;
        });

        Ok(())
    }
}

async fn ack(delivery: &Delivery) {
    if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
        error!(error = %e, "Failed to ack message");
    }
}

async fn nack_requeue(delivery: &Delivery) {
    let options = BasicNackOptions {
        requeue: true,
        ..Default::default()
    };
    if let Err(e) = delivery.nack(options).await {
        error!(error = %e, "Failed to nack message");
    }
}

/// Build the [`InboundMessage`] view of a broker delivery, restoring the
/// attempt counter and original topic from our headers when present.
fn inbound_from_delivery(delivery: &Delivery, queue_group: &str) -> InboundMessage {
    let headers = delivery.properties.headers().as_ref();

    let attempt = headers
        .and_then(|t| t.inner().get(ATTEMPTS_HEADER))
        .and_then(header_u32)
        .unwrap_or(1)
        .max(1);

    let topic = headers
        .and_then(|t| t.inner().get(TOPIC_HEADER))
        .and_then(|value| match value {
            AMQPValue::LongString(s) => {
                Some(String::from_utf8_lossy(s.as_bytes()).into_owned())
            }
            _ => None,
        })
        .unwrap_or_else(|| delivery.routing_key.to_string());

    InboundMessage {
        topic,
        payload: Bytes::copy_from_slice(&delivery.data),
        queue_group: queue_group.to_string(),
        redelivered: delivery.redelivered || attempt > 1,
        attempt,
    }
}

fn header_u32(value: &AMQPValue) -> Option<u32> {
    match value {
        AMQPValue::LongUInt(n) => Some(*n),
        AMQPValue::ShortUInt(n) => Some(u32::from(*n)),
        AMQPValue::ShortShortUInt(n) => Some(u32::from(*n)),
        AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
        _ => None,
    }
}

/// Republish a failed delivery to its own queue through the default
/// exchange, carrying the bumped attempt counter and the original topic.
async fn requeue(
    channel: &Channel,
    queue: &str,
    msg: &InboundMessage,
    next_attempt: u32,
) -> Result<()> {
    let mut headers: BTreeMap<ShortString, AMQPValue> = BTreeMap::new();
    headers.insert(ATTEMPTS_HEADER.into(), AMQPValue::LongUInt(next_attempt));
    headers.insert(
        TOPIC_HEADER.into(),
        AMQPValue::LongString(msg.topic.clone().into()),
    );

    let properties = BasicProperties::default()
        .with_content_type("application/json".into())
        .with_delivery_mode(2)
        .with_headers(FieldTable::from(headers));

    let confirm = channel
        .basic_publish(
            "",
            queue,
            BasicPublishOptions::default(),
            &msg.payload,
            properties,
        )
        .await
        .map_err(|e| BusError::Publish(format!("Failed to requeue: {}", e)))?;

    confirm
        .await
        .map_err(|e| BusError::Publish(format!("Requeue confirmation failed: {}", e)))?;
    Ok(())
}

/// Publishes dead letters to `dlq.{queue_group}` on the shared exchange.
///
/// Declares a catch-all durable queue bound to `dlq.#` so dead letters are
/// retained even before any ops tooling attaches.
pub struct AmqpDeadLetterPublisher {
    manager: Arc<ConnectionManager>,
}

impl AmqpDeadLetterPublisher {
    pub async fn declare(manager: Arc<ConnectionManager>) -> Result<Self> {
        let channel = manager.channel().await?;

        channel
            .queue_declare(
                DLQ_QUEUE,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to declare DLQ queue: {}", e)))?;

        channel
            .queue_bind(
                DLQ_QUEUE,
                manager.exchange(),
                &format!("{}.#", DLQ_TOPIC_PREFIX),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to bind DLQ queue: {}", e)))?;

        Ok(Self { manager })
    }
}

#[async_trait]
impl DeadLetterPublisher for AmqpDeadLetterPublisher {
    async fn publish(&self, dead_letter: DeadLetter) -> std::result::Result<(), DlqError> {
        let channel = self
            .manager
            .channel()
            .await
            .map_err(|e| DlqError::Connection(e.to_string()))?;

        let payload = serde_json::to_vec(&dead_letter.to_wire_json())
            .map_err(|e| DlqError::Serialization(e.to_string()))?;

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2);

        let confirm = channel
            .basic_publish(
                self.manager.exchange(),
                &dead_letter.dlq_topic(),
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|e| DlqError::PublishFailed(e.to_string()))?;

        confirm
            .await
            .map_err(|e| DlqError::PublishFailed(e.to_string()))?;

        info!(
            topic = %dead_letter.dlq_topic(),
            reason = %dead_letter.reason,
            "Published dead letter"
        );
        Ok(())
    }
}
