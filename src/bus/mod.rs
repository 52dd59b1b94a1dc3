//! The topic event bus.
//!
//! Defines:
//! - `EventBus` trait: topic publish plus durable queue consumption
//! - `MessageHandler` trait: for processing raw deliveries
//! - The acknowledgment protocol shared by every backend
//! - Messaging configuration types
//! - Backends: AMQP (RabbitMQ), in-memory
//!
//! Both backends route publishes through topic-exchange semantics and apply
//! the same acknowledgment protocol, so behavior observed against the memory
//! bus holds against the broker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::info;

use crate::topic::{valid_literal_segment, TopicError, TopicPattern};

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::{AmqpConfig, AmqpEventBus};
pub use memory::MemoryEventBus;

/// Name of the shared topic exchange every service publishes to.
pub const EVENTS_EXCHANGE: &str = "learnsphere";

/// Default attempt budget under [`AckPolicy::DeadLetter`].
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default per-consumer prefetch (unacknowledged deliveries in flight).
/// Set to 1 for strict per-queue ordering at the cost of throughput.
pub const DEFAULT_PREFETCH: u16 = 16;

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Not connected to broker")]
    NotConnected,

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid topic: {0}")]
    Topic(#[from] TopicError),

    #[error("Subscribe not supported for this bus type")]
    SubscribeNotSupported,
}

impl BusError {
    /// Whether retrying the same call later could succeed. Serialization and
    /// validation failures are permanent; broker trouble is not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BusError::Connection(_) | BusError::NotConnected | BusError::Publish(_)
        )
    }
}

/// Errors a handler reports back to the consume loop. The variant decides
/// the message's fate under the active [`AckPolicy`].
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The payload could not be decoded. Never redelivered: the bytes will
    /// not get better on a second read.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// The handler ran and failed. Eligible for redelivery.
    #[error("handler failed: {0}")]
    Failed(String),

    /// The handler exceeded its deadline. Counted like a failure.
    #[error("handler timed out after {0:?}")]
    Timeout(Duration),
}

impl HandlerError {
    pub fn failed(error: impl std::fmt::Display) -> Self {
        HandlerError::Failed(error.to_string())
    }
}

/// A raw delivery handed to a [`MessageHandler`].
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Routing key the producer published under.
    pub topic: String,
    /// Serialized payload as it arrived.
    pub payload: Bytes,
    /// Queue group this delivery was consumed from.
    pub queue_group: String,
    /// True when this is not the first delivery attempt.
    pub redelivered: bool,
    /// 1-based delivery attempt counter.
    pub attempt: u32,
}

/// Delivery metadata without the payload, for typed handlers that already
/// hold the decoded event.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub topic: String,
    pub queue_group: String,
    pub redelivered: bool,
    pub attempt: u32,
}

impl From<&InboundMessage> for MessageContext {
    fn from(msg: &InboundMessage) -> Self {
        Self {
            topic: msg.topic.clone(),
            queue_group: msg.queue_group.clone(),
            redelivered: msg.redelivered,
            attempt: msg.attempt,
        }
    }
}

/// Handler for processing raw deliveries from a queue.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, msg: InboundMessage)
        -> BoxFuture<'static, std::result::Result<(), HandlerError>>;
}

/// What a consumer does with a delivery after the handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    /// Acknowledge only on success. Failures are re-enqueued until the
    /// attempt budget is spent, then routed to the dead letter queue.
    /// `max_attempts` counts handler invocations in total, so 1 means no
    /// redelivery at all.
    DeadLetter { max_attempts: u32 },
    /// Acknowledge every delivery once the handler returns, success or not.
    /// Failed messages are dropped with an error log. Kept for consumers
    /// that cannot yet tolerate redelivery.
    AckAlways,
}

impl Default for AckPolicy {
    fn default() -> Self {
        AckPolicy::DeadLetter {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// The fate of a failed delivery, decided by [`disposition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// Acknowledge and move on.
    Ack,
    /// Re-enqueue at the back of the queue with a bumped attempt counter.
    Retry { next_attempt: u32 },
    /// Route to the dead letter queue, then acknowledge the original.
    DeadLetter,
}

/// Applies the acknowledgment protocol to a handler failure. Success is
/// always a plain ack and never reaches this decision.
pub(crate) fn disposition(policy: AckPolicy, attempt: u32, error: &HandlerError) -> Disposition {
    match policy {
        AckPolicy::AckAlways => Disposition::Ack,
        AckPolicy::DeadLetter { max_attempts } => match error {
            HandlerError::Malformed(_) => Disposition::DeadLetter,
            HandlerError::Failed(_) | HandlerError::Timeout(_) => {
                if attempt < max_attempts {
                    Disposition::Retry {
                        next_attempt: attempt + 1,
                    }
                } else {
                    Disposition::DeadLetter
                }
            }
        },
    }
}

/// A durable queue identity: the queue group name plus the topic pattern it
/// binds to. Replicas that share a group name compete for deliveries.
///
/// Group names follow `<service-name>-<event-purpose>`, e.g.
/// `community-service-user-registered`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    queue_group: String,
    pattern: TopicPattern,
}

impl QueueBinding {
    pub fn new(
        queue_group: impl Into<String>,
        pattern: impl Into<String>,
    ) -> std::result::Result<Self, TopicError> {
        let queue_group = queue_group.into();
        // The group name doubles as a DLQ routing segment, so it must be one.
        if !valid_literal_segment(&queue_group) {
            return Err(TopicError::InvalidSegment(queue_group));
        }
        Ok(Self {
            queue_group,
            pattern: TopicPattern::new(pattern)?,
        })
    }

    pub fn queue_group(&self) -> &str {
        &self.queue_group
    }

    pub fn pattern(&self) -> &TopicPattern {
        &self.pattern
    }
}

/// Interface for topic publish and durable queue consumption.
///
/// Implementations:
/// - `AmqpEventBus`: RabbitMQ via AMQP
/// - `MemoryEventBus`: In-memory durable-queue emulation for dev and tests
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a serialized payload under `topic`.
    ///
    /// Resolves once the broker has accepted the message for routing.
    /// Performs no internal retry; callers that need one wrap this (see
    /// [`publish_with_retry`](crate::publisher::publish_with_retry)).
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Idempotently declare the durable queue for `binding` and bind it to
    /// the shared exchange, without starting a consumer. Messages routed to
    /// the queue from then on are retained until consumed.
    async fn bind_queue(&self, binding: &QueueBinding) -> Result<()>;

    /// Declare and bind as [`EventBus::bind_queue`] does, then start
    /// consuming on a background task. Returns once the consumer is
    /// registered; deliveries flow to `handler` from then on, and setup
    /// failures surface here rather than inside the background task.
    async fn consume(
        &self,
        binding: QueueBinding,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()>;
}

// ============================================================================
// Configuration
// ============================================================================

/// Messaging type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// AMQP/RabbitMQ messaging.
    #[default]
    Amqp,
    /// In-memory messaging (single process, no external deps).
    Memory,
}

/// Messaging configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// AMQP-specific configuration.
    pub amqp: AmqpBusConfig,
    /// Consumer-side acknowledgment configuration.
    pub consumer: ConsumerConfig,
}

impl MessagingConfig {
    pub fn ack_policy(&self) -> AckPolicy {
        match self.consumer.ack {
            AckMode::DeadLetter => AckPolicy::DeadLetter {
                max_attempts: self.consumer.max_attempts,
            },
            AckMode::AckAlways => AckPolicy::AckAlways,
        }
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.consumer.handler_timeout_secs)
    }

    #[cfg(feature = "amqp")]
    pub fn amqp_config(&self) -> AmqpConfig {
        AmqpConfig {
            url: self.amqp.url.clone(),
            exchange: self.amqp.exchange.clone(),
            prefetch: self.consumer.prefetch,
            ack_policy: self.ack_policy(),
            reconnect_min_delay: Duration::from_millis(self.amqp.reconnect_min_delay_ms),
            reconnect_max_delay: Duration::from_millis(self.amqp.reconnect_max_delay_ms),
        }
    }
}

/// AMQP-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpBusConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Topic exchange to declare and publish to.
    pub exchange: String,
    /// Floor of the reconnect backoff window.
    pub reconnect_min_delay_ms: u64,
    /// Ceiling of the reconnect backoff window.
    pub reconnect_max_delay_ms: u64,
}

impl Default for AmqpBusConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            exchange: EVENTS_EXCHANGE.to_string(),
            reconnect_min_delay_ms: 100,
            reconnect_max_delay_ms: 30_000,
        }
    }
}

/// Acknowledgment mode discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckMode {
    /// Ack on success, bounded redelivery, then dead letter.
    #[default]
    DeadLetter,
    /// Ack unconditionally after the handler runs.
    AckAlways,
}

/// Consumer-side acknowledgment configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Acknowledgment mode.
    pub ack: AckMode,
    /// Total handler invocations before dead-lettering (dead-letter mode).
    pub max_attempts: u32,
    /// Unacknowledged deliveries in flight per consumer.
    pub prefetch: u16,
    /// Per-message handler deadline.
    pub handler_timeout_secs: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            ack: AckMode::DeadLetter,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            prefetch: DEFAULT_PREFETCH,
            handler_timeout_secs: 30,
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Build the event bus selected by `config.messaging_type`.
///
/// AMQP requires the `amqp` feature (included in default).
pub async fn init_event_bus(config: &MessagingConfig) -> Result<Arc<dyn EventBus>> {
    match config.messaging_type {
        MessagingType::Amqp => {
            #[cfg(feature = "amqp")]
            {
                let bus = AmqpEventBus::new(config.amqp_config()).await?;
                info!(messaging_type = "amqp", "Event bus initialized");
                Ok(Arc::new(bus))
            }

            #[cfg(not(feature = "amqp"))]
            {
                Err(BusError::Connection(
                    "AMQP support requires the 'amqp' feature. Rebuild with --features amqp"
                        .to_string(),
                ))
            }
        }
        MessagingType::Memory => {
            let bus = MemoryEventBus::with_policy(config.ack_policy());
            info!(messaging_type = "memory", "Event bus initialized");
            Ok(Arc::new(bus))
        }
    }
}
