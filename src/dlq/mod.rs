//! Dead letter queue plumbing.
//!
//! Messages that spend their redelivery budget, and payloads that never
//! decode, end up here instead of being dropped or poisoning their queue.
//! The envelope keeps enough context for an operator to inspect the
//! failure and replay the message once the consumer is fixed.
//!
//! ## Routing
//!
//! Dead letters publish under `dlq.{queue_group}`, one routing key per
//! rejecting consumer, so operators can filter by the queue that gave up
//! on the message and replay into exactly that queue group.
//!
//! ## Envelope
//!
//! Dead letters travel as a JSON envelope carrying the original payload
//! (base64), the failure classification, the attempt count, and when the
//! rejection occurred. The original bytes are preserved verbatim so a
//! repaired consumer can replay them unchanged.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::bus::{HandlerError, InboundMessage};

/// DLQ routing key prefix. Full key: `{prefix}.{queue_group}`
pub const DLQ_TOPIC_PREFIX: &str = "dlq";

/// Durable queue that collects every dead letter (bound to `dlq.#`).
pub const DLQ_QUEUE: &str = "learnsphere-dlq";

/// Build the DLQ routing key for a queue group.
pub fn dlq_topic_for_queue(queue_group: &str) -> String {
    format!("{}.{}", DLQ_TOPIC_PREFIX, queue_group)
}

/// Errors that can occur during DLQ operations.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("DLQ not configured")]
    NotConfigured,

    #[error("Failed to serialize dead letter: {0}")]
    Serialization(String),

    #[error("Failed to publish to DLQ: {0}")]
    PublishFailed(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

/// Why a message was routed to the dead letter queue.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureKind {
    /// The payload never decoded. These skip redelivery entirely.
    Malformed { error: String },
    /// The handler failed on the final permitted attempt.
    HandlerFailed { error: String },
    /// The handler exceeded its deadline on the final permitted attempt.
    TimedOut { timeout: Duration },
}

/// A message the consumer gave up on, with enough context to diagnose and
/// replay it.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// Routing key the producer originally published under.
    pub topic: String,
    /// Queue group that rejected the message.
    pub queue_group: String,
    /// Original payload bytes, verbatim.
    pub payload: Bytes,
    /// Human-readable reason for rejection.
    pub reason: String,
    /// Structured failure classification.
    pub failure: FailureKind,
    /// Handler invocations spent before giving up.
    pub attempts: u32,
    /// When the rejection occurred.
    pub occurred_at: DateTime<Utc>,
    /// Additional context.
    pub metadata: HashMap<String, String>,
}

impl DeadLetter {
    /// Create a dead letter from a delivery the consume loop gave up on.
    pub fn from_failure(msg: &InboundMessage, error: &HandlerError) -> Self {
        let failure = match error {
            HandlerError::Malformed(e) => FailureKind::Malformed { error: e.clone() },
            HandlerError::Failed(e) => FailureKind::HandlerFailed { error: e.clone() },
            HandlerError::Timeout(d) => FailureKind::TimedOut { timeout: *d },
        };

        let reason = match &failure {
            FailureKind::Malformed { error } => {
                format!("Malformed payload on '{}': {}", msg.topic, error)
            }
            FailureKind::HandlerFailed { error } => {
                format!("Handler failed after {} attempt(s): {}", msg.attempt, error)
            }
            FailureKind::TimedOut { timeout } => format!(
                "Handler timed out after {} attempt(s) ({:?} deadline)",
                msg.attempt, timeout
            ),
        };

        Self {
            topic: msg.topic.clone(),
            queue_group: msg.queue_group.clone(),
            payload: msg.payload.clone(),
            reason,
            failure,
            attempts: msg.attempt,
            occurred_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Add metadata to the dead letter.
    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// The DLQ routing key for this dead letter.
    pub fn dlq_topic(&self) -> String {
        dlq_topic_for_queue(&self.queue_group)
    }

    /// The JSON envelope published to the DLQ.
    pub fn to_wire_json(&self) -> serde_json::Value {
        let failure = match &self.failure {
            FailureKind::Malformed { error } => json!({"kind": "malformed", "error": error}),
            FailureKind::HandlerFailed { error } => json!({"kind": "failed", "error": error}),
            FailureKind::TimedOut { timeout } => {
                json!({"kind": "timeout", "timeoutMs": timeout.as_millis() as u64})
            }
        };
        json!({
            "topic": self.topic,
            "queueGroup": self.queue_group,
            "reason": self.reason,
            "failure": failure,
            "attempts": self.attempts,
            "occurredAt": self.occurred_at.to_rfc3339(),
            "payloadBase64": BASE64.encode(&self.payload),
            "metadata": self.metadata,
        })
    }
}

/// Trait for publishing messages to a dead letter queue.
///
/// Implementations handle the actual transport (AMQP, in-memory, etc.).
#[async_trait]
pub trait DeadLetterPublisher: Send + Sync {
    /// Publish a dead letter to the queue.
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError>;

    /// Check if the publisher is configured and ready.
    fn is_configured(&self) -> bool {
        true
    }
}

/// No-op DLQ publisher that logs but doesn't actually send anywhere.
///
/// Used when DLQ is not configured or for testing.
pub struct NoopDeadLetterPublisher;

#[async_trait]
impl DeadLetterPublisher for NoopDeadLetterPublisher {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        warn!(
            topic = %dead_letter.dlq_topic(),
            reason = %dead_letter.reason,
            "DLQ not configured, logging dead letter"
        );
        Ok(())
    }

    fn is_configured(&self) -> bool {
        false
    }
}

/// DLQ publisher backed by a channel.
///
/// Used where another task drains dead letters, e.g. an ops exporter.
pub struct ChannelDeadLetterPublisher {
    sender: mpsc::UnboundedSender<DeadLetter>,
}

impl ChannelDeadLetterPublisher {
    /// Create a new channel-based DLQ publisher.
    ///
    /// Returns the publisher and a receiver for consuming dead letters.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeadLetter>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl DeadLetterPublisher for ChannelDeadLetterPublisher {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        info!(
            topic = %dead_letter.dlq_topic(),
            reason = %dead_letter.reason,
            "Publishing to channel DLQ"
        );
        self.sender
            .send(dead_letter)
            .map_err(|e| DlqError::PublishFailed(e.to_string()))
    }
}

/// DLQ publisher that retains every dead letter in memory.
///
/// Backs the in-memory bus and lets tests assert on what got dead-lettered.
#[derive(Default)]
pub struct RecordingDeadLetterPublisher {
    entries: RwLock<Vec<DeadLetter>>,
}

impl RecordingDeadLetterPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of everything dead-lettered so far.
    pub fn all(&self) -> Vec<DeadLetter> {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl DeadLetterPublisher for RecordingDeadLetterPublisher {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        info!(
            topic = %dead_letter.dlq_topic(),
            reason = %dead_letter.reason,
            "Recording dead letter"
        );
        self.entries.write().push(dead_letter);
        Ok(())
    }
}
