//! In-memory event bus with durable queue emulation.
//!
//! Routes publishes through the same topic-pattern matching the broker uses
//! and buffers messages per queue group until a consumer drains them, so
//! bind-then-publish-then-listen behaves exactly as it does against
//! RabbitMQ. Ideal for local development and testing without external
//! dependencies.
//!
//! Redelivery and dead-lettering follow the shared acknowledgment protocol;
//! dead letters are retained in memory and exposed via
//! [`MemoryEventBus::dead_letters`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, error, warn};

use super::{
    disposition, AckPolicy, Disposition, EventBus, InboundMessage, MessageHandler, QueueBinding,
    Result,
};
use crate::dlq::{DeadLetter, DeadLetterPublisher, RecordingDeadLetterPublisher};
use crate::topic::{Topic, TopicPattern};

/// A message sitting in a queue buffer awaiting delivery.
#[derive(Debug, Clone)]
struct StoredMessage {
    topic: String,
    payload: Bytes,
    attempt: u32,
    redelivered: bool,
}

/// One durable queue: its bindings, its buffer, and a wakeup for consumers.
#[derive(Default)]
struct QueueState {
    bindings: parking_lot::RwLock<Vec<TopicPattern>>,
    buffer: Mutex<VecDeque<StoredMessage>>,
    notify: Notify,
}

/// In-memory topic event bus.
///
/// Consumers attached to the same queue group compete for messages;
/// distinct groups each receive their own copy, mirroring topic exchange
/// fan-out into durable queues.
pub struct MemoryEventBus {
    queues: Arc<RwLock<HashMap<String, Arc<QueueState>>>>,
    ack_policy: AckPolicy,
    dead_letters: Arc<RecordingDeadLetterPublisher>,
}

impl MemoryEventBus {
    pub fn new() -> Self {
        Self::with_policy(AckPolicy::default())
    }

    pub fn with_policy(ack_policy: AckPolicy) -> Self {
        Self {
            queues: Arc::new(RwLock::new(HashMap::new())),
            ack_policy,
            dead_letters: RecordingDeadLetterPublisher::new(),
        }
    }

    /// Everything dead-lettered by this bus so far.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.all()
    }

    pub fn dead_letter_count(&self) -> usize {
        self.dead_letters.len()
    }

    /// Get or create the queue for `binding` and record the binding.
    async fn queue(&self, binding: &QueueBinding) -> Arc<QueueState> {
        let state = {
            let mut queues = self.queues.write().await;
            queues
                .entry(binding.queue_group().to_string())
                .or_insert_with(|| Arc::new(QueueState::default()))
                .clone()
        };
        {
            let mut bindings = state.bindings.write();
            if !bindings.iter().any(|p| p == binding.pattern()) {
                bindings.push(binding.pattern().clone());
            }
        }
        state
    }
}

impl Default for MemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let topic = Topic::new(topic)?;

        let queues = self.queues.read().await;
        let mut routed = 0usize;
        for state in queues.values() {
            let matched = state
                .bindings
                .read()
                .iter()
                .any(|pattern| pattern.matches(topic.as_str()));
            if matched {
                state.buffer.lock().await.push_back(StoredMessage {
                    topic: topic.as_str().to_string(),
                    payload: payload.clone(),
                    attempt: 1,
                    redelivered: false,
                });
                state.notify.notify_one();
                routed += 1;
            }
        }

        // Unroutable messages are dropped, as a topic exchange would.
        debug!(topic = %topic, queues = routed, "Published message");
        Ok(())
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<()> {
        self.queue(binding).await;
        debug!(
            queue_group = binding.queue_group(),
            pattern = %binding.pattern(),
            "Queue bound"
        );
        Ok(())
    }

    async fn consume(
        &self,
        binding: QueueBinding,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let state = self.queue(&binding).await;
        let policy = self.ack_policy;
        let dlq = self.dead_letters.clone();
        let queue_group = binding.queue_group().to_string();

        tokio::spawn(async move {
            debug!(queue_group = %queue_group, "Memory consumer started");
            loop {
                let next = { state.buffer.lock().await.pop_front() };
                match next {
                    Some(stored) => {
                        deliver(&state, &queue_group, stored, &handler, policy, &dlq).await;
                    }
                    None => state.notify.notified().await,
                }
            }
        });

        Ok(())
    }
}

/// Run one delivery through the handler and apply the acknowledgment
/// protocol to the outcome.
async fn deliver(
    state: &QueueState,
    queue_group: &str,
    stored: StoredMessage,
    handler: &Arc<dyn MessageHandler>,
    policy: AckPolicy,
    dlq: &Arc<RecordingDeadLetterPublisher>,
) {
    let msg = InboundMessage {
        topic: stored.topic.clone(),
        payload: stored.payload.clone(),
        queue_group: queue_group.to_string(),
        redelivered: stored.redelivered,
        attempt: stored.attempt,
    };

    match handler.handle(msg.clone()).await {
        Ok(()) => {
            debug!(topic = %msg.topic, queue_group, "Message processed");
        }
        Err(error) => match disposition(policy, msg.attempt, &error) {
            Disposition::Ack => {
                error!(
                    topic = %msg.topic,
                    queue_group,
                    %error,
                    "Handler failed; acknowledging anyway (ack-always)"
                );
            }
            Disposition::Retry { next_attempt } => {
                warn!(
                    topic = %msg.topic,
                    queue_group,
                    attempt = msg.attempt,
                    %error,
                    "Handler failed; re-enqueueing"
                );
                state.buffer.lock().await.push_back(StoredMessage {
                    topic: stored.topic,
                    payload: stored.payload,
                    attempt: next_attempt,
                    redelivered: true,
                });
                state.notify.notify_one();
            }
            Disposition::DeadLetter => {
                warn!(
                    topic = %msg.topic,
                    queue_group,
                    attempt = msg.attempt,
                    %error,
                    "Routing message to dead letter queue"
                );
                let dead_letter = DeadLetter::from_failure(&msg, &error);
                if let Err(e) = dlq.publish(dead_letter).await {
                    error!(error = %e, "Failed to record dead letter");
                }
            }
        },
    }
}
