//! Typed event listeners.
//!
//! A [`Listener`] joins one durable queue group to one event type's topic.
//! The raw delivery is decoded before the caller's [`EventHandler`] runs;
//! a payload that does not decode is malformed and goes straight to the
//! dead letter queue instead of burning redelivery attempts.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::info;

use crate::bus::{
    EventBus, HandlerError, InboundMessage, MessageContext, MessageHandler, QueueBinding, Result,
};
use crate::events::Event;

/// Ceiling on a single handler invocation before it counts as a failure.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// Processes decoded events of type `E`.
///
/// One type may serve several event types by implementing this trait once
/// per type, sharing its state across them.
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync {
    async fn handle(
        &self,
        event: E,
        ctx: &MessageContext,
    ) -> std::result::Result<(), HandlerError>;
}

/// Subscribes a durable queue group to `E`'s topic and feeds decoded
/// events to an [`EventHandler`].
pub struct Listener<E: Event> {
    bus: Arc<dyn EventBus>,
    queue_group: String,
    handler: Arc<dyn EventHandler<E>>,
    handler_timeout: Duration,
}

impl<E: Event> Listener<E> {
    pub fn new(
        bus: Arc<dyn EventBus>,
        queue_group: impl Into<String>,
        handler: Arc<dyn EventHandler<E>>,
    ) -> Self {
        Self {
            bus,
            queue_group: queue_group.into(),
            handler,
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn queue_group(&self) -> &str {
        &self.queue_group
    }

    fn binding(&self) -> Result<QueueBinding> {
        Ok(QueueBinding::new(&self.queue_group, E::TOPIC)?)
    }

    /// Declare the durable queue and its binding without consuming.
    ///
    /// Lets a service claim its queue at boot so events published before
    /// the consumer starts are retained.
    pub async fn bind(&self) -> Result<()> {
        self.bus.bind_queue(&self.binding()?).await
    }

    /// Declare, bind, and start consuming on a background task.
    pub async fn listen(&self) -> Result<()> {
        let binding = self.binding()?;
        info!(
            queue = %self.queue_group,
            topic = E::TOPIC,
            "Listener starting"
        );

        let adapter = Arc::new(TypedAdapter::<E> {
            handler: self.handler.clone(),
            timeout: self.handler_timeout,
            _event: PhantomData,
        });
        self.bus.consume(binding, adapter).await
    }
}

/// Bridges the raw [`MessageHandler`] contract to a typed handler:
/// decode, build the context, enforce the deadline.
struct TypedAdapter<E: Event> {
    handler: Arc<dyn EventHandler<E>>,
    timeout: Duration,
    _event: PhantomData<fn() -> E>,
}

impl<E: Event> MessageHandler for TypedAdapter<E> {
    fn handle(
        &self,
        msg: InboundMessage,
    ) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        let handler = self.handler.clone();
        let timeout = self.timeout;

        async move {
            let event: E = serde_json::from_slice(&msg.payload).map_err(|e| {
                HandlerError::Malformed(format!("Failed to decode {}: {}", msg.topic, e))
            })?;
            let ctx = MessageContext::from(&msg);

            match tokio::time::timeout(timeout, handler.handle(event, &ctx)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(HandlerError::Timeout(timeout)),
            }
        }
        .boxed()
    }
}
