//! Test utilities and mock implementations.
//!
//! This module provides mock implementations of the bus traits for testing
//! without requiring a running broker.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::bus::{
    BusError, EventBus, HandlerError, InboundMessage, MessageHandler, QueueBinding,
    Result as BusResult,
};

/// Handler that counts deliveries and records every message it sees.
///
/// The count and the recorded messages are shared handles, so they stay
/// readable after the handler moves into a consumer. `with_notify` adds a
/// channel that fires per delivery, for tests that wait on a real broker
/// instead of sleeping.
#[derive(Default)]
pub struct CountingHandler {
    count: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<InboundMessage>>>,
    notify: Option<mpsc::UnboundedSender<()>>,
}

impl CountingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_notify() -> (Self, mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = Self {
            notify: Some(tx),
            ..Self::default()
        };
        (handler, rx)
    }

    pub fn count(&self) -> Arc<AtomicUsize> {
        self.count.clone()
    }

    pub fn received(&self) -> Arc<Mutex<Vec<InboundMessage>>> {
        self.received.clone()
    }
}

impl MessageHandler for CountingHandler {
    fn handle(
        &self,
        msg: InboundMessage,
    ) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        let count = self.count.clone();
        let received = self.received.clone();
        let notify = self.notify.clone();
        Box::pin(async move {
            received.lock().push(msg);
            count.fetch_add(1, Ordering::SeqCst);
            if let Some(tx) = notify {
                let _ = tx.send(());
            }
            Ok(())
        })
    }
}

/// Handler that fails its first `fail_first` invocations, then succeeds.
///
/// `failing_first(u32::MAX)` never succeeds, which is how redelivery
/// exhaustion is exercised.
pub struct FlakyHandler {
    calls: Arc<AtomicUsize>,
    fail_first: u32,
}

impl FlakyHandler {
    pub fn failing_first(fail_first: u32) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            fail_first,
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl MessageHandler for FlakyHandler {
    fn handle(
        &self,
        _msg: InboundMessage,
    ) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        let calls = self.calls.clone();
        let fail_first = self.fail_first;
        Box::pin(async move {
            let call = calls.fetch_add(1, Ordering::SeqCst) as u64 + 1;
            if call <= u64::from(fail_first) {
                Err(HandlerError::Failed(format!(
                    "induced failure on call {}",
                    call
                )))
            } else {
                Ok(())
            }
        })
    }
}

/// Mock event bus that records publishes and bindings.
///
/// `consume` is not supported; tests that need delivery use
/// `MemoryEventBus` instead.
#[derive(Default)]
pub struct MockEventBus {
    published: Mutex<Vec<(String, Bytes)>>,
    bindings: Mutex<Vec<QueueBinding>>,
    publish_attempts: AtomicU32,
    failures_remaining: AtomicU32,
}

impl MockEventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `n` publishes with a transient error.
    pub fn fail_next_publishes(&self, n: u32) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    /// Everything successfully published, as (topic, payload) pairs.
    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.published.lock().clone()
    }

    /// Queue bindings declared so far.
    pub fn bindings(&self) -> Vec<QueueBinding> {
        self.bindings.lock().clone()
    }

    /// Total publish calls, including failed ones.
    pub fn publish_attempts(&self) -> u32 {
        self.publish_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventBus for MockEventBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        self.publish_attempts.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BusError::NotConnected);
        }

        self.published.lock().push((topic.to_string(), payload));
        Ok(())
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> BusResult<()> {
        self.bindings.lock().push(binding.clone());
        Ok(())
    }

    async fn consume(
        &self,
        _binding: QueueBinding,
        _handler: Arc<dyn MessageHandler>,
    ) -> BusResult<()> {
        Err(BusError::SubscribeNotSupported)
    }
}
