//! Typed event publishers.
//!
//! A [`Publisher`] binds one event type to its catalog topic and owns the
//! serialization step, so call sites hand over a struct and never touch
//! routing keys or JSON. Publishes are single-shot: the broker either
//! confirms or the error surfaces to the caller, who knows whether the
//! operation is worth retrying (see [`publish_with_retry`]).

use std::marker::PhantomData;
use std::sync::Arc;

use backon::Retryable;
use bytes::Bytes;
use tracing::{info, warn};

use crate::bus::{BusError, EventBus, Result};
use crate::events::Event;
use crate::utils::retry::publish_backoff;

/// Publishes events of type `E` to [`Event::TOPIC`].
pub struct Publisher<E: Event> {
    bus: Arc<dyn EventBus>,
    _event: PhantomData<E>,
}

impl<E: Event> Publisher<E> {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self {
            bus,
            _event: PhantomData,
        }
    }

    /// Serialize the event and publish it to its topic.
    #[tracing::instrument(name = "event.publish", skip_all, fields(topic = E::TOPIC))]
    pub async fn publish(&self, event: &E) -> Result<()> {
        let payload = Bytes::from(serde_json::to_vec(event)?);
        self.bus.publish(E::TOPIC, payload.clone()).await?;
        info!(
            topic = E::TOPIC,
            payload = %String::from_utf8_lossy(&payload),
            "Event published"
        );
        Ok(())
    }
}

// Manual impl: derive would require E: Clone, which events don't need here.
impl<E: Event> Clone for Publisher<E> {
    fn clone(&self) -> Self {
        Self {
            bus: self.bus.clone(),
            _event: PhantomData,
        }
    }
}

/// Publish with backoff while the bus reports transient errors
/// (disconnected, unconfirmed). Serialization and topic errors return
/// immediately since a retry cannot fix the payload.
pub async fn publish_with_retry<E: Event>(publisher: &Publisher<E>, event: &E) -> Result<()> {
    (|| async { publisher.publish(event).await })
        .retry(publish_backoff())
        .when(BusError::is_transient)
        .notify(|error, delay| {
            warn!(
                topic = E::TOPIC,
                error = %error,
                backoff_ms = %delay.as_millis(),
                "Publish failed, retrying"
            );
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::UserRegistered;
    use crate::test_utils::MockEventBus;

    fn sample_user() -> UserRegistered {
        UserRegistered {
            id: "u-1".to_string(),
            first_name: "Ann".to_string(),
            last_name: "Lee".to_string(),
            email: Some("ann@example.com".to_string()),
            avatar_url: None,
        }
    }

    #[tokio::test]
    async fn test_publish_routes_to_event_topic() {
        let bus = MockEventBus::new();
        let publisher = Publisher::<UserRegistered>::new(bus.clone());

        publisher.publish(&sample_user()).await.unwrap();

        let published = bus.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "user.registered");
    }

    #[tokio::test]
    async fn test_publish_serializes_wire_shape() {
        let bus = MockEventBus::new();
        let publisher = Publisher::<UserRegistered>::new(bus.clone());

        publisher.publish(&sample_user()).await.unwrap();

        let published = bus.published();
        let value: serde_json::Value = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(value["id"], "u-1");
        assert_eq!(value["firstName"], "Ann");
        assert_eq!(value["email"], "ann@example.com");
        // Unset optional fields stay off the wire
        assert!(value.get("avatarUrl").is_none());
    }

    #[tokio::test]
    async fn test_publish_with_retry_recovers_from_transient_failures() {
        let bus = MockEventBus::new();
        bus.fail_next_publishes(2);
        let publisher = Publisher::<UserRegistered>::new(bus.clone());

        publish_with_retry(&publisher, &sample_user()).await.unwrap();

        assert_eq!(bus.published().len(), 1);
        assert_eq!(bus.publish_attempts(), 3);
    }

    #[tokio::test]
    async fn test_cloned_publisher_shares_bus() {
        let bus = MockEventBus::new();
        let publisher = Publisher::<UserRegistered>::new(bus.clone());
        let cloned = publisher.clone();

        publisher.publish(&sample_user()).await.unwrap();
        cloned.publish(&sample_user()).await.unwrap();

        assert_eq!(bus.published().len(), 2);
    }
}
