//! End-to-end synchronization scenarios on the in-memory bus.
//!
//! Exercises the contract every bus backend must honor: round trips, queue
//! retention, idempotent replay, poison messages, bounded redelivery, and
//! the realtime fan-out scoping. No external services required.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use learnsphere_messaging::bus::{
    AckPolicy, EventBus, HandlerError, MemoryEventBus, MessageContext, QueueBinding,
};
use learnsphere_messaging::dlq::FailureKind;
use learnsphere_messaging::events::{
    ChatMediaProcessed, Event, NotificationCreated, PaymentSuccessful, UserProfileUpdated,
    UserRegistered,
};
use learnsphere_messaging::handlers::{
    ChatMediaHandler, ChatMessageStore, EnrollmentHandler, EnrollmentStore, MemoryChatMessageStore,
    MemoryEnrollmentStore, MemoryUserProjectionStore, NotificationHandler, UserProjectionHandler,
    UserProjectionStore,
};
use learnsphere_messaging::listener::{EventHandler, Listener};
use learnsphere_messaging::publisher::Publisher;
use learnsphere_messaging::realtime::{ConnectionHandle, ConnectionRegistry};
use learnsphere_messaging::test_utils::{CountingHandler, FlakyHandler};

/// Typed handler that forwards every decoded event to a channel.
struct Forwarding<E: Event> {
    tx: mpsc::UnboundedSender<E>,
}

impl<E: Event> Forwarding<E> {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<E>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl<E: Event> EventHandler<E> for Forwarding<E> {
    async fn handle(&self, event: E, _ctx: &MessageContext) -> Result<(), HandlerError> {
        let _ = self.tx.send(event);
        Ok(())
    }
}

fn registered(id: &str, first_name: &str) -> UserRegistered {
    UserRegistered {
        id: id.to_string(),
        first_name: first_name.to_string(),
        last_name: "Lee".to_string(),
        email: Some(format!("{}@learnsphere.io", id)),
        avatar_url: None,
    }
}

async fn recv_one<E>(rx: &mut mpsc::UnboundedReceiver<E>) -> E {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("Timed out waiting for event")
        .expect("Channel closed")
}

/// Tests that a listener bound to a topic receives the exact payload
/// published on it.
#[tokio::test]
async fn typed_round_trip_delivers_exact_payload() {
    let bus = Arc::new(MemoryEventBus::new());

    let (handler, mut rx) = Forwarding::new();
    Listener::<UserRegistered>::new(bus.clone(), "community-service-user-registered", handler)
        .listen()
        .await
        .unwrap();
    sleep(Duration::from_millis(10)).await;

    let event = registered("u1", "Ann");
    Publisher::<UserRegistered>::new(bus.clone())
        .publish(&event)
        .await
        .unwrap();

    let received = recv_one(&mut rx).await;
    assert_eq!(received, event);
}

/// Tests that a wildcard binding receives events from every matching topic.
#[tokio::test]
async fn wildcard_binding_matches_all_user_topics() {
    let bus = Arc::new(MemoryEventBus::new());

    let (handler, mut notified) = CountingHandler::with_notify();
    let count = handler.count();
    let binding = QueueBinding::new("analytics-service-user-activity", "user.*").unwrap();
    bus.consume(binding, Arc::new(handler)).await.unwrap();
    sleep(Duration::from_millis(10)).await;

    Publisher::<UserRegistered>::new(bus.clone())
        .publish(&registered("u1", "Ann"))
        .await
        .unwrap();
    Publisher::<UserProfileUpdated>::new(bus.clone())
        .publish(&UserProfileUpdated {
            id: "u1".to_string(),
            first_name: "Annie".to_string(),
            last_name: "Lee".to_string(),
            email: None,
            avatar_url: None,
        })
        .await
        .unwrap();

    for _ in 0..2 {
        timeout(Duration::from_secs(5), notified.recv())
            .await
            .expect("Timed out waiting for delivery")
            .expect("Channel closed");
    }
    assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 2);
}

/// Tests that messages published after the queue is bound but before the
/// consumer starts are retained and delivered once consumption begins.
#[tokio::test]
async fn bound_queue_retains_messages_until_consumed() {
    let bus = Arc::new(MemoryEventBus::new());

    let (handler, mut rx) = Forwarding::new();
    let listener =
        Listener::<UserRegistered>::new(bus.clone(), "community-service-user-registered", handler);
    listener.bind().await.unwrap();

    let publisher = Publisher::<UserRegistered>::new(bus.clone());
    for i in 0..3 {
        publisher
            .publish(&registered(&format!("u{}", i), "Ann"))
            .await
            .unwrap();
    }

    listener.listen().await.unwrap();

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(recv_one(&mut rx).await.id);
    }
    assert_eq!(ids, vec!["u0", "u1", "u2"]);
}

/// Tests that a non-JSON payload is dead-lettered without invoking the
/// handler and without blocking later messages on the same queue.
#[tokio::test]
async fn malformed_payload_dead_letters_without_blocking_queue() {
    let bus = Arc::new(MemoryEventBus::new());

    let (handler, mut rx) = Forwarding::new();
    Listener::<UserRegistered>::new(bus.clone(), "community-service-user-registered", handler)
        .listen()
        .await
        .unwrap();
    sleep(Duration::from_millis(10)).await;

    bus.publish("user.registered", Bytes::from_static(b"not json"))
        .await
        .unwrap();
    Publisher::<UserRegistered>::new(bus.clone())
        .publish(&registered("u2", "Ben"))
        .await
        .unwrap();

    let received = recv_one(&mut rx).await;
    assert_eq!(received.id, "u2");

    let dead = bus.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].topic, "user.registered");
    assert_eq!(dead[0].attempts, 1);
    assert!(matches!(dead[0].failure, FailureKind::Malformed { .. }));
}

/// Tests that unknown payload fields are ignored so producers can add
/// fields without coordinating a consumer release.
#[tokio::test]
async fn unknown_payload_fields_are_ignored() {
    let bus = Arc::new(MemoryEventBus::new());

    let (handler, mut rx) = Forwarding::new();
    Listener::<UserRegistered>::new(bus.clone(), "community-service-user-registered", handler)
        .listen()
        .await
        .unwrap();
    sleep(Duration::from_millis(10)).await;

    let payload = serde_json::json!({
        "id": "u7",
        "firstName": "Noah",
        "lastName": "Reed",
        "role": "student",
        "tenantId": "acme",
    });
    bus.publish(
        "user.registered",
        Bytes::from(serde_json::to_vec(&payload).unwrap()),
    )
    .await
    .unwrap();

    let received = recv_one(&mut rx).await;
    assert_eq!(received.id, "u7");
    assert_eq!(received.first_name, "Noah");
    assert_eq!(received.last_name, "Reed");
    assert!(bus.dead_letters().is_empty());
}

/// Tests the registration-then-edit scenario: replaying the registration
/// leaves one projection row, and a later profile update wins.
#[tokio::test]
async fn user_replay_converges_and_update_wins() {
    let bus = Arc::new(MemoryEventBus::new());
    let store = Arc::new(MemoryUserProjectionStore::new());
    let projection = Arc::new(UserProjectionHandler::new(store.clone()));

    Listener::<UserRegistered>::new(
        bus.clone(),
        "community-service-user-registered",
        projection.clone(),
    )
    .listen()
    .await
    .unwrap();
    Listener::<UserProfileUpdated>::new(
        bus.clone(),
        "community-service-user-profile-updated",
        projection,
    )
    .listen()
    .await
    .unwrap();
    sleep(Duration::from_millis(10)).await;

    let publisher = Publisher::<UserRegistered>::new(bus.clone());
    publisher.publish(&registered("u1", "Ann")).await.unwrap();
    publisher.publish(&registered("u1", "Ann")).await.unwrap();
    sleep(Duration::from_millis(50)).await;

    assert_eq!(store.len().await, 1);

    Publisher::<UserProfileUpdated>::new(bus.clone())
        .publish(&UserProfileUpdated {
            id: "u1".to_string(),
            first_name: "Annie".to_string(),
            last_name: "Lee".to_string(),
            email: None,
            avatar_url: Some("https://cdn.learnsphere.io/a/u1.png".to_string()),
        })
        .await
        .unwrap();
    sleep(Duration::from_millis(50)).await;

    assert_eq!(store.len().await, 1);
    let row = store.get("u1").await.unwrap().expect("projection exists");
    assert_eq!(row.first_name, "Annie");
    assert_eq!(
        row.avatar_url.as_deref(),
        Some("https://cdn.learnsphere.io/a/u1.png")
    );
}

/// Tests the chat attachment scenario: the message is persisted for its
/// conversation and fanned out only to sockets registered under it.
#[tokio::test]
async fn chat_media_persists_and_broadcasts_to_conversation() {
    let bus = Arc::new(MemoryEventBus::new());
    let store = Arc::new(MemoryChatMessageStore::new());
    let registry = Arc::new(ConnectionRegistry::new());

    let (c1_tx, mut c1_rx) = mpsc::channel::<String>(8);
    registry.register("c1", ConnectionHandle::new(c1_tx));
    let (c2_tx, mut c2_rx) = mpsc::channel::<String>(8);
    registry.register("c2", ConnectionHandle::new(c2_tx));

    Listener::<ChatMediaProcessed>::new(
        bus.clone(),
        "community-service-chat-media-processed",
        Arc::new(ChatMediaHandler::new(store.clone(), registry)),
    )
    .listen()
    .await
    .unwrap();
    sleep(Duration::from_millis(10)).await;

    Publisher::<ChatMediaProcessed>::new(bus.clone())
        .publish(&ChatMediaProcessed {
            message_id: Some("m1".to_string()),
            conversation_id: "c1".to_string(),
            sender_id: "u2".to_string(),
            file_url: "https://x/y.png".to_string(),
            file_name: "y.png".to_string(),
            file_type: "image/png".to_string(),
        })
        .await
        .unwrap();
    sleep(Duration::from_millis(50)).await;

    let stored = store.for_conversation("c1").await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, "m1");
    assert_eq!(stored[0].sender_id, "u2");

    let frame = c1_rx.try_recv().expect("c1 socket received a frame");
    let frame: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(frame["type"], "file");
    assert_eq!(frame["url"], "https://x/y.png");
    assert_eq!(frame["name"], "y.png");
    assert_eq!(frame["mimeType"], "image/png");

    assert!(c2_rx.try_recv().is_err(), "c2 must not see c1 traffic");
}

/// Tests that redelivering a payment event creates exactly one enrollment.
#[tokio::test]
async fn payment_replay_creates_single_enrollment() {
    let bus = Arc::new(MemoryEventBus::new());
    let store = Arc::new(MemoryEnrollmentStore::new());

    Listener::<PaymentSuccessful>::new(
        bus.clone(),
        "enrollment-service-payment-successful",
        Arc::new(EnrollmentHandler::new(store.clone())),
    )
    .listen()
    .await
    .unwrap();
    sleep(Duration::from_millis(10)).await;

    let publisher = Publisher::<PaymentSuccessful>::new(bus.clone());
    let payment = PaymentSuccessful {
        payment_id: "p1".to_string(),
        user_id: "u3".to_string(),
        course_id: "rust-101".to_string(),
        amount: Some(49.0),
    };
    publisher.publish(&payment).await.unwrap();
    publisher.publish(&payment).await.unwrap();
    publisher
        .publish(&PaymentSuccessful {
            payment_id: "p2".to_string(),
            user_id: "u3".to_string(),
            course_id: "rust-201".to_string(),
            amount: Some(59.0),
        })
        .await
        .unwrap();
    sleep(Duration::from_millis(50)).await;

    let enrollments = store.for_user("u3").await.unwrap();
    assert_eq!(enrollments.len(), 2);
    assert_eq!(enrollments[0].payment_id, "p1");
    assert_eq!(enrollments[1].payment_id, "p2");
}

/// Tests that a notification reaches the recipient's open sessions with the
/// documented frame shape and nobody else's.
#[tokio::test]
async fn notification_pushed_to_recipient_sessions_only() {
    let bus = Arc::new(MemoryEventBus::new());
    let registry = Arc::new(ConnectionRegistry::new());

    let (u9_tx, mut u9_rx) = mpsc::channel::<String>(8);
    registry.register("u9", ConnectionHandle::new(u9_tx));
    let (u10_tx, mut u10_rx) = mpsc::channel::<String>(8);
    registry.register("u10", ConnectionHandle::new(u10_tx));

    Listener::<NotificationCreated>::new(
        bus.clone(),
        "notification-service-notification-created",
        Arc::new(NotificationHandler::new(registry)),
    )
    .listen()
    .await
    .unwrap();
    sleep(Duration::from_millis(10)).await;

    Publisher::<NotificationCreated>::new(bus.clone())
        .publish(&NotificationCreated {
            id: "n1".to_string(),
            recipient_id: "u9".to_string(),
            kind: "course_update".to_string(),
            content: "Lesson 4 published".to_string(),
            link_url: Some("/courses/rust-101/lessons/4".to_string()),
        })
        .await
        .unwrap();
    sleep(Duration::from_millis(50)).await;

    let frame = u9_rx.try_recv().expect("recipient received the push");
    let frame: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(frame["id"], "n1");
    assert_eq!(frame["type"], "course_update");
    assert_eq!(frame["content"], "Lesson 4 published");
    assert_eq!(frame["linkUrl"], "/courses/rust-101/lessons/4");

    assert!(u10_rx.try_recv().is_err(), "other users get nothing");
}

/// Tests that a handler failing fewer times than the attempt budget ends up
/// processing the message successfully with nothing dead-lettered.
#[tokio::test]
async fn bounded_redelivery_recovers_before_budget() {
    let bus = Arc::new(MemoryEventBus::with_policy(AckPolicy::DeadLetter {
        max_attempts: 3,
    }));

    let handler = FlakyHandler::failing_first(2);
    let calls = handler.calls();
    let binding = QueueBinding::new("enrollment-service-payment-successful", "payment.successful")
        .unwrap();
    bus.consume(binding, Arc::new(handler)).await.unwrap();
    sleep(Duration::from_millis(10)).await;

    bus.publish("payment.successful", Bytes::from_static(b"{}"))
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    assert!(bus.dead_letters().is_empty());
}

/// Tests that a handler failing on every attempt sends the message to the
/// DLQ with the attempt budget spent, and the queue keeps flowing.
#[tokio::test]
async fn redelivery_exhaustion_routes_to_dlq() {
    let bus = Arc::new(MemoryEventBus::with_policy(AckPolicy::DeadLetter {
        max_attempts: 3,
    }));

    let handler = FlakyHandler::failing_first(u32::MAX);
    let calls = handler.calls();
    let binding = QueueBinding::new("enrollment-service-payment-successful", "payment.successful")
        .unwrap();
    bus.consume(binding, Arc::new(handler)).await.unwrap();
    sleep(Duration::from_millis(10)).await;

    bus.publish("payment.successful", Bytes::from_static(b"{\"paymentId\":\"p9\"}"))
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    let dead = bus.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].topic, "payment.successful");
    assert_eq!(dead[0].queue_group, "enrollment-service-payment-successful");
    assert_eq!(dead[0].attempts, 3);
    assert!(matches!(dead[0].failure, FailureKind::HandlerFailed { .. }));
}

/// Tests the legacy ack-always policy: one delivery per message regardless
/// of handler outcome, nothing dead-lettered.
#[tokio::test]
async fn ack_always_never_redelivers_or_dead_letters() {
    let bus = Arc::new(MemoryEventBus::with_policy(AckPolicy::AckAlways));

    let handler = FlakyHandler::failing_first(u32::MAX);
    let calls = handler.calls();
    let binding = QueueBinding::new("enrollment-service-payment-successful", "payment.successful")
        .unwrap();
    bus.consume(binding, Arc::new(handler)).await.unwrap();
    sleep(Duration::from_millis(10)).await;

    bus.publish("payment.successful", Bytes::from_static(b"{}"))
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert!(bus.dead_letters().is_empty());
}
