//! sync-worker: Cross-service synchronization worker
//!
//! Consumes the platform's synchronization topics and serves the realtime
//! WebSocket fan-out. One durable listener per topic; queue groups stay
//! stable across deploys so a restarted worker resumes its queues.
//!
//! ## Architecture
//! ```text
//! [learnsphere exchange] ──user.registered────────┐
//!                        ──user.profile.updated───┼─> [UserProjectionHandler]
//!                        ──chat.media.processed──────> [ChatMediaHandler] ──┐
//!                        ──payment.successful────────> [EnrollmentHandler]  │
//!                        ──notification.created──────> [NotificationHandler]│
//!                                                              │            │
//!                                                              v            v
//!                                               [ConnectionRegistry fan-out]
//!                                                              │
//!                                               GET /ws/{scope} (WebSocket)
//! ```
//!
//! ## Configuration
//! - `config.yaml` or the file named by LEARNSPHERE_CONFIG
//! - LEARNSPHERE__MESSAGING__TYPE: "amqp" (default) or "memory"
//! - LEARNSPHERE__MESSAGING__AMQP__URL: broker endpoint
//! - LEARNSPHERE__REALTIME__BIND_ADDR: WebSocket listen address
//!
//! The stores wired here are the in-memory reference implementations;
//! services embedding the listeners swap in their own store impls.

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use learnsphere_messaging::bus::init_event_bus;
use learnsphere_messaging::config::Config;
use learnsphere_messaging::events::{
    ChatMediaProcessed, NotificationCreated, PaymentSuccessful, UserProfileUpdated, UserRegistered,
};
use learnsphere_messaging::handlers::{
    ChatMediaHandler, EnrollmentHandler, MemoryChatMessageStore, MemoryEnrollmentStore,
    MemoryUserProjectionStore, NotificationHandler, UserProjectionHandler,
};
use learnsphere_messaging::listener::Listener;
use learnsphere_messaging::realtime::socket::{scope_events_handler, RealtimeState};
use learnsphere_messaging::realtime::ConnectionRegistry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    learnsphere_messaging::utils::bootstrap::init_tracing();

    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting sync worker");

    let bus = init_event_bus(&config.messaging).await?;

    let registry = Arc::new(ConnectionRegistry::default());
    let users = Arc::new(MemoryUserProjectionStore::new());
    let messages = Arc::new(MemoryChatMessageStore::new());
    let enrollments = Arc::new(MemoryEnrollmentStore::new());

    let handler_timeout = config.messaging.handler_timeout();

    // One projection handler covers both user topics; each topic still
    // gets its own durable queue.
    let user_projection = Arc::new(UserProjectionHandler::new(users));

    Listener::<UserRegistered>::new(
        bus.clone(),
        "community-service-user-registered",
        user_projection.clone(),
    )
    .with_timeout(handler_timeout)
    .listen()
    .await?;

    Listener::<UserProfileUpdated>::new(
        bus.clone(),
        "community-service-user-profile-updated",
        user_projection,
    )
    .with_timeout(handler_timeout)
    .listen()
    .await?;

    Listener::<ChatMediaProcessed>::new(
        bus.clone(),
        "community-service-chat-media-processed",
        Arc::new(ChatMediaHandler::new(messages, registry.clone())),
    )
    .with_timeout(handler_timeout)
    .listen()
    .await?;

    Listener::<PaymentSuccessful>::new(
        bus.clone(),
        "enrollment-service-payment-successful",
        Arc::new(EnrollmentHandler::new(enrollments)),
    )
    .with_timeout(handler_timeout)
    .listen()
    .await?;

    Listener::<NotificationCreated>::new(
        bus.clone(),
        "notification-service-notification-created",
        Arc::new(NotificationHandler::new(registry.clone())),
    )
    .with_timeout(handler_timeout)
    .listen()
    .await?;

    info!("All listeners started");

    let state = RealtimeState {
        registry,
        heartbeat: config.realtime.heartbeat(),
        outbound_capacity: config.realtime.outbound_capacity,
    };

    let app = Router::new()
        .route("/ws/{scope}", get(scope_events_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let tcp = tokio::net::TcpListener::bind(&config.realtime.bind_addr).await?;
    info!(addr = %tcp.local_addr()?, "Realtime WebSocket server listening");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(tcp, app).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.await {
            error!(error = %e, "Realtime server error");
        }
    });

    info!("Press Ctrl+C to exit");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    let _ = shutdown_tx.send(());
    let _ = server_task.await;

    info!("Shutdown complete");
    Ok(())
}
