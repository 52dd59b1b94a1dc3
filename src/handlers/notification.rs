//! Notification push to recipients' live connections.
//!
//! Notifications are persisted by the notification service before it
//! publishes `notification.created`; this handler only fans the payload
//! out to whoever is connected. A recipient with no open sockets simply
//! sees the notification on their next fetch.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::bus::{HandlerError, MessageContext};
use crate::events::NotificationCreated;
use crate::listener::EventHandler;
use crate::realtime::ConnectionRegistry;

/// Frame pushed to a recipient's live clients.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NotificationFrame<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    link_url: Option<&'a str>,
}

/// Pushes created notifications to the recipient's live connections.
pub struct NotificationHandler {
    registry: Arc<ConnectionRegistry>,
}

impl NotificationHandler {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl EventHandler<NotificationCreated> for NotificationHandler {
    async fn handle(
        &self,
        event: NotificationCreated,
        _ctx: &MessageContext,
    ) -> Result<(), HandlerError> {
        let frame = NotificationFrame {
            id: &event.id,
            kind: &event.kind,
            content: &event.content,
            link_url: event.link_url.as_deref(),
        };

        let delivered = self.registry.broadcast(&event.recipient_id, &frame);
        debug!(
            recipient = %event.recipient_id,
            delivered = delivered,
            "Notification pushed"
        );

        Ok(())
    }
}
