//! Chat media message handling.
//!
//! The media service publishes `chat.media.processed` once an upload has
//! been scanned and stored. This handler persists the resulting chat
//! message and pushes a file frame to everyone connected to the
//! conversation.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::StoreError;
use crate::bus::{HandlerError, MessageContext};
use crate::events::ChatMediaProcessed;
use crate::listener::EventHandler;
use crate::realtime::ConnectionRegistry;

/// A chat message row created from a processed media upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub file_url: String,
    pub file_name: String,
    pub file_type: String,
    pub created_at: DateTime<Utc>,
}

/// Interface for chat message persistence.
#[async_trait]
pub trait ChatMessageStore: Send + Sync {
    /// Insert the message if its id is unused.
    ///
    /// Returns `false` when a message with the same id already exists,
    /// which is how a redelivered event is recognized.
    async fn insert(&self, message: ChatMessage) -> Result<bool, StoreError>;

    /// Messages for a conversation, oldest first.
    async fn for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ChatMessage>, StoreError>;
}

/// In-memory chat message store for development and tests.
#[derive(Default)]
pub struct MemoryChatMessageStore {
    messages: RwLock<Vec<ChatMessage>>,
}

impl MemoryChatMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.read().await.is_empty()
    }
}

#[async_trait]
impl ChatMessageStore for MemoryChatMessageStore {
    async fn insert(&self, message: ChatMessage) -> Result<bool, StoreError> {
        let mut messages = self.messages.write().await;
        if messages.iter().any(|m| m.id == message.id) {
            return Ok(false);
        }
        messages.push(message);
        Ok(true)
    }

    async fn for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let messages = self.messages.read().await;
        Ok(messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }
}

/// Frame pushed to a conversation's live clients for a new file message.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    url: &'a str,
    name: &'a str,
    mime_type: &'a str,
}

/// Persists processed media uploads as chat messages, then fans them out.
///
/// The producer-supplied `messageId` keys the insert, so a redelivered
/// event neither duplicates the row nor repeats the broadcast. Events from
/// producers that do not send the token get a generated id and are applied
/// as fresh messages.
pub struct ChatMediaHandler {
    store: Arc<dyn ChatMessageStore>,
    registry: Arc<ConnectionRegistry>,
}

impl ChatMediaHandler {
    pub fn new(store: Arc<dyn ChatMessageStore>, registry: Arc<ConnectionRegistry>) -> Self {
        Self { store, registry }
    }
}

#[async_trait]
impl EventHandler<ChatMediaProcessed> for ChatMediaHandler {
    async fn handle(
        &self,
        event: ChatMediaProcessed,
        _ctx: &MessageContext,
    ) -> Result<(), HandlerError> {
        let message = ChatMessage {
            id: event
                .message_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            conversation_id: event.conversation_id,
            sender_id: event.sender_id,
            file_url: event.file_url,
            file_name: event.file_name,
            file_type: event.file_type,
            created_at: Utc::now(),
        };

        let inserted = self
            .store
            .insert(message.clone())
            .await
            .map_err(HandlerError::failed)?;

        if !inserted {
            debug!(
                conversation = %message.conversation_id,
                message = %message.id,
                "Chat message already stored, skipping broadcast"
            );
            return Ok(());
        }

        info!(
            conversation = %message.conversation_id,
            message = %message.id,
            "Chat media message stored"
        );

        let frame = FileFrame {
            kind: "file",
            url: &message.file_url,
            name: &message.file_name,
            mime_type: &message.file_type,
        };
        self.registry.broadcast(&message.conversation_id, &frame);

        Ok(())
    }
}
