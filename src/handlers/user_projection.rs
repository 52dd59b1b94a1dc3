//! User profile projection.
//!
//! Services that render user names and avatars keep a local projection of
//! the user service's data, maintained from `user.registered` and
//! `user.profile.updated` events, so reads never cross a service boundary.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use super::StoreError;
use crate::bus::{HandlerError, MessageContext};
use crate::events::{UserProfileUpdated, UserRegistered};
use crate::listener::EventHandler;

/// Locally held copy of a user's profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProjection {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Interface for user projection persistence.
#[async_trait]
pub trait UserProjectionStore: Send + Sync {
    /// Insert or fully replace the projection for `projection.id`.
    async fn upsert(&self, projection: UserProjection) -> Result<(), StoreError>;

    /// Retrieve the projection for `id`.
    ///
    /// Returns `None` if the user is unknown.
    async fn get(&self, id: &str) -> Result<Option<UserProjection>, StoreError>;
}

/// In-memory projection store for development and tests.
#[derive(Default)]
pub struct MemoryUserProjectionStore {
    users: RwLock<HashMap<String, UserProjection>>,
}

impl MemoryUserProjectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of users projected so far.
    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.users.read().await.is_empty()
    }
}

#[async_trait]
impl UserProjectionStore for MemoryUserProjectionStore {
    async fn upsert(&self, projection: UserProjection) -> Result<(), StoreError> {
        let mut users = self.users.write().await;
        users.insert(projection.id.clone(), projection);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<UserProjection>, StoreError> {
        let users = self.users.read().await;
        Ok(users.get(id).cloned())
    }
}

/// Maintains user projections from user lifecycle events.
///
/// Both event types carry the full profile, so either one is applied as a
/// last-write-wins upsert. Replays and redeliveries converge on the same
/// row, which makes this handler safe under at-least-once delivery.
pub struct UserProjectionHandler {
    store: Arc<dyn UserProjectionStore>,
}

impl UserProjectionHandler {
    pub fn new(store: Arc<dyn UserProjectionStore>) -> Self {
        Self { store }
    }

    async fn apply(&self, projection: UserProjection) -> Result<(), HandlerError> {
        info!(user = %projection.id, "Upserting user projection");
        self.store
            .upsert(projection)
            .await
            .map_err(HandlerError::failed)
    }
}

#[async_trait]
impl EventHandler<UserRegistered> for UserProjectionHandler {
    async fn handle(
        &self,
        event: UserRegistered,
        _ctx: &MessageContext,
    ) -> Result<(), HandlerError> {
        self.apply(UserProjection {
            id: event.id,
            first_name: event.first_name,
            last_name: event.last_name,
            email: event.email,
            avatar_url: event.avatar_url,
            updated_at: Utc::now(),
        })
        .await
    }
}

#[async_trait]
impl EventHandler<UserProfileUpdated> for UserProjectionHandler {
    async fn handle(
        &self,
        event: UserProfileUpdated,
        _ctx: &MessageContext,
    ) -> Result<(), HandlerError> {
        self.apply(UserProjection {
            id: event.id,
            first_name: event.first_name,
            last_name: event.last_name,
            email: event.email,
            avatar_url: event.avatar_url,
            updated_at: Utc::now(),
        })
        .await
    }
}
