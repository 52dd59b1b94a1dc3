//! Per-topic event handlers.
//!
//! The only service-specific code in the crate: each handler consumes one
//! event type (the user projection handler consumes two) and applies it
//! through a narrow store trait. Real services supply their own store
//! implementations; the in-memory ones here back local development and
//! tests. All handlers are idempotent, since every delivery is
//! at-least-once.

pub mod chat_media;
pub mod enrollment;
pub mod notification;
pub mod user_projection;

pub use chat_media::{ChatMediaHandler, ChatMessage, ChatMessageStore, MemoryChatMessageStore};
pub use enrollment::{Enrollment, EnrollmentHandler, EnrollmentStore, MemoryEnrollmentStore};
pub use notification::NotificationHandler;
pub use user_projection::{
    MemoryUserProjectionStore, UserProjection, UserProjectionHandler, UserProjectionStore,
};

/// Errors surfaced by store implementations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}
