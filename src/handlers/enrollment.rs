//! Enrollment creation from successful payments.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::StoreError;
use crate::bus::{HandlerError, MessageContext};
use crate::events::PaymentSuccessful;
use crate::listener::EventHandler;

/// A course enrollment granted by a successful payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrollment {
    /// Payment that granted the enrollment. Unique per enrollment.
    pub payment_id: String,
    pub user_id: String,
    pub course_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    pub enrolled_at: DateTime<Utc>,
}

/// Interface for enrollment persistence.
#[async_trait]
pub trait EnrollmentStore: Send + Sync {
    /// Create the enrollment if its payment id is unused.
    ///
    /// Returns `false` when an enrollment for the same payment already
    /// exists, which is how a redelivered event is recognized.
    async fn create(&self, enrollment: Enrollment) -> Result<bool, StoreError>;

    /// Enrollments for a user, oldest first.
    async fn for_user(&self, user_id: &str) -> Result<Vec<Enrollment>, StoreError>;
}

/// In-memory enrollment store for development and tests.
#[derive(Default)]
pub struct MemoryEnrollmentStore {
    enrollments: RwLock<Vec<Enrollment>>,
}

impl MemoryEnrollmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.enrollments.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.enrollments.read().await.is_empty()
    }
}

#[async_trait]
impl EnrollmentStore for MemoryEnrollmentStore {
    async fn create(&self, enrollment: Enrollment) -> Result<bool, StoreError> {
        let mut enrollments = self.enrollments.write().await;
        if enrollments
            .iter()
            .any(|e| e.payment_id == enrollment.payment_id)
        {
            return Ok(false);
        }
        enrollments.push(enrollment);
        Ok(true)
    }

    async fn for_user(&self, user_id: &str) -> Result<Vec<Enrollment>, StoreError> {
        let enrollments = self.enrollments.read().await;
        Ok(enrollments
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect())
    }
}

/// Creates enrollments from `payment.successful` events, idempotent on the
/// payment id.
pub struct EnrollmentHandler {
    store: Arc<dyn EnrollmentStore>,
}

impl EnrollmentHandler {
    pub fn new(store: Arc<dyn EnrollmentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler<PaymentSuccessful> for EnrollmentHandler {
    async fn handle(
        &self,
        event: PaymentSuccessful,
        _ctx: &MessageContext,
    ) -> Result<(), HandlerError> {
        let enrollment = Enrollment {
            payment_id: event.payment_id,
            user_id: event.user_id,
            course_id: event.course_id,
            amount: event.amount,
            enrolled_at: Utc::now(),
        };

        let created = self
            .store
            .create(enrollment.clone())
            .await
            .map_err(HandlerError::failed)?;

        if created {
            info!(
                user = %enrollment.user_id,
                course = %enrollment.course_id,
                payment = %enrollment.payment_id,
                "Enrollment created"
            );
        } else {
            debug!(
                payment = %enrollment.payment_id,
                "Enrollment already exists for payment, skipping"
            );
        }

        Ok(())
    }
}
