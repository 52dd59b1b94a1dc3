//! The platform event catalog.
//!
//! Every event type carries its topic as an associated constant and its JSON
//! payload shape in its fields. Producers and consumers share these types, so
//! the wire contract lives in exactly one place. Field names serialize in
//! camelCase to stay compatible with the Node.js services that publish and
//! consume the same topics.
//!
//! Consumers must tolerate unknown fields (producers add fields without
//! coordinating a release), which is serde's default behavior for structs.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A published event type: a topic constant plus a serializable payload.
///
/// Implementors are plain payload structs; the trait is what lets
/// [`Publisher`](crate::publisher::Publisher) and
/// [`Listener`](crate::listener::Listener) be parameterized by event type
/// instead of every call site repeating topic strings and serde calls.
pub trait Event: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The routing key this event is published under.
    const TOPIC: &'static str;
}

/// A user completed registration in the auth service.
///
/// Only `id` is mandatory on the wire; early producers sent nothing but
/// `{id, firstName}` and those messages must stay decodable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRegistered {
    pub id: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl Event for UserRegistered {
    const TOPIC: &'static str = "user.registered";
}

/// A user edited their profile. Same projection shape as registration;
/// consumers apply it as a full overwrite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfileUpdated {
    pub id: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl Event for UserProfileUpdated {
    const TOPIC: &'static str = "user.profile.updated";
}

/// The media pipeline finished processing a chat attachment.
///
/// `message_id` is the producer-supplied idempotency token. Producers that
/// predate the token omit it; consumption then falls back to generating a
/// fresh message id, which is not replay-safe. New producers must send it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMediaProcessed {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub conversation_id: String,
    pub sender_id: String,
    pub file_url: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub file_type: String,
}

impl Event for ChatMediaProcessed {
    const TOPIC: &'static str = "chat.media.processed";
}

/// The payment provider confirmed a course purchase.
///
/// `payment_id` is the natural idempotency key: one payment creates at most
/// one enrollment no matter how often the event is redelivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSuccessful {
    pub payment_id: String,
    pub user_id: String,
    pub course_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
}

impl Event for PaymentSuccessful {
    const TOPIC: &'static str = "payment.successful";
}

/// A notification was created for a user and should be pushed to their open
/// sessions. `kind` serializes as `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationCreated {
    pub id: String,
    pub recipient_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_url: Option<String>,
}

impl Event for NotificationCreated {
    const TOPIC: &'static str = "notification.created";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic::Topic;

    #[test]
    fn catalog_topics_are_valid_routing_keys() {
        for topic in [
            UserRegistered::TOPIC,
            UserProfileUpdated::TOPIC,
            ChatMediaProcessed::TOPIC,
            PaymentSuccessful::TOPIC,
            NotificationCreated::TOPIC,
        ] {
            assert!(Topic::new(topic).is_ok(), "invalid topic: {topic}");
        }
    }

    #[test]
    fn user_registered_wire_format_is_camel_case() {
        let event = UserRegistered {
            id: "u1".into(),
            first_name: "Ann".into(),
            last_name: "Lee".into(),
            email: None,
            avatar_url: Some("https://cdn.example/a.png".into()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["id"], "u1");
        assert_eq!(json["firstName"], "Ann");
        assert_eq!(json["avatarUrl"], "https://cdn.example/a.png");
        assert!(json.get("email").is_none());
    }

    #[test]
    fn minimal_user_registered_payload_decodes() {
        let event: UserRegistered =
            serde_json::from_str(r#"{"id":"u1","firstName":"Ann"}"#).unwrap();
        assert_eq!(event.id, "u1");
        assert_eq!(event.first_name, "Ann");
        assert_eq!(event.last_name, "");
        assert_eq!(event.avatar_url, None);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let event: PaymentSuccessful = serde_json::from_str(
            r#"{"paymentId":"p1","userId":"u1","courseId":"c1","currency":"EUR","gateway":{"name":"stripe"}}"#,
        )
        .unwrap();
        assert_eq!(event.payment_id, "p1");
        assert_eq!(event.amount, None);
    }

    #[test]
    fn missing_required_field_is_an_error() {
        let result = serde_json::from_str::<PaymentSuccessful>(r#"{"paymentId":"p1"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn notification_kind_maps_to_type_on_the_wire() {
        let event = NotificationCreated {
            id: "n1".into(),
            recipient_id: "u9".into(),
            kind: "assignment-graded".into(),
            content: "Your essay was graded".into(),
            link_url: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "assignment-graded");
        assert!(json.get("kind").is_none());
        assert!(json.get("linkUrl").is_none());
    }

    #[test]
    fn chat_media_token_is_optional() {
        let event: ChatMediaProcessed = serde_json::from_str(
            r#"{"conversationId":"c1","senderId":"u2","fileUrl":"https://cdn.example/f.pdf","fileName":"f.pdf","fileType":"application/pdf"}"#,
        )
        .unwrap();
        assert_eq!(event.message_id, None);
        assert_eq!(event.conversation_id, "c1");
    }
}
