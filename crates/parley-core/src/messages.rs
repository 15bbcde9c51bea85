use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, UserId};

/// A persisted direct message. Owned by durable storage; immutable once
/// created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Opaque attachment reference (already uploaded elsewhere).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Whether `user` is the sender or the receiver.
    pub fn involves(&self, user: &UserId) -> bool {
        &self.sender_id == user || &self.receiver_id == user
    }

    /// Whether this message belongs to the conversation between `a` and `b`.
    pub fn is_between(&self, a: &UserId, b: &UserId) -> bool {
        (&self.sender_id == a && &self.receiver_id == b)
            || (&self.sender_id == b && &self.receiver_id == a)
    }
}

/// Body of a create-message request, before storage assigns id and time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DraftError {
    #[error("message must carry text or an image")]
    Empty,
}

impl MessageDraft {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            image: None,
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Drop blank fields and require at least one remaining.
    pub fn validate(self) -> Result<Self, DraftError> {
        let text = self.text.filter(|t| !t.trim().is_empty());
        let image = self.image.filter(|i| !i.trim().is_empty());
        if text.is_none() && image.is_none() {
            return Err(DraftError::Empty);
        }
        Ok(Self { text, image })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Message {
        Message {
            id: MessageId::from_raw("msg_1"),
            sender_id: UserId::from_raw("a"),
            receiver_id: UserId::from_raw("b"),
            text: Some("hi".into()),
            image: None,
            created_at: "2026-01-01T00:00:00Z".parse().unwrap(),
        }
    }

    #[test]
    fn serializes_system_of_record_shape() {
        let value = serde_json::to_value(sample()).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "msg_1",
                "senderId": "a",
                "receiverId": "b",
                "text": "hi",
                "createdAt": "2026-01-01T00:00:00Z",
            })
        );
    }

    #[test]
    fn deserializes_without_optionals() {
        let msg: Message = serde_json::from_value(json!({
            "id": "msg_2",
            "senderId": "a",
            "receiverId": "b",
            "image": "https://cdn.example/x.png",
            "createdAt": "2026-01-01T00:00:01Z",
        }))
        .unwrap();
        assert!(msg.text.is_none());
        assert_eq!(msg.image.as_deref(), Some("https://cdn.example/x.png"));
    }

    #[test]
    fn involves_and_between() {
        let msg = sample();
        let a = UserId::from_raw("a");
        let b = UserId::from_raw("b");
        let c = UserId::from_raw("c");
        assert!(msg.involves(&a));
        assert!(msg.involves(&b));
        assert!(!msg.involves(&c));
        assert!(msg.is_between(&a, &b));
        assert!(msg.is_between(&b, &a));
        assert!(!msg.is_between(&a, &c));
    }

    #[test]
    fn draft_requires_content() {
        assert_eq!(MessageDraft::default().validate(), Err(DraftError::Empty));
        let blank = MessageDraft {
            text: Some("   ".into()),
            image: Some(String::new()),
        };
        assert_eq!(blank.validate(), Err(DraftError::Empty));
    }

    #[test]
    fn draft_drops_blank_fields() {
        let draft = MessageDraft {
            text: Some(" ".into()),
            image: Some("ref://1".into()),
        }
        .validate()
        .unwrap();
        assert!(draft.text.is_none());
        assert_eq!(draft.image.as_deref(), Some("ref://1"));
    }

    #[test]
    fn draft_text_and_image_together() {
        let draft = MessageDraft::text("look").with_image("ref://2").validate().unwrap();
        assert_eq!(draft.text.as_deref(), Some("look"));
        assert_eq!(draft.image.as_deref(), Some("ref://2"));
    }
}
