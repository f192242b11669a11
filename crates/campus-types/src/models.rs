use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A student's public profile. Owned by the auth/profile store; messages only
/// reference it by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub display_name: String,
    pub student_id: String,
    pub bio: Option<String>,
    pub blocked: bool,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// What a first message was about. A message carries at most one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum MessageContext {
    Listing(Uuid),
    LostFound(Uuid),
}

/// A direct message between two students.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub content: String,
    pub listing_id: Option<Uuid>,
    pub lost_found_id: Option<Uuid>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// The party on the other side of this message, seen from `me`.
    pub fn other_party(&self, me: Uuid) -> Uuid {
        if self.receiver_id == me {
            self.sender_id
        } else {
            self.receiver_id
        }
    }

    pub fn involves(&self, user_id: Uuid) -> bool {
        self.sender_id == user_id || self.receiver_id == user_id
    }

    /// True when this message still counts towards `me`'s unread total.
    pub fn is_unread_for(&self, me: Uuid) -> bool {
        self.receiver_id == me && !self.read
    }

    pub fn context(&self) -> Option<MessageContext> {
        match (self.listing_id, self.lost_found_id) {
            (Some(id), None) => Some(MessageContext::Listing(id)),
            (None, Some(id)) => Some(MessageContext::LostFound(id)),
            _ => None,
        }
    }
}
