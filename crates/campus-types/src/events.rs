use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Message;

/// Kind of row change carried by the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// A single change to the messages table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub op: ChangeOp,
    pub record: Message,
}

impl ChangeEvent {
    pub fn insert(record: Message) -> Self {
        Self {
            op: ChangeOp::Insert,
            record,
        }
    }

    pub fn update(record: Message) -> Self {
        Self {
            op: ChangeOp::Update,
            record,
        }
    }

    /// Whether a subscriber scoped to `user_id` may see this change.
    pub fn visible_to(&self, user_id: Uuid) -> bool {
        self.record.involves(user_id)
    }
}

/// Frames sent by the server over the realtime socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum FeedEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid },

    /// Subscription to a table was accepted
    Subscribed { table: String },

    /// A row the subscriber can see changed
    Change(ChangeEvent),

    /// The last command was rejected
    Error { reason: String },
}

/// Frames sent by the client over the realtime socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum FeedCommand {
    /// Authenticate the socket
    Identify { token: String },

    /// Start receiving changes for a table. Only `messages` is published.
    Subscribe { table: String },
}

pub const MESSAGES_TABLE: &str = "messages";

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn change_visible_only_to_participants() {
        let sender = Uuid::new_v4();
        let receiver = Uuid::new_v4();
        let event = ChangeEvent::insert(Message {
            id: Uuid::new_v4(),
            sender_id: sender,
            receiver_id: receiver,
            content: "found your keys".into(),
            listing_id: None,
            lost_found_id: None,
            read: false,
            created_at: Utc::now(),
        });

        assert!(event.visible_to(sender));
        assert!(event.visible_to(receiver));
        assert!(!event.visible_to(Uuid::new_v4()));
    }

    #[test]
    fn command_wire_shape() {
        let cmd = FeedCommand::Subscribe {
            table: MESSAGES_TABLE.into(),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["type"], "Subscribe");
        assert_eq!(json["data"]["table"], "messages");
    }
}
