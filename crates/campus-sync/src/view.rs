//! Display rows for the conversation list.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::aggregator::ConversationPartner;

pub const EMPTY_CONVERSATIONS: &str = "No conversations yet";

/// Shown when the partner's profile could not be resolved.
pub const UNKNOWN_PARTNER: &str = "Unknown student";

const PREVIEW_CHARS: usize = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartnerRow {
    pub partner_id: Uuid,
    pub title: String,
    pub preview: String,
    pub unread: usize,
    pub last_at: Option<DateTime<Utc>>,
    /// Latest message was sent by me.
    pub from_me: bool,
}

impl PartnerRow {
    /// Badge text, `None` when nothing is unread.
    pub fn badge(&self) -> Option<String> {
        match self.unread {
            0 => None,
            1..=99 => Some(self.unread.to_string()),
            _ => Some("99+".into()),
        }
    }
}

pub fn partner_rows(partners: &[ConversationPartner], me: Uuid) -> Vec<PartnerRow> {
    partners
        .iter()
        .map(|partner| {
            let title = partner
                .profile
                .as_ref()
                .map_or_else(|| UNKNOWN_PARTNER.to_string(), |p| p.display_name.clone());
            let from_me = partner
                .last_message
                .as_ref()
                .is_some_and(|m| m.sender_id == me);
            let preview = partner
                .last_message
                .as_ref()
                .map(|m| truncate_preview(&m.content))
                .unwrap_or_default();

            PartnerRow {
                partner_id: partner.partner_id,
                title,
                preview,
                unread: partner.unread,
                last_at: partner.last_at(),
                from_me,
            }
        })
        .collect()
}

/// Placeholder text for the list, if it has nothing to show.
pub fn empty_state(partners: &[ConversationPartner]) -> Option<&'static str> {
    partners.is_empty().then_some(EMPTY_CONVERSATIONS)
}

fn truncate_preview(content: &str) -> String {
    let line = content.lines().next().unwrap_or_default().trim();
    let mut chars = line.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() || content.trim().lines().count() > 1 {
        format!("{head}…")
    } else {
        head
    }
}
