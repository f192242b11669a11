//! Partner list derived from the flat message set.
//!
//! Rebuilt from scratch on every call. Cost is linear in the number of
//! messages the student has, which is fine for a campus inbox but would need
//! an incremental index for much larger histories.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use campus_types::models::{Message, Profile};

/// One row of the conversation list.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationPartner {
    pub partner_id: Uuid,
    /// `None` until the profile lookup succeeds.
    pub profile: Option<Profile>,
    /// Latest message either way; `None` for a conversation opened but not
    /// yet started.
    pub last_message: Option<Message>,
    /// Messages from this partner to me that are still unread.
    pub unread: usize,
}

impl ConversationPartner {
    pub fn last_at(&self) -> Option<DateTime<Utc>> {
        self.last_message.as_ref().map(|m| m.created_at)
    }
}

/// Group `messages` by the other party and order partners newest first.
///
/// Messages that do not involve `me`, or that `me` sent to themselves, are
/// ignored. `extra_partners` adds entries for partners with no messages yet;
/// those sort after every partner that has messages.
pub fn aggregate(
    messages: &[Message],
    me: Uuid,
    profiles: &HashMap<Uuid, Profile>,
    extra_partners: &[Uuid],
) -> Vec<ConversationPartner> {
    let mut threads: HashMap<Uuid, Vec<&Message>> = HashMap::new();
    for message in messages.iter().filter(|m| m.involves(me)) {
        let other = message.other_party(me);
        if other == me {
            continue;
        }
        threads.entry(other).or_default().push(message);
    }

    let mut partners: Vec<ConversationPartner> = threads
        .into_iter()
        .map(|(partner_id, mut thread)| {
            // Stable: equal timestamps keep server order
            thread.sort_by_key(|m| m.created_at);
            let unread = thread
                .iter()
                .filter(|m| m.sender_id == partner_id && m.is_unread_for(me))
                .count();

            ConversationPartner {
                partner_id,
                profile: profiles.get(&partner_id).cloned(),
                last_message: thread.last().map(|m| (*m).clone()),
                unread,
            }
        })
        .collect();

    for &partner_id in extra_partners {
        if partner_id == me || partners.iter().any(|p| p.partner_id == partner_id) {
            continue;
        }
        partners.push(ConversationPartner {
            partner_id,
            profile: profiles.get(&partner_id).cloned(),
            last_message: None,
            unread: 0,
        });
    }

    partners.sort_by(compare_partners);
    partners
}

/// Newest preview first, partners without messages last. Ties fall back to
/// partner id so the order is total.
fn compare_partners(a: &ConversationPartner, b: &ConversationPartner) -> Ordering {
    match (a.last_at(), b.last_at()) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| a.partner_id.cmp(&b.partner_id))
}

pub fn total_unread(partners: &[ConversationPartner]) -> usize {
    partners.iter().map(|p| p.unread).sum()
}
