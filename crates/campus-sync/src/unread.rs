use std::collections::HashSet;

use uuid::Uuid;

use campus_types::events::{ChangeEvent, ChangeOp};
use campus_types::models::Message;

/// A read-state write that has not reached the store yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PendingRead {
    Message(Uuid),
    Conversation(Uuid),
}

/// Session-wide unread counter for one student.
///
/// The counter is replaced wholesale by every resync. Between resyncs it moves
/// by exactly one per confirmed read and per inbound unread insert, guarded by
/// the set of message ids it believes are unread so the same message is never
/// counted twice in either direction.
#[derive(Debug, Clone)]
pub struct UnreadTracker {
    me: Uuid,
    total: usize,
    unread_ids: HashSet<Uuid>,
    pending: Vec<PendingRead>,
}

impl UnreadTracker {
    pub fn new(me: Uuid) -> Self {
        Self {
            me,
            total: 0,
            unread_ids: HashSet::new(),
            pending: Vec::new(),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn is_unread(&self, message_id: Uuid) -> bool {
        self.unread_ids.contains(&message_id)
    }

    /// Rebuild from a fresh snapshot. Pending writes the snapshot shows as
    /// already applied are dropped.
    pub fn reset_from(&mut self, messages: &[Message]) {
        self.unread_ids = messages
            .iter()
            .filter(|m| m.is_unread_for(self.me) && m.sender_id != self.me)
            .map(|m| m.id)
            .collect();
        self.total = self.unread_ids.len();

        let unread_ids = &self.unread_ids;
        self.pending.retain(|pending| match pending {
            PendingRead::Message(id) => unread_ids.contains(id),
            PendingRead::Conversation(partner) => messages
                .iter()
                .any(|m| m.sender_id == *partner && unread_ids.contains(&m.id)),
        });
    }

    /// Count an inbound unread message ahead of the resync it triggers.
    /// Returns true if the counter moved.
    pub fn note_inbound(&mut self, event: &ChangeEvent) -> bool {
        let record = &event.record;
        if event.op != ChangeOp::Insert
            || !record.is_unread_for(self.me)
            || record.sender_id == self.me
        {
            return false;
        }

        if self.unread_ids.insert(record.id) {
            self.total += 1;
            true
        } else {
            false
        }
    }

    /// Apply a confirmed read. Returns true only the first time for a given
    /// message; the counter never goes below zero.
    pub fn confirm_read(&mut self, message_id: Uuid) -> bool {
        self.pending
            .retain(|pending| *pending != PendingRead::Message(message_id));

        if self.unread_ids.remove(&message_id) {
            self.total = self.total.saturating_sub(1);
            true
        } else {
            false
        }
    }

    pub fn mark_pending(&mut self, pending: PendingRead) {
        if !self.pending.contains(&pending) {
            self.pending.push(pending);
        }
    }

    pub fn clear_pending(&mut self, pending: PendingRead) {
        self.pending.retain(|p| *p != pending);
    }

    /// Writes still waiting to reach the store. Non-empty means the counter
    /// may disagree with the backend.
    pub fn pending(&self) -> &[PendingRead] {
        &self.pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::message_at;

    #[test]
    fn reset_counts_only_inbound_unread() {
        let me = Uuid::new_v4();
        let a = Uuid::new_v4();
        let mut tracker = UnreadTracker::new(me);

        tracker.reset_from(&[
            message_at(a, me, "one", false, 1),
            message_at(a, me, "two", true, 2),
            message_at(me, a, "three", false, 3),
        ]);

        assert_eq!(tracker.total(), 1);
    }

    #[test]
    fn confirm_read_is_idempotent() {
        let me = Uuid::new_v4();
        let a = Uuid::new_v4();
        let msg = message_at(a, me, "hi", false, 1);
        let mut tracker = UnreadTracker::new(me);
        tracker.reset_from(std::slice::from_ref(&msg));

        assert!(tracker.confirm_read(msg.id));
        assert!(!tracker.confirm_read(msg.id));
        assert_eq!(tracker.total(), 0);
    }

    #[test]
    fn confirm_unknown_message_does_not_underflow() {
        let mut tracker = UnreadTracker::new(Uuid::new_v4());
        assert!(!tracker.confirm_read(Uuid::new_v4()));
        assert_eq!(tracker.total(), 0);
    }

    #[test]
    fn inbound_insert_counts_once() {
        let me = Uuid::new_v4();
        let a = Uuid::new_v4();
        let event = ChangeEvent::insert(message_at(a, me, "new", false, 1));
        let mut tracker = UnreadTracker::new(me);

        assert!(tracker.note_inbound(&event));
        assert!(!tracker.note_inbound(&event));
        assert_eq!(tracker.total(), 1);
    }

    #[test]
    fn outbound_and_update_events_are_ignored() {
        let me = Uuid::new_v4();
        let a = Uuid::new_v4();
        let mut tracker = UnreadTracker::new(me);

        assert!(!tracker.note_inbound(&ChangeEvent::insert(message_at(me, a, "mine", false, 1))));
        assert!(!tracker.note_inbound(&ChangeEvent::update(message_at(a, me, "edit", false, 2))));
        assert_eq!(tracker.total(), 0);
    }

    #[test]
    fn reset_drops_pending_writes_that_landed() {
        let me = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let landed = message_at(a, me, "landed", false, 1);
        let stuck = message_at(b, me, "stuck", false, 2);

        let mut tracker = UnreadTracker::new(me);
        tracker.reset_from(&[landed.clone(), stuck.clone()]);
        tracker.mark_pending(PendingRead::Message(landed.id));
        tracker.mark_pending(PendingRead::Conversation(b));
        tracker.mark_pending(PendingRead::Conversation(b));
        assert_eq!(tracker.pending().len(), 2);

        let mut landed_read = landed;
        landed_read.read = true;
        tracker.reset_from(&[landed_read, stuck]);

        assert_eq!(tracker.pending(), &[PendingRead::Conversation(b)]);
        assert_eq!(tracker.total(), 1);
    }
}
