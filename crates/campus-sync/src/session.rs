use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use campus_types::events::ChangeEvent;
use campus_types::models::{Message, Profile};

use crate::aggregator::{ConversationPartner, aggregate, total_unread};
use crate::config::{RetryPolicy, SyncConfig};
use crate::error::Result;
use crate::gateway::RemoteGateway;
use crate::unread::{PendingRead, UnreadTracker};

/// Messaging state for one signed-in student.
///
/// Holds the latest message snapshot and everything derived from it. Every
/// trigger (listener event, user action, view mount) ends in [`refresh`],
/// which refetches and recomputes rather than patching.
///
/// Every change to the snapshot bumps the revision published by
/// [`changes`], which open views follow.
///
/// [`refresh`]: MessagingSync::refresh
/// [`changes`]: MessagingSync::changes
pub struct MessagingSync<G> {
    gateway: Arc<G>,
    me: Uuid,
    config: SyncConfig,
    generation: AtomicU64,
    state: Mutex<SyncState>,
    revision: watch::Sender<u64>,
}

struct SyncState {
    messages: Vec<Message>,
    partners: Vec<ConversationPartner>,
    profiles: HashMap<Uuid, Profile>,
    /// Partners opened from a listing or lost-and-found page before any
    /// message exists
    extra_partners: Vec<Uuid>,
    /// Partners already greeted this session
    greeted: HashSet<Uuid>,
    tracker: UnreadTracker,
    applied_generation: u64,
}

impl SyncState {
    fn recompute(&mut self, me: Uuid) {
        self.partners = aggregate(&self.messages, me, &self.profiles, &self.extra_partners);
    }
}

impl<G: RemoteGateway> MessagingSync<G> {
    pub fn new(gateway: Arc<G>, me: Uuid, config: SyncConfig) -> Self {
        Self {
            gateway,
            me,
            config,
            generation: AtomicU64::new(0),
            state: Mutex::new(SyncState {
                messages: Vec::new(),
                partners: Vec::new(),
                profiles: HashMap::new(),
                extra_partners: Vec::new(),
                greeted: HashSet::new(),
                tracker: UnreadTracker::new(me),
                applied_generation: 0,
            }),
            revision: watch::Sender::new(0),
        }
    }

    pub fn me(&self) -> Uuid {
        self.me
    }

    pub fn gateway(&self) -> &Arc<G> {
        &self.gateway
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Revision counter, bumped after each snapshot change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    fn state(&self) -> MutexGuard<'_, SyncState> {
        // State is plain data; a panic mid-update leaves nothing half-applied
        // that the next refresh would not overwrite.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Refetch every message, resolve unknown profiles and rebuild the
    /// partner list and unread counter.
    ///
    /// On fetch failure the previous snapshot stays in place. A refresh that
    /// finishes after a newer one has been applied is discarded.
    pub async fn refresh(&self) -> Result<()> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let messages = match self.gateway.fetch_messages(self.me).await {
            Ok(messages) => messages,
            Err(e) => {
                error!(user_id = %self.me, "message fetch failed: {}", e);
                return Err(e);
            }
        };

        let missing: Vec<Uuid> = {
            let state = self.state();
            let mut seen = HashSet::new();
            messages
                .iter()
                .map(|m| m.other_party(self.me))
                .chain(state.extra_partners.iter().copied())
                .filter(|id| *id != self.me && !state.profiles.contains_key(id))
                .filter(|id| seen.insert(*id))
                .collect()
        };

        let mut fetched = Vec::with_capacity(missing.len());
        for profile_id in missing {
            match self.gateway.fetch_profile(profile_id).await {
                Ok(profile) => fetched.push(profile),
                Err(e) => warn!(%profile_id, "profile lookup failed: {}", e),
            }
        }

        let mut state = self.state();
        if generation < state.applied_generation {
            debug!(generation, applied = state.applied_generation, "discarding stale refresh");
            return Ok(());
        }

        for profile in fetched {
            state.profiles.insert(profile.id, profile);
        }
        state.tracker.reset_from(&messages);
        state.messages = messages;
        state.recompute(self.me);
        state.applied_generation = generation;

        let listed = total_unread(&state.partners);
        if listed != state.tracker.total() {
            warn!(
                listed,
                tracked = state.tracker.total(),
                "unread counter disagrees with partner list"
            );
        }

        debug!(
            user_id = %self.me,
            generation,
            partners = state.partners.len(),
            unread = state.tracker.total(),
            "messages resynchronized"
        );
        drop(state);
        self.bump();
        Ok(())
    }

    pub fn partners(&self) -> Vec<ConversationPartner> {
        self.state().partners.clone()
    }

    pub fn is_partner(&self, partner_id: Uuid) -> bool {
        self.state()
            .partners
            .iter()
            .any(|p| p.partner_id == partner_id && p.last_message.is_some())
    }

    /// Confirmed messages exchanged with `partner_id`, oldest first.
    pub fn thread_with(&self, partner_id: Uuid) -> Vec<Message> {
        let mut thread: Vec<Message> = self
            .state()
            .messages
            .iter()
            .filter(|m| m.other_party(self.me) == partner_id && m.involves(self.me))
            .cloned()
            .collect();
        thread.sort_by_key(|m| m.created_at);
        thread
    }

    pub fn unread_total(&self) -> usize {
        self.state().tracker.total()
    }

    pub fn unread_from(&self, partner_id: Uuid) -> usize {
        self.state()
            .partners
            .iter()
            .find(|p| p.partner_id == partner_id)
            .map_or(0, |p| p.unread)
    }

    /// Read-state writes that exhausted their retries. Non-empty means the
    /// counter may disagree with the backend until they land.
    pub fn pending_sync(&self) -> Vec<PendingRead> {
        self.state().tracker.pending().to_vec()
    }

    /// Show `partner_id` in the list before any message exists.
    pub fn add_partner(&self, partner_id: Uuid) {
        let mut state = self.state();
        if partner_id == self.me || state.extra_partners.contains(&partner_id) {
            return;
        }
        state.extra_partners.push(partner_id);
        state.recompute(self.me);
        drop(state);
        self.bump();
    }

    /// Claim the one greeting allowed per partner this session. Returns false
    /// if it was already claimed.
    pub(crate) fn claim_greeting(&self, partner_id: Uuid) -> bool {
        self.state().greeted.insert(partner_id)
    }

    pub(crate) fn release_greeting(&self, partner_id: Uuid) {
        self.state().greeted.remove(&partner_id);
    }

    /// Let an inbound change move the counter before the resync it triggers.
    pub fn note_change(&self, event: &ChangeEvent) {
        if self.state().tracker.note_inbound(event) {
            debug!(message_id = %event.record.id, "unread counter bumped by live event");
        }
    }

    /// Fold a confirmed row from this session's own send into the snapshot.
    pub fn record_sent(&self, message: Message) {
        let mut state = self.state();
        if state.messages.iter().any(|m| m.id == message.id) {
            return;
        }
        state.messages.push(message);
        state.recompute(self.me);
        drop(state);
        self.bump();
    }

    /// Mark one message read. Only acts while the local copy is unread, so a
    /// second call for the same message is a no-op and the counter drops by
    /// at most one.
    ///
    /// Returns true when the counter moved. Failures are retried per
    /// `read_retry`, then logged and left as pending; nothing is rolled back.
    pub async fn mark_as_read(&self, message_id: Uuid) -> bool {
        if !self.state().tracker.is_unread(message_id) {
            return false;
        }

        let result = with_retry(&self.config.read_retry, "mark read", || {
            self.gateway.mark_read(message_id)
        })
        .await;

        match result {
            Ok(_) => {
                let mut state = self.state();
                if !state.tracker.confirm_read(message_id) {
                    return false;
                }
                if let Some(message) = state.messages.iter_mut().find(|m| m.id == message_id) {
                    message.read = true;
                }
                state.recompute(self.me);
                drop(state);
                self.bump();
                true
            }
            Err(e) => {
                warn!(%message_id, "mark read failed, leaving pending: {}", e);
                self.state()
                    .tracker
                    .mark_pending(PendingRead::Message(message_id));
                false
            }
        }
    }

    /// Mark everything from `partner_id` read, then resynchronize fully.
    /// Returns true when the remote write succeeded.
    pub async fn mark_conversation_as_read(&self, partner_id: Uuid) -> bool {
        let result = with_retry(&self.config.read_retry, "mark conversation read", || {
            self.gateway.mark_conversation_read(partner_id)
        })
        .await;

        match result {
            Ok(updated) => {
                self.state()
                    .tracker
                    .clear_pending(PendingRead::Conversation(partner_id));
                debug!(%partner_id, updated, "conversation marked read");
                // refresh logs its own failure
                let _ = self.refresh().await;
                true
            }
            Err(e) => {
                warn!(%partner_id, "mark conversation read failed, leaving pending: {}", e);
                self.state()
                    .tracker
                    .mark_pending(PendingRead::Conversation(partner_id));
                false
            }
        }
    }

    /// Re-attempt every pending read-state write. Returns how many landed.
    pub async fn retry_pending(&self) -> usize {
        let pending = self.pending_sync();
        if pending.is_empty() {
            return 0;
        }

        info!(count = pending.len(), "retrying pending read-state writes");
        let mut landed = 0;
        for item in pending {
            let ok = match item {
                PendingRead::Message(id) => {
                    self.state().tracker.clear_pending(item);
                    self.mark_as_read(id).await
                }
                PendingRead::Conversation(partner_id) => {
                    self.mark_conversation_as_read(partner_id).await
                }
            };
            if ok {
                landed += 1;
            }
        }
        landed
    }
}

/// Run `op` up to `policy.attempts()` times, sleeping with backoff between
/// failures.
pub(crate) async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                let delay = policy.delay_for(attempt);
                debug!(attempt, ?delay, "{} failed, retrying: {}", what, e);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_util::{FakeGateway, sync_for};

    #[tokio::test]
    async fn refresh_builds_partners_and_counter() {
        let gateway = FakeGateway::new();
        let me = gateway.add_profile("Me");
        let a = gateway.add_profile("Avery");
        let b = gateway.add_profile("Blake");
        gateway.seed(me, a, "is the bike available?", true, 1);
        gateway.seed(a, me, "yes", false, 2);
        gateway.seed(a, me, "come by after class", false, 3);
        gateway.seed(b, me, "thanks!", true, 0);

        let sync = sync_for(&gateway, me);
        sync.refresh().await.unwrap();

        let partners = sync.partners();
        assert_eq!(partners.len(), 2);
        assert_eq!(partners[0].partner_id, a);
        assert_eq!(partners[0].unread, 2);
        assert_eq!(partners[0].profile.as_ref().unwrap().display_name, "Avery");
        assert_eq!(partners[1].partner_id, b);
        assert_eq!(partners[1].unread, 0);
        assert_eq!(sync.unread_total(), 2);
    }

    #[tokio::test]
    async fn fetch_failure_keeps_previous_snapshot() {
        let gateway = FakeGateway::new();
        let me = gateway.add_profile("Me");
        let a = gateway.add_profile("Avery");
        gateway.seed(a, me, "hello", false, 1);

        let sync = sync_for(&gateway, me);
        sync.refresh().await.unwrap();

        gateway.fail_next_fetches(1);
        assert!(sync.refresh().await.is_err());
        assert_eq!(sync.partners().len(), 1);
        assert_eq!(sync.unread_total(), 1);
    }

    #[tokio::test]
    async fn missing_profile_still_lists_partner() {
        let gateway = FakeGateway::new();
        let me = gateway.add_profile("Me");
        let ghost = Uuid::new_v4();
        gateway.seed(ghost, me, "who am I", false, 1);

        let sync = sync_for(&gateway, me);
        sync.refresh().await.unwrap();

        let partners = sync.partners();
        assert_eq!(partners[0].partner_id, ghost);
        assert!(partners[0].profile.is_none());
    }

    #[tokio::test]
    async fn mark_as_read_twice_decrements_once() {
        let gateway = FakeGateway::new();
        let me = gateway.add_profile("Me");
        let a = gateway.add_profile("Avery");
        let first = gateway.seed(a, me, "one", false, 1);
        gateway.seed(a, me, "two", false, 2);

        let sync = sync_for(&gateway, me);
        sync.refresh().await.unwrap();
        assert_eq!(sync.unread_total(), 2);

        assert!(sync.mark_as_read(first.id).await);
        assert!(!sync.mark_as_read(first.id).await);

        assert_eq!(sync.unread_total(), 1);
        assert_eq!(sync.unread_from(a), 1);
        assert_eq!(gateway.mark_read_calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_mark_as_read_never_double_decrements() {
        let gateway = FakeGateway::new();
        let me = gateway.add_profile("Me");
        let a = gateway.add_profile("Avery");
        let msg = gateway.seed(a, me, "one", false, 1);

        let sync = sync_for(&gateway, me);
        sync.refresh().await.unwrap();

        let (x, y) = tokio::join!(sync.mark_as_read(msg.id), sync.mark_as_read(msg.id));
        assert!(x ^ y);
        assert_eq!(sync.unread_total(), 0);
    }

    #[tokio::test]
    async fn mark_as_read_on_read_message_is_noop() {
        let gateway = FakeGateway::new();
        let me = gateway.add_profile("Me");
        let a = gateway.add_profile("Avery");
        let msg = gateway.seed(a, me, "seen", true, 1);

        let sync = sync_for(&gateway, me);
        sync.refresh().await.unwrap();

        assert!(!sync.mark_as_read(msg.id).await);
        assert_eq!(sync.unread_total(), 0);
        assert_eq!(gateway.mark_read_calls(), 0);
    }

    #[tokio::test]
    async fn mark_as_read_retries_then_succeeds() {
        let gateway = FakeGateway::new();
        let me = gateway.add_profile("Me");
        let a = gateway.add_profile("Avery");
        let msg = gateway.seed(a, me, "one", false, 1);

        let sync = sync_for(&gateway, me);
        sync.refresh().await.unwrap();

        gateway.fail_next_reads(2);
        assert!(sync.mark_as_read(msg.id).await);
        assert_eq!(gateway.mark_read_calls(), 3);
        assert!(sync.pending_sync().is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_leave_pending_without_rollback() {
        let gateway = FakeGateway::new();
        let me = gateway.add_profile("Me");
        let a = gateway.add_profile("Avery");
        let msg = gateway.seed(a, me, "one", false, 1);

        let sync = sync_for(&gateway, me);
        sync.refresh().await.unwrap();

        gateway.fail_next_reads(10);
        assert!(!sync.mark_as_read(msg.id).await);
        assert_eq!(sync.unread_total(), 1);
        assert_eq!(sync.pending_sync(), vec![PendingRead::Message(msg.id)]);

        gateway.fail_next_reads(0);
        assert_eq!(sync.retry_pending().await, 1);
        assert!(sync.pending_sync().is_empty());
        assert_eq!(sync.unread_total(), 0);
    }

    #[tokio::test]
    async fn mark_conversation_read_resyncs_only_that_partner() {
        let gateway = FakeGateway::new();
        let me = gateway.add_profile("Me");
        let a = gateway.add_profile("Avery");
        let b = gateway.add_profile("Blake");
        gateway.seed(a, me, "one", false, 1);
        gateway.seed(a, me, "two", false, 2);
        gateway.seed(b, me, "three", false, 3);

        let sync = sync_for(&gateway, me);
        sync.refresh().await.unwrap();
        assert_eq!(sync.unread_total(), 3);

        let fetches = gateway.fetch_calls();
        assert!(sync.mark_conversation_as_read(a).await);

        assert_eq!(gateway.fetch_calls(), fetches + 1);
        assert_eq!(sync.unread_from(a), 0);
        assert_eq!(sync.unread_from(b), 1);
        assert_eq!(sync.unread_total(), 1);
    }

    #[tokio::test]
    async fn stale_refresh_is_discarded() {
        let gateway = FakeGateway::new();
        let me = gateway.add_profile("Me");
        let a = gateway.add_profile("Avery");
        gateway.seed(a, me, "one", false, 1);

        let sync = sync_for(&gateway, me);

        // First refresh stalls inside fetch; a second one completes meanwhile
        let gate = gateway.hold_next_fetch();
        let slow = sync.refresh();
        let fast = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            gateway.seed(a, me, "two", false, 2);
            sync.refresh().await.unwrap();
            gate.notify_one();
        };
        let (slow, _) = tokio::join!(slow, fast);
        slow.unwrap();

        assert_eq!(sync.unread_total(), 2);
    }

    #[tokio::test]
    async fn snapshot_changes_bump_revision() {
        let gateway = FakeGateway::new();
        let me = gateway.add_profile("Me");
        let a = gateway.add_profile("Avery");

        let sync = sync_for(&gateway, me);
        let mut changes = sync.changes();

        sync.refresh().await.unwrap();
        assert!(changes.has_changed().unwrap());
        changes.borrow_and_update();

        sync.add_partner(a);
        assert!(changes.has_changed().unwrap());
        changes.borrow_and_update();

        sync.record_sent(crate::test_util::message_at(me, a, "hello", false, 1));
        assert!(changes.has_changed().unwrap());
        assert_eq!(*changes.borrow_and_update(), 3);
    }

    #[tokio::test]
    async fn extra_partner_sorts_last_until_messaged() {
        let gateway = FakeGateway::new();
        let me = gateway.add_profile("Me");
        let a = gateway.add_profile("Avery");
        let fresh = gateway.add_profile("Fresh");
        gateway.seed(a, me, "hi", true, 1);

        let sync = sync_for(&gateway, me);
        sync.add_partner(fresh);
        sync.refresh().await.unwrap();

        let partners = sync.partners();
        assert_eq!(partners.len(), 2);
        assert_eq!(partners[1].partner_id, fresh);
        assert!(!sync.is_partner(fresh));
        assert_eq!(partners[1].profile.as_ref().unwrap().display_name, "Fresh");
    }
}
