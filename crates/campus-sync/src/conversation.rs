use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use campus_types::models::{Message, MessageContext};

use crate::error::{Result, SyncError};
use crate::gateway::{NewMessage, RemoteGateway};
use crate::session::MessagingSync;

/// Client-side id for a message the store has not confirmed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TempId(Uuid);

impl TempId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "temp-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Shown optimistically, insert in flight
    Pending(TempId),
    /// Row returned by the store
    Confirmed,
    /// Insert failed; stays visible until retried
    Failed(TempId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThreadEntry {
    pub message: Message,
    pub delivery: Delivery,
}

impl ThreadEntry {
    fn temp_id(&self) -> Option<TempId> {
        match self.delivery {
            Delivery::Pending(id) | Delivery::Failed(id) => Some(id),
            Delivery::Confirmed => None,
        }
    }
}

/// Transient user-facing notification (toast).
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    SendFailed { temp_id: TempId, reason: String },
}

/// Where the student came from when opening a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactIntent {
    Listing { listing_id: Uuid, title: String },
    LostFound { item_id: Uuid, title: String },
}

impl ContactIntent {
    pub fn context(&self) -> MessageContext {
        match self {
            ContactIntent::Listing { listing_id, .. } => MessageContext::Listing(*listing_id),
            ContactIntent::LostFound { item_id, .. } => MessageContext::LostFound(*item_id),
        }
    }

    /// Text of the automatic first message.
    pub fn greeting(&self) -> String {
        match self {
            ContactIntent::Listing { title, .. } => {
                format!("Hi! I'm interested in your listing \"{title}\". Is it still available?")
            }
            ContactIntent::LostFound { title, .. } => {
                format!("Hi! I think the item you found, \"{title}\", might be mine.")
            }
        }
    }
}

/// The open thread with one partner.
///
/// While open, the view follows the session and reloads itself after every
/// snapshot change. Results of async work are applied only while the view is
/// open; once it is closed or dropped they are discarded.
pub struct ConversationView<G> {
    sync: Arc<MessagingSync<G>>,
    partner_id: Uuid,
    thread: Arc<Thread>,
    compose: Mutex<String>,
    notices: mpsc::UnboundedSender<Notice>,
    cancel: CancellationToken,
}

/// Entries shared by the view and its follow task.
struct Thread {
    entries: Mutex<Vec<ThreadEntry>>,
    revision: watch::Sender<u64>,
}

impl Thread {
    fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            revision: watch::Sender::new(0),
        }
    }

    fn snapshot(&self) -> Vec<ThreadEntry> {
        lock(&self.entries).clone()
    }

    /// Mutate the entries and bump the revision.
    fn update<R>(&self, f: impl FnOnce(&mut Vec<ThreadEntry>) -> R) -> R {
        let out = f(&mut lock(&self.entries));
        self.revision.send_modify(|rev| *rev += 1);
        out
    }

    /// Replace the confirmed rows. Pending and failed entries are slotted
    /// back in by timestamp, after confirmed rows with the same time.
    fn merge(&self, confirmed: Vec<Message>) {
        self.update(|entries| {
            let local: Vec<ThreadEntry> = entries
                .drain(..)
                .filter(|e| e.delivery != Delivery::Confirmed)
                .collect();

            entries.extend(confirmed.into_iter().map(|message| ThreadEntry {
                message,
                delivery: Delivery::Confirmed,
            }));
            for entry in local {
                let at = entries
                    .partition_point(|e| e.message.created_at <= entry.message.created_at);
                entries.insert(at, entry);
            }
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<G: RemoteGateway> ConversationView<G> {
    /// Open the thread with `partner_id`, marking it read if anything from
    /// them is unread.
    pub async fn open(
        sync: Arc<MessagingSync<G>>,
        partner_id: Uuid,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Notice>)> {
        if partner_id == sync.me() {
            return Err(SyncError::InvalidMessage("cannot message yourself"));
        }

        let (notices, notice_rx) = mpsc::unbounded_channel();
        let view = Self {
            sync,
            partner_id,
            thread: Arc::new(Thread::new()),
            compose: Mutex::new(String::new()),
            notices,
            cancel: CancellationToken::new(),
        };
        view.reload();
        view.follow();

        if view.sync.unread_from(partner_id) > 0 {
            view.sync.mark_conversation_as_read(partner_id).await;
            view.reload();
        }

        Ok((view, notice_rx))
    }

    /// Open from a listing or lost-and-found page. If the partner is not yet
    /// in the conversation list, send the context greeting once.
    ///
    /// The guard only sees this session's partner list, so another tab
    /// opening the same conversation at the same moment can still greet.
    pub async fn open_with_intent(
        sync: Arc<MessagingSync<G>>,
        partner_id: Uuid,
        intent: ContactIntent,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Notice>)> {
        let (view, notice_rx) = Self::open(sync, partner_id).await?;

        if view.sync.is_partner(partner_id) || !view.sync.claim_greeting(partner_id) {
            debug!(%partner_id, "conversation exists, no greeting");
            return Ok((view, notice_rx));
        }

        view.sync.add_partner(partner_id);
        info!(%partner_id, context = ?intent.context(), "sending first-contact message");

        let temp = view.push_optimistic(intent.greeting(), Some(intent.context()));
        if view.deliver(temp).await.is_err() {
            // let the next navigation try again
            view.sync.release_greeting(partner_id);
        }

        Ok((view, notice_rx))
    }

    /// Reload on every session revision until the view closes.
    fn follow(&self) {
        let sync = self.sync.clone();
        let thread = self.thread.clone();
        let cancel = self.cancel.clone();
        let partner_id = self.partner_id;
        let mut changes = sync.changes();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    changed = changes.changed() => {
                        if changed.is_err() || cancel.is_cancelled() {
                            break;
                        }
                        thread.merge(sync.thread_with(partner_id));
                    }
                }
            }
            debug!(%partner_id, "conversation view closed");
        });
    }

    pub fn partner_id(&self) -> Uuid {
        self.partner_id
    }

    pub fn entries(&self) -> Vec<ThreadEntry> {
        self.thread.snapshot()
    }

    /// Bumped whenever the entries change, for re-rendering.
    pub fn updates(&self) -> watch::Receiver<u64> {
        self.thread.revision.subscribe()
    }

    pub fn compose(&self) -> String {
        lock(&self.compose).clone()
    }

    pub fn set_compose(&self, text: impl Into<String>) {
        *lock(&self.compose) = text.into();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Unmount. Anything still in flight will not touch this view.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Rebuild the confirmed part of the thread from the session snapshot,
    /// keeping local pending and failed entries in time order.
    pub fn reload(&self) {
        if self.is_closed() {
            return;
        }
        self.thread.merge(self.sync.thread_with(self.partner_id));
    }

    /// Send the compose field. The field is cleared as soon as the message
    /// is shown, before the store answers.
    pub async fn send_composed(&self) -> Result<Message> {
        let text = self.compose();
        self.validate(&text)?;

        let temp = self.push_optimistic(text, None);
        lock(&self.compose).clear();
        self.deliver(temp).await
    }

    pub async fn send(&self, content: impl Into<String>) -> Result<Message> {
        let content = content.into();
        self.validate(&content)?;

        let temp = self.push_optimistic(content, None);
        self.deliver(temp).await
    }

    /// Re-send a failed message in place.
    pub async fn retry(&self, temp_id: TempId) -> Result<Message> {
        self.thread.update(|entries| {
            let entry = entries
                .iter_mut()
                .find(|e| e.delivery == Delivery::Failed(temp_id))
                .ok_or(SyncError::InvalidMessage("no failed message with that id"))?;
            entry.delivery = Delivery::Pending(temp_id);
            Ok::<(), SyncError>(())
        })?;
        self.deliver(temp_id).await
    }

    fn validate(&self, content: &str) -> Result<()> {
        if self.is_closed() {
            return Err(SyncError::Cancelled);
        }
        if content.trim().is_empty() {
            return Err(SyncError::InvalidMessage("message is empty"));
        }
        if content.chars().count() > self.sync.config().max_content_len {
            return Err(SyncError::InvalidMessage("message is too long"));
        }
        Ok(())
    }

    fn push_optimistic(&self, content: String, context: Option<MessageContext>) -> TempId {
        let temp = TempId::new();
        let (listing_id, lost_found_id) = match context {
            Some(MessageContext::Listing(id)) => (Some(id), None),
            Some(MessageContext::LostFound(id)) => (None, Some(id)),
            None => (None, None),
        };

        let entry = ThreadEntry {
            message: Message {
                id: temp.0,
                sender_id: self.sync.me(),
                receiver_id: self.partner_id,
                content,
                listing_id,
                lost_found_id,
                read: false,
                created_at: Utc::now(),
            },
            delivery: Delivery::Pending(temp),
        };
        self.thread.update(|entries| entries.push(entry));
        temp
    }

    async fn deliver(&self, temp: TempId) -> Result<Message> {
        let new = {
            let entries = lock(&self.thread.entries);
            let entry = entries
                .iter()
                .find(|e| e.temp_id() == Some(temp))
                .ok_or(SyncError::InvalidMessage("message no longer in thread"))?;
            NewMessage {
                sender_id: entry.message.sender_id,
                receiver_id: entry.message.receiver_id,
                content: entry.message.content.clone(),
                context: entry.message.context(),
            }
        };

        match self.sync.gateway().insert_message(new).await {
            Ok(confirmed) => {
                self.sync.record_sent(confirmed.clone());
                if self.is_closed() {
                    debug!(%temp, "view closed, not applying confirmation");
                } else {
                    self.confirm(temp, confirmed.clone());
                }
                Ok(confirmed)
            }
            Err(e) => {
                error!(%temp, partner_id = %self.partner_id, "send failed: {}", e);
                if !self.is_closed() {
                    self.mark_failed(temp);
                    let _ = self.notices.send(Notice::SendFailed {
                        temp_id: temp,
                        reason: e.to_string(),
                    });
                }
                Err(e)
            }
        }
    }

    /// Swap the temporary entry for the stored row at the same position. If
    /// a resync already brought the row in, drop the temporary entry instead.
    fn confirm(&self, temp: TempId, confirmed: Message) {
        self.thread.update(|entries| {
            let Some(pos) = entries.iter().position(|e| e.temp_id() == Some(temp)) else {
                return;
            };

            let already_present = entries
                .iter()
                .any(|e| e.delivery == Delivery::Confirmed && e.message.id == confirmed.id);
            if already_present {
                entries.remove(pos);
            } else {
                entries[pos] = ThreadEntry {
                    message: confirmed,
                    delivery: Delivery::Confirmed,
                };
            }
        });
    }

    fn mark_failed(&self, temp: TempId) {
        self.thread.update(|entries| {
            if let Some(entry) = entries.iter_mut().find(|e| e.temp_id() == Some(temp)) {
                entry.delivery = Delivery::Failed(temp);
            }
        });
    }
}

impl<G> Drop for ConversationView<G> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
