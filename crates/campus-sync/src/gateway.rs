use std::future::Future;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use campus_types::api::SendMessageRequest;
use campus_types::events::ChangeEvent;
use campus_types::models::{Message, MessageContext, Profile};

use crate::error::Result;

/// A message as the sender composes it. The store assigns id and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub content: String,
    pub context: Option<MessageContext>,
}

impl From<NewMessage> for SendMessageRequest {
    fn from(new: NewMessage) -> Self {
        SendMessageRequest {
            receiver_id: new.receiver_id,
            content: new.content,
            context: new.context,
        }
    }
}

/// Everything the sync layer needs from the hosted backend. All calls act on
/// behalf of the signed-in student.
pub trait RemoteGateway: Send + Sync + 'static {
    /// Every message where `user_id` is sender or receiver, oldest first.
    fn fetch_messages(&self, user_id: Uuid) -> impl Future<Output = Result<Vec<Message>>> + Send;

    /// Store a message and return the confirmed row.
    fn insert_message(&self, new: NewMessage) -> impl Future<Output = Result<Message>> + Send;

    /// Set `read` on one message addressed to the current user. Returns the
    /// number of rows changed.
    fn mark_read(&self, message_id: Uuid) -> impl Future<Output = Result<usize>> + Send;

    /// Set `read` on every unread message from `partner_id` to the current
    /// user. Returns the number of rows changed.
    fn mark_conversation_read(&self, partner_id: Uuid)
    -> impl Future<Output = Result<usize>> + Send;

    fn fetch_profile(&self, profile_id: Uuid) -> impl Future<Output = Result<Profile>> + Send;

    /// Open a change feed limited to rows `user_id` sent or received.
    fn subscribe(&self, user_id: Uuid) -> impl Future<Output = Result<ChangeFeed>> + Send;
}

/// Stream of message changes. Dropping it stops the task feeding it.
pub struct ChangeFeed {
    events: mpsc::Receiver<ChangeEvent>,
    pump: Option<JoinHandle<()>>,
}

impl ChangeFeed {
    pub fn new(events: mpsc::Receiver<ChangeEvent>) -> Self {
        Self { events, pump: None }
    }

    /// Feed backed by a task that owns the transport.
    pub fn with_pump(events: mpsc::Receiver<ChangeEvent>, pump: JoinHandle<()>) -> Self {
        Self {
            events,
            pump: Some(pump),
        }
    }

    /// Next change, or `None` once the feed has closed.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    /// A change that is already queued, without waiting.
    pub fn try_next(&mut self) -> Option<ChangeEvent> {
        self.events.try_recv().ok()
    }
}

impl Drop for ChangeFeed {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}
