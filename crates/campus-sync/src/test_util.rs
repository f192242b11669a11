//! Scripted in-memory backend for exercising the sync layer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{Notify, mpsc};
use uuid::Uuid;

use campus_types::events::ChangeEvent;
use campus_types::models::{Message, Profile};

use crate::config::{RetryPolicy, SyncConfig};
use crate::error::{Result, SyncError};
use crate::gateway::{ChangeFeed, NewMessage, RemoteGateway};
use crate::session::MessagingSync;

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 9, 1, 12, 0, 0).unwrap()
}

pub fn message_at(sender: Uuid, receiver: Uuid, content: &str, read: bool, minute: i64) -> Message {
    Message {
        id: Uuid::new_v4(),
        sender_id: sender,
        receiver_id: receiver,
        content: content.into(),
        listing_id: None,
        lost_found_id: None,
        read,
        created_at: base_time() + chrono::Duration::minutes(minute),
    }
}

pub fn profile(name: &str) -> Profile {
    Profile {
        id: Uuid::new_v4(),
        display_name: name.into(),
        student_id: format!("s-{}", name.to_lowercase()),
        bio: None,
        blocked: false,
        created_at: base_time(),
        last_seen_at: None,
    }
}

/// Session with fast retries so failure paths finish quickly.
pub fn sync_for(gateway: &Arc<FakeGateway>, me: Uuid) -> MessagingSync<FakeGateway> {
    gateway.set_me(me);
    let config = SyncConfig::new("http://fake", "token").with_read_retry(RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    });
    MessagingSync::new(gateway.clone(), me, config)
}

/// Poll `check` until it holds, failing the test after two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Default)]
struct FakeState {
    me: Uuid,
    messages: Vec<Message>,
    profiles: HashMap<Uuid, Profile>,
    clock: i64,
    fail_fetches: usize,
    fail_inserts: usize,
    fail_reads: usize,
    fetch_calls: usize,
    insert_calls: usize,
    mark_read_calls: usize,
    hold_fetch: Option<Arc<Notify>>,
    hold_insert: Option<Arc<Notify>>,
    feed: Option<mpsc::Sender<ChangeEvent>>,
}

impl FakeState {
    fn next_time(&mut self) -> DateTime<Utc> {
        self.clock += 1;
        base_time() + chrono::Duration::hours(1) + chrono::Duration::seconds(self.clock)
    }

    fn publish(&self, event: ChangeEvent) {
        if let Some(feed) = &self.feed {
            let _ = feed.try_send(event);
        }
    }
}

#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<FakeState>,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    fn set_me(&self, me: Uuid) {
        self.lock().me = me;
    }

    pub fn add_profile(&self, name: &str) -> Uuid {
        let profile = profile(name);
        let id = profile.id;
        self.lock().profiles.insert(id, profile);
        id
    }

    /// Put a message in the store without publishing it.
    pub fn seed(&self, sender: Uuid, receiver: Uuid, content: &str, read: bool, minute: i64) -> Message {
        let message = message_at(sender, receiver, content, read, minute);
        self.lock().messages.push(message.clone());
        message
    }

    /// Another student sends a message: store it and publish the insert.
    pub fn push_remote(&self, sender: Uuid, receiver: Uuid, content: &str) -> Message {
        let mut state = self.lock();
        let mut message = message_at(sender, receiver, content, false, 0);
        message.created_at = state.next_time();
        state.messages.push(message.clone());
        state.publish(ChangeEvent::insert(message.clone()));
        message
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock().messages.clone()
    }

    pub fn fail_next_fetches(&self, n: usize) {
        self.lock().fail_fetches = n;
    }

    pub fn fail_next_inserts(&self, n: usize) {
        self.lock().fail_inserts = n;
    }

    pub fn fail_next_reads(&self, n: usize) {
        self.lock().fail_reads = n;
    }

    /// The next fetch returns the store as it is now, but only after the
    /// returned gate is notified.
    pub fn hold_next_fetch(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.lock().hold_fetch = Some(gate.clone());
        gate
    }

    /// The next insert waits for the returned gate before storing.
    pub fn hold_next_insert(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.lock().hold_insert = Some(gate.clone());
        gate
    }

    pub fn fetch_calls(&self) -> usize {
        self.lock().fetch_calls
    }

    pub fn insert_calls(&self) -> usize {
        self.lock().insert_calls
    }

    pub fn mark_read_calls(&self) -> usize {
        self.lock().mark_read_calls
    }

    pub fn has_subscriber(&self) -> bool {
        self.lock().feed.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    pub fn close_feed(&self) {
        self.lock().feed = None;
    }
}

fn unavailable() -> SyncError {
    SyncError::Status {
        status: 503,
        body: "backend unavailable".into(),
    }
}

impl RemoteGateway for FakeGateway {
    async fn fetch_messages(&self, user_id: Uuid) -> Result<Vec<Message>> {
        let (gate, mut messages) = {
            let mut state = self.lock();
            state.fetch_calls += 1;
            if state.fail_fetches > 0 {
                state.fail_fetches -= 1;
                return Err(unavailable());
            }
            let messages: Vec<Message> = state
                .messages
                .iter()
                .filter(|m| m.involves(user_id))
                .cloned()
                .collect();
            (state.hold_fetch.take(), messages)
        };

        if let Some(gate) = gate {
            gate.notified().await;
        }

        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    async fn insert_message(&self, new: NewMessage) -> Result<Message> {
        let gate = {
            let mut state = self.lock();
            state.insert_calls += 1;
            if state.fail_inserts > 0 {
                state.fail_inserts -= 1;
                return Err(unavailable());
            }
            state.hold_insert.take()
        };

        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut state = self.lock();
        let (listing_id, lost_found_id) = match new.context {
            Some(campus_types::models::MessageContext::Listing(id)) => (Some(id), None),
            Some(campus_types::models::MessageContext::LostFound(id)) => (None, Some(id)),
            None => (None, None),
        };
        let message = Message {
            id: Uuid::new_v4(),
            sender_id: new.sender_id,
            receiver_id: new.receiver_id,
            content: new.content,
            listing_id,
            lost_found_id,
            read: false,
            created_at: state.next_time(),
        };
        state.messages.push(message.clone());
        state.publish(ChangeEvent::insert(message.clone()));
        Ok(message)
    }

    async fn mark_read(&self, message_id: Uuid) -> Result<usize> {
        let mut state = self.lock();
        state.mark_read_calls += 1;
        if state.fail_reads > 0 {
            state.fail_reads -= 1;
            return Err(unavailable());
        }

        let me = state.me;
        let Some(message) = state
            .messages
            .iter_mut()
            .find(|m| m.id == message_id && m.receiver_id == me && !m.read)
        else {
            return Ok(0);
        };
        message.read = true;
        let updated = message.clone();
        state.publish(ChangeEvent::update(updated));
        Ok(1)
    }

    async fn mark_conversation_read(&self, partner_id: Uuid) -> Result<usize> {
        let mut state = self.lock();
        if state.fail_reads > 0 {
            state.fail_reads -= 1;
            return Err(unavailable());
        }

        let me = state.me;
        let mut changed = Vec::new();
        for message in state.messages.iter_mut() {
            if message.sender_id == partner_id && message.receiver_id == me && !message.read {
                message.read = true;
                changed.push(message.clone());
            }
        }
        for message in &changed {
            state.publish(ChangeEvent::update(message.clone()));
        }
        Ok(changed.len())
    }

    async fn fetch_profile(&self, profile_id: Uuid) -> Result<Profile> {
        self.lock()
            .profiles
            .get(&profile_id)
            .cloned()
            .ok_or(SyncError::Status {
                status: 404,
                body: "not found".into(),
            })
    }

    async fn subscribe(&self, _user_id: Uuid) -> Result<ChangeFeed> {
        let (tx, rx) = mpsc::channel(64);
        self.lock().feed = Some(tx);
        Ok(ChangeFeed::new(rx))
    }
}
