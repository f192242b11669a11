use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::gateway::RemoteGateway;
use crate::session::MessagingSync;

/// Live updates for a mounted view. Dropping the handle ends the
/// subscription, whichever way the owner goes away.
pub struct ListenerHandle {
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// True once the feed has closed and live updates have stopped.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Subscribe to changes for the session's user and resynchronize on each
/// one. Events already queued when a resync starts are folded into it.
///
/// If the feed drops, the listener ends with a warning and must be started
/// again.
pub async fn start<G: RemoteGateway>(sync: Arc<MessagingSync<G>>) -> Result<ListenerHandle> {
    let mut feed = sync.gateway().subscribe(sync.me()).await?;
    info!(user_id = %sync.me(), "live updates started");

    let task = tokio::spawn(async move {
        while let Some(event) = feed.next().await {
            sync.note_change(&event);

            let mut coalesced = 0usize;
            while let Some(queued) = feed.try_next() {
                sync.note_change(&queued);
                coalesced += 1;
            }
            debug!(op = ?event.op, coalesced, "change received, resynchronizing");

            // refresh logs its own failure; the listener keeps going
            let _ = sync.refresh().await;
        }
        warn!(user_id = %sync.me(), "change feed closed, live updates stopped");
    });

    Ok(ListenerHandle { task })
}
