use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;

use campus_types::events::ChangeEvent;

/// Fans message-table changes out to every realtime connection. Each
/// connection filters down to the rows its user may see.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// All connections receive all changes
    broadcast_tx: broadcast::Sender<ChangeEvent>,

    /// Open realtime connections per user: user_id -> count
    connections: RwLock<HashMap<Uuid, usize>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                connections: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to the raw change stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Publish a change. Having no listeners is not an error.
    pub fn publish(&self, event: ChangeEvent) {
        let _ = self.inner.broadcast_tx.send(event);
    }

    /// Count a new connection for `user_id`. Returns the open connection count.
    pub async fn connect(&self, user_id: Uuid) -> usize {
        let mut connections = self.inner.connections.write().await;
        let count = connections.entry(user_id).or_default();
        *count += 1;
        *count
    }

    /// Drop one connection for `user_id`. Returns the remaining count.
    pub async fn disconnect(&self, user_id: Uuid) -> usize {
        let mut connections = self.inner.connections.write().await;
        let Some(count) = connections.get_mut(&user_id) else {
            return 0;
        };

        *count = count.saturating_sub(1);
        let remaining = *count;
        if remaining == 0 {
            connections.remove(&user_id);
        }
        remaining
    }

    pub async fn is_connected(&self, user_id: Uuid) -> bool {
        self.inner.connections.read().await.contains_key(&user_id)
    }
}
