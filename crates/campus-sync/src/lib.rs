//! Client-side messaging sync for the campus marketplace.
//!
//! The backend owns every message row. This crate keeps a recomputed view of
//! it for one signed-in student: the partner list with previews and unread
//! counts, a session-wide unread counter, a live change listener, and the
//! optimistic send path used by an open conversation.

pub mod aggregator;
pub mod config;
pub mod conversation;
pub mod error;
pub mod gateway;
pub mod http;
pub mod listener;
pub mod session;
pub mod unread;
pub mod view;

#[cfg(test)]
pub(crate) mod test_util;

pub use aggregator::{ConversationPartner, aggregate};
pub use config::{RetryPolicy, SyncConfig};
pub use conversation::{ContactIntent, ConversationView, Delivery, Notice, TempId, ThreadEntry};
pub use error::{Result, SyncError};
pub use gateway::{ChangeFeed, NewMessage, RemoteGateway};
pub use http::HttpGateway;
pub use listener::ListenerHandle;
pub use session::MessagingSync;
pub use unread::{PendingRead, UnreadTracker};
pub use view::{EMPTY_CONVERSATIONS, PartnerRow, empty_state, partner_rows};
