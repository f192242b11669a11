use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use campus_types::events::{FeedCommand, FeedEvent, MESSAGES_TABLE};

use crate::dispatcher::Dispatcher;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Time a fresh socket gets to send its Identify command.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle one realtime socket: Identify, then forward message changes the
/// user is a party to once they have subscribed.
pub async fn handle_connection(socket: WebSocket, dispatcher: Dispatcher, jwt_secret: String) {
    let (mut sender, mut receiver) = socket.split();

    let Some(user_id) = wait_for_identify(&mut receiver, &jwt_secret).await else {
        warn!("Realtime client failed to identify, closing");
        return;
    };

    info!(%user_id, "realtime client identified");

    if send_event(&mut sender, &FeedEvent::Ready { user_id }).await.is_err() {
        return;
    }

    run_connection_loop(sender, receiver, dispatcher, user_id).await;
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    dispatcher: Dispatcher,
    user_id: Uuid,
) {
    let open = dispatcher.connect(user_id).await;
    debug!(%user_id, open, "realtime connection registered");

    let mut changes = dispatcher.subscribe();

    // Replies to commands are written by the send task only
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<FeedEvent>();

    let subscribed = Arc::new(AtomicBool::new(false));
    let send_subscribed = subscribed.clone();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = changes.recv() => {
                    let change = match result {
                        Ok(change) => change,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(%user_id, "Change receiver lagged by {} events", n);
                            continue;
                        }
                        Err(_) => break,
                    };

                    if !send_subscribed.load(Ordering::Acquire) || !change.visible_to(user_id) {
                        continue;
                    }

                    if send_event(&mut sender, &FeedEvent::Change(change)).await.is_err() {
                        break;
                    }
                }
                reply = reply_rx.recv() => {
                    let Some(reply) = reply else { break };
                    if send_event(&mut sender, &reply).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!(%user_id, "Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Default::default())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<FeedCommand>(text.as_str()) {
                    Ok(cmd) => {
                        let reply = handle_command(user_id, cmd, &subscribed);
                        if reply_tx.send(reply).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(
                            %user_id,
                            "bad command: {} -- raw: {}",
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                        let _ = reply_tx.send(FeedEvent::Error {
                            reason: "malformed command".into(),
                        });
                    }
                },
                Message::Pong(_) => {
                    pong_received.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    let remaining = dispatcher.disconnect(user_id).await;
    info!(%user_id, remaining, "realtime client disconnected");
}

fn handle_command(user_id: Uuid, cmd: FeedCommand, subscribed: &AtomicBool) -> FeedEvent {
    match cmd {
        FeedCommand::Identify { .. } => FeedEvent::Error {
            reason: "already identified".into(),
        },
        FeedCommand::Subscribe { table } if table == MESSAGES_TABLE => {
            info!(%user_id, "subscribed to {}", table);
            subscribed.store(true, Ordering::Release);
            FeedEvent::Subscribed { table }
        }
        FeedCommand::Subscribe { table } => {
            warn!(%user_id, "subscribe to unknown table {}", table);
            FeedEvent::Error {
                reason: format!("unknown table: {table}"),
            }
        }
    }
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &FeedEvent,
) -> Result<(), ()> {
    let text = serde_json::to_string(event).map_err(|e| {
        warn!("failed to encode feed event: {}", e);
    })?;
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}

async fn wait_for_identify(
    receiver: &mut SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<Uuid> {
    use campus_types::api::Claims;
    use jsonwebtoken::{DecodingKey, Validation, decode};

    let timeout = tokio::time::timeout(IDENTIFY_TIMEOUT, async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(FeedCommand::Identify { token }) =
                    serde_json::from_str::<FeedCommand>(text.as_str())
                {
                    let token_data = decode::<Claims>(
                        &token,
                        &DecodingKey::from_secret(jwt_secret.as_bytes()),
                        &Validation::default(),
                    )
                    .ok()?;

                    return Some(token_data.claims.sub);
                }
            }
        }
        None
    });

    timeout.await.ok().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_to_messages_sets_flag() {
        let flag = AtomicBool::new(false);
        let reply = handle_command(
            Uuid::new_v4(),
            FeedCommand::Subscribe {
                table: MESSAGES_TABLE.into(),
            },
            &flag,
        );

        assert!(matches!(reply, FeedEvent::Subscribed { ref table } if table == "messages"));
        assert!(flag.load(Ordering::Acquire));
    }

    #[test]
    fn subscribe_to_other_table_is_rejected() {
        let flag = AtomicBool::new(false);
        let reply = handle_command(
            Uuid::new_v4(),
            FeedCommand::Subscribe {
                table: "listings".into(),
            },
            &flag,
        );

        assert!(matches!(reply, FeedEvent::Error { .. }));
        assert!(!flag.load(Ordering::Acquire));
    }

    #[test]
    fn second_identify_is_an_error() {
        let flag = AtomicBool::new(false);
        let reply = handle_command(
            Uuid::new_v4(),
            FeedCommand::Identify {
                token: "again".into(),
            },
            &flag,
        );
        assert!(matches!(reply, FeedEvent::Error { .. }));
    }
}
