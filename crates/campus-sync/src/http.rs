use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use uuid::Uuid;

use campus_types::api::{SendMessageRequest, UpdatedResponse};
use campus_types::events::{ChangeEvent, FeedCommand, FeedEvent, MESSAGES_TABLE};
use campus_types::models::{Message, Profile};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::gateway::{ChangeFeed, NewMessage, RemoteGateway};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long the realtime handshake may take before `subscribe` gives up.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffered changes before the socket task waits on the listener.
const FEED_BUFFER: usize = 256;

/// `RemoteGateway` over the backend's REST API and realtime socket.
#[derive(Clone)]
pub struct HttpGateway {
    client: Client,
    api_url: String,
    token: String,
}

impl HttpGateway {
    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.api_url.clone(), config.token.clone())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    fn realtime_url(&self) -> String {
        let base = if let Some(rest) = self.api_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.api_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.api_url.clone()
        };
        format!("{base}/realtime")
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.bearer_auth(&self.token).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json::<T>().await?)
    }

    async fn handshake(&self, socket: &mut Socket) -> Result<()> {
        send_command(
            socket,
            &FeedCommand::Identify {
                token: self.token.clone(),
            },
        )
        .await?;
        match next_event(socket).await? {
            FeedEvent::Ready { user_id } => debug!(%user_id, "realtime identified"),
            other => return Err(unexpected(other)),
        }

        send_command(
            socket,
            &FeedCommand::Subscribe {
                table: MESSAGES_TABLE.into(),
            },
        )
        .await?;
        match next_event(socket).await? {
            FeedEvent::Subscribed { table } => info!("realtime subscribed to {}", table),
            other => return Err(unexpected(other)),
        }

        Ok(())
    }
}

impl RemoteGateway for HttpGateway {
    async fn fetch_messages(&self, user_id: Uuid) -> Result<Vec<Message>> {
        let messages: Vec<Message> = self.send_json(self.client.get(self.url("/messages"))).await?;
        debug!(%user_id, count = messages.len(), "fetched messages");
        Ok(messages)
    }

    async fn insert_message(&self, new: NewMessage) -> Result<Message> {
        let body = SendMessageRequest::from(new);
        self.send_json(self.client.post(self.url("/messages")).json(&body))
            .await
    }

    async fn mark_read(&self, message_id: Uuid) -> Result<usize> {
        let path = format!("/messages/{message_id}/read");
        let response: UpdatedResponse = self.send_json(self.client.patch(self.url(&path))).await?;
        Ok(response.updated)
    }

    async fn mark_conversation_read(&self, partner_id: Uuid) -> Result<usize> {
        let path = format!("/conversations/{partner_id}/read");
        let response: UpdatedResponse = self.send_json(self.client.post(self.url(&path))).await?;
        Ok(response.updated)
    }

    async fn fetch_profile(&self, profile_id: Uuid) -> Result<Profile> {
        let path = format!("/profiles/{profile_id}");
        self.send_json(self.client.get(self.url(&path))).await
    }

    async fn subscribe(&self, user_id: Uuid) -> Result<ChangeFeed> {
        let (mut socket, _) = connect_async(self.realtime_url()).await?;

        tokio::time::timeout(HANDSHAKE_TIMEOUT, self.handshake(&mut socket))
            .await
            .map_err(|_| SyncError::Feed("realtime handshake timed out".into()))??;

        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let pump = tokio::spawn(pump_changes(socket, user_id, tx));
        Ok(ChangeFeed::with_pump(rx, pump))
    }
}

/// Forward change frames to the feed until the socket or the feed closes.
async fn pump_changes(mut socket: Socket, user_id: Uuid, tx: mpsc::Sender<ChangeEvent>) {
    while let Some(frame) = socket.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%user_id, "realtime socket error: {}", e);
                break;
            }
        };

        match frame {
            WsMessage::Text(text) => match serde_json::from_str::<FeedEvent>(text.as_str()) {
                Ok(FeedEvent::Change(change)) => {
                    if !change.visible_to(user_id) {
                        continue;
                    }
                    if tx.send(change).await.is_err() {
                        break;
                    }
                }
                Ok(FeedEvent::Error { reason }) => warn!(%user_id, "realtime error: {}", reason),
                Ok(other) => debug!(?other, "ignoring realtime frame"),
                Err(e) => warn!(%user_id, "undecodable realtime frame: {}", e),
            },
            WsMessage::Ping(data) => {
                if socket.send(WsMessage::Pong(data)).await.is_err() {
                    break;
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
    info!(%user_id, "realtime feed closed");
}

async fn send_command(socket: &mut Socket, command: &FeedCommand) -> Result<()> {
    let text = serde_json::to_string(command)?;
    socket.send(WsMessage::Text(text.into())).await?;
    Ok(())
}

async fn next_event(socket: &mut Socket) -> Result<FeedEvent> {
    while let Some(frame) = socket.next().await {
        if let WsMessage::Text(text) = frame? {
            return Ok(serde_json::from_str(text.as_str())?);
        }
    }
    Err(SyncError::Feed("socket closed during handshake".into()))
}

fn unexpected(event: FeedEvent) -> SyncError {
    match event {
        FeedEvent::Error { reason } => SyncError::Feed(reason),
        other => SyncError::Feed(format!("unexpected frame: {other:?}")),
    }
}
