use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use campus_db::models::{MessageRow, NewMessageRow};
use campus_types::api::{SendMessageRequest, UpdatedResponse};
use campus_types::events::ChangeEvent;
use campus_types::models::{Message, MessageContext};

use crate::auth::AppState;
use crate::db_call;
use crate::middleware::Claims;

/// Longest message body accepted, in characters.
pub const MAX_CONTENT_LEN: usize = 2000;

/// Every message the caller sent or received, oldest first.
pub async fn list_messages(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let uid = claims.sub.to_string();
    let rows = db_call(&state, move |db| db.get_messages_for_user(&uid)).await?;

    let messages: Vec<Message> = rows.into_iter().map(row_to_message).collect();
    debug!(user_id = %claims.sub, count = messages.len(), "listed messages");
    Ok(Json(messages))
}

pub async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.content.trim().is_empty() || req.content.chars().count() > MAX_CONTENT_LEN {
        return Err(StatusCode::BAD_REQUEST);
    }

    let (listing_id, lost_found_id) = match req.context {
        Some(MessageContext::Listing(id)) => (Some(id.to_string()), None),
        Some(MessageContext::LostFound(id)) => (None, Some(id.to_string())),
        None => (None, None),
    };

    let new = NewMessageRow {
        sender_id: claims.sub.to_string(),
        receiver_id: req.receiver_id.to_string(),
        content: req.content,
        listing_id,
        lost_found_id,
    };

    let row = db_call(&state, move |db| {
        let sender = db.get_profile_by_id(&new.sender_id)?;
        let receiver = db.get_profile_by_id(&new.receiver_id)?;
        match (sender, receiver) {
            (Some(sender), _) if sender.blocked => Ok(Err(StatusCode::FORBIDDEN)),
            (None, _) => Ok(Err(StatusCode::UNAUTHORIZED)),
            (_, None) => Ok(Err(StatusCode::BAD_REQUEST)),
            (Some(_), Some(_)) => {
                let row = db.insert_message(&new)?;
                db.touch_profile(&new.sender_id)?;
                Ok(Ok(row))
            }
        }
    })
    .await??;

    let message = row_to_message(row);
    info!(
        message_id = %message.id,
        sender_id = %message.sender_id,
        receiver_id = %message.receiver_id,
        "message stored"
    );

    state.dispatcher.publish(ChangeEvent::insert(message.clone()));

    Ok((StatusCode::CREATED, Json(message)))
}

/// Mark one message read. Only the receiver can do this; anything else
/// reports zero rows updated.
pub async fn mark_read(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let (mid, uid) = (message_id.to_string(), claims.sub.to_string());
    let updated = db_call(&state, move |db| db.mark_message_read(&mid, &uid)).await?;

    let count = match updated {
        Some(row) => {
            state.dispatcher.publish(ChangeEvent::update(row_to_message(row)));
            1
        }
        None => 0,
    };

    Ok(Json(UpdatedResponse { updated: count }))
}

/// Mark everything `partner_id` sent to the caller as read.
pub async fn mark_conversation_read(
    State(state): State<AppState>,
    Path(partner_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let (pid, uid) = (partner_id.to_string(), claims.sub.to_string());
    let rows = db_call(&state, move |db| db.mark_conversation_read(&pid, &uid)).await?;

    let count = rows.len();
    for row in rows {
        state.dispatcher.publish(ChangeEvent::update(row_to_message(row)));
    }

    debug!(user_id = %claims.sub, %partner_id, count, "conversation marked read");
    Ok(Json(UpdatedResponse { updated: count }))
}

pub(crate) fn row_to_message(row: MessageRow) -> Message {
    Message {
        id: parse_id(&row.id, "id", &row.id),
        sender_id: parse_id(&row.sender_id, "sender_id", &row.id),
        receiver_id: parse_id(&row.receiver_id, "receiver_id", &row.id),
        listing_id: row
            .listing_id
            .as_deref()
            .map(|v| parse_id(v, "listing_id", &row.id)),
        lost_found_id: row
            .lost_found_id
            .as_deref()
            .map(|v| parse_id(v, "lost_found_id", &row.id)),
        read: row.read,
        created_at: parse_timestamp(&row.created_at),
        content: row.content,
    }
}

fn parse_id(value: &str, column: &str, row_id: &str) -> Uuid {
    value.parse().unwrap_or_else(|e| {
        warn!("Corrupt {} '{}' on message '{}': {}", column, value, row_id, e);
        Uuid::default()
    })
}

pub(crate) fn parse_timestamp(value: &str) -> DateTime<Utc> {
    value
        .parse::<DateTime<Utc>>()
        .or_else(|_| {
            // SQLite's datetime('now') has no timezone. Parse as naive UTC.
            chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
                .map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{}': {}", value, e);
            DateTime::default()
        })
}
