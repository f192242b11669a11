use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use campus_db::models::ProfileRow;
use campus_types::models::Profile;

use crate::auth::AppState;
use crate::db_call;
use crate::messages::parse_timestamp;
use crate::middleware::Claims;

pub async fn get_profile(
    State(state): State<AppState>,
    Path(profile_id): Path<Uuid>,
    Extension(_claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let id = profile_id.to_string();
    let row = db_call(&state, move |db| db.get_profile_by_id(&id))
        .await?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(row_to_profile(profile_id, row)))
}

fn row_to_profile(id: Uuid, row: ProfileRow) -> Profile {
    Profile {
        id,
        display_name: row.display_name,
        student_id: row.student_id,
        bio: row.bio,
        blocked: row.blocked,
        created_at: parse_timestamp(&row.created_at),
        last_seen_at: row.last_seen_at.as_deref().map(parse_timestamp),
    }
}
