use std::sync::Arc;

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use jsonwebtoken::{EncodingKey, Header, encode};
use tracing::{info, warn};
use uuid::Uuid;

use campus_db::Database;
use campus_gateway::dispatcher::Dispatcher;
use campus_types::api::{
    Claims, LoginRequest, LoginResponse, RegisterRequest, RegisterResponse,
};

use crate::db_call;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Database,
    pub jwt_secret: String,
    pub dispatcher: Dispatcher,
}

/// Development sign-up. Production deployments issue tokens from the hosted
/// auth service instead.
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let display_name = req.display_name.trim().to_string();
    if display_name.is_empty() || display_name.chars().count() > 64 {
        return Err(StatusCode::BAD_REQUEST);
    }
    if req.student_id.len() < 3 || req.student_id.len() > 32 {
        return Err(StatusCode::BAD_REQUEST);
    }
    if req.password.len() < 8 {
        return Err(StatusCode::BAD_REQUEST);
    }

    let student_id = req.student_id.clone();
    let taken = db_call(&state, move |db| db.get_profile_by_student_id(&student_id))
        .await?
        .is_some();
    if taken {
        return Err(StatusCode::CONFLICT);
    }

    // Hash password with Argon2id
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(req.password.as_bytes(), &salt)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .to_string();

    let user_id = Uuid::new_v4();

    let (id, name, student_id) = (user_id.to_string(), display_name.clone(), req.student_id);
    db_call(&state, move |db| {
        db.create_profile(&id, &name, &student_id, &password_hash)
    })
    .await?;

    let token = create_token(&state.jwt_secret, user_id, &display_name)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    info!(%user_id, "profile registered");

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse { user_id, token }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let student_id = req.student_id.clone();
    let profile = db_call(&state, move |db| db.get_profile_by_student_id(&student_id))
        .await?
        .ok_or(StatusCode::UNAUTHORIZED)?;

    // Verify password
    let parsed_hash =
        PasswordHash::new(&profile.password).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .map_err(|_| StatusCode::UNAUTHORIZED)?;

    if profile.blocked {
        warn!(user_id = %profile.id, "blocked profile attempted login");
        return Err(StatusCode::FORBIDDEN);
    }

    let user_id: Uuid = profile.id.parse().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let id = profile.id.clone();
    db_call(&state, move |db| db.touch_profile(&id)).await?;

    let token = create_token(&state.jwt_secret, user_id, &profile.display_name)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(LoginResponse {
        user_id,
        display_name: profile.display_name,
        token,
    }))
}

pub fn create_token(secret: &str, user_id: Uuid, display_name: &str) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id,
        display_name: display_name.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::days(30)).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}
