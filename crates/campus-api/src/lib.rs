pub mod auth;
pub mod messages;
pub mod middleware;
pub mod profiles;

use axum::{
    Router,
    http::StatusCode,
    routing::{get, patch, post},
};
use tracing::error;

use campus_db::Database;

use crate::auth::AppState;
use crate::middleware::require_auth;

/// REST routes for auth, messages and profiles. The realtime socket is
/// mounted separately by the server.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login));

    let protected_routes = Router::new()
        .route(
            "/messages",
            get(messages::list_messages).post(messages::send_message),
        )
        .route("/messages/{message_id}/read", patch(messages::mark_read))
        .route(
            "/conversations/{partner_id}/read",
            post(messages::mark_conversation_read),
        )
        .route("/profiles/{profile_id}", get(profiles::get_profile))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_auth,
        ));

    public_routes.merge(protected_routes).with_state(state)
}

/// Run a blocking database call off the async runtime.
pub(crate) async fn db_call<F, T>(state: &AppState, f: F) -> Result<T, StatusCode>
where
    F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let state = state.clone();
    tokio::task::spawn_blocking(move || f(&state.db))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|e| {
            error!("database error: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}
