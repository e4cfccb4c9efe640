//! Presence lookup.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::auth::middleware::AuthUser;
use crate::error::{ApiError, ApiErrorBody};
use crate::models::user_status::PresenceStatus;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/users/{user_id}/presence", get(get_presence))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PresenceResponse {
    pub user_id: String,
    pub status: PresenceStatus,
    /// Whether this process holds a live connection for the user right now.
    pub connected: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// GET /api/v1/users/:user_id/presence
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/v1/users/{user_id}/presence",
    tag = "Presence",
    security(("bearer" = [])),
    params(("user_id" = String, Path, description = "User ID")),
    responses(
        (status = 200, description = "Current presence", body = PresenceResponse),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
    ),
)]
pub async fn get_presence(
    _auth: AuthUser,
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<PresenceResponse>, ApiError> {
    let connected = state.relay.registry().is_online(&user_id);
    let row = state.store.get_status(&user_id).await?;

    // The registry wins over a row whose write has not landed yet. Once the
    // last connection is gone, report what friends saw until the deferred
    // offline sync runs.
    let status = match (&row, connected) {
        (Some(r), true) if r.status.is_connected() => r.status,
        (_, true) => PresenceStatus::Online,
        (_, false) => state.relay.presence().announced(&user_id).await,
    };

    Ok(Json(PresenceResponse {
        user_id,
        status,
        connected,
        last_seen: row.map(|r| r.last_seen),
    }))
}
