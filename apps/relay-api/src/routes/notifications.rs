//! Recipient-facing notification endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::auth::middleware::AuthUser;
use crate::error::{ApiError, ApiErrorBody};
use crate::models::notification::Notification;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/notifications", get(list_notifications))
        .route("/notifications/unread-count", get(unread_count))
        .route("/notifications/read-all", put(mark_all_read))
        .route("/notifications/{notification_id}/read", put(mark_read))
        .route("/notifications/{notification_id}", delete(delete_notification))
}

fn parse_id(raw: &str) -> Result<i64, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request("Invalid notification ID"))
}

// ---------------------------------------------------------------------------
// GET /api/v1/notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, IntoParams)]
pub struct ListNotificationsParams {
    /// Only notifications with an ID lower than this.
    pub before: Option<i64>,
    /// 1-100, default 50.
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ListNotificationsResponse {
    pub data: Vec<Notification>,
    pub has_more: bool,
}

#[utoipa::path(
    get,
    path = "/api/v1/notifications",
    tag = "Notifications",
    security(("bearer" = [])),
    params(ListNotificationsParams),
    responses(
        (status = 200, description = "Newest first", body = ListNotificationsResponse),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
    ),
)]
pub async fn list_notifications(
    AuthUser { user_id }: AuthUser,
    State(state): State<AppState>,
    Query(params): Query<ListNotificationsParams>,
) -> Result<Json<ListNotificationsResponse>, ApiError> {
    let limit = params.limit.unwrap_or(50).clamp(1, 100);

    let rows = state
        .store
        .list_notifications(&user_id, params.before, limit + 1)
        .await?;

    let has_more = rows.len() as i64 > limit;
    let data: Vec<Notification> = rows.into_iter().take(limit as usize).collect();

    Ok(Json(ListNotificationsResponse { data, has_more }))
}

// ---------------------------------------------------------------------------
// GET /api/v1/notifications/unread-count
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, ToSchema)]
pub struct UnreadCountResponse {
    pub count: i64,
}

#[utoipa::path(
    get,
    path = "/api/v1/notifications/unread-count",
    tag = "Notifications",
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Unread count", body = UnreadCountResponse),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
    ),
)]
pub async fn unread_count(
    AuthUser { user_id }: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<UnreadCountResponse>, ApiError> {
    let count = state.store.unread_count(&user_id).await?;
    Ok(Json(UnreadCountResponse { count }))
}

// ---------------------------------------------------------------------------
// PUT /api/v1/notifications/:notification_id/read
// ---------------------------------------------------------------------------

#[utoipa::path(
    put,
    path = "/api/v1/notifications/{notification_id}/read",
    tag = "Notifications",
    security(("bearer" = [])),
    params(("notification_id" = String, Path, description = "Notification ID")),
    responses(
        (status = 200, description = "Marked read", body = Notification),
        (status = 400, description = "Invalid ID", body = ApiErrorBody),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 404, description = "Not found", body = ApiErrorBody),
    ),
)]
pub async fn mark_read(
    AuthUser { user_id }: AuthUser,
    State(state): State<AppState>,
    Path(notification_id): Path<String>,
) -> Result<Json<Notification>, ApiError> {
    let id = parse_id(&notification_id)?;
    let notification = state
        .store
        .mark_read(&user_id, id)
        .await?
        .ok_or_else(|| ApiError::not_found("Notification not found"))?;
    Ok(Json(notification))
}

// ---------------------------------------------------------------------------
// PUT /api/v1/notifications/read-all
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, ToSchema)]
pub struct MarkAllReadResponse {
    pub updated: usize,
}

#[utoipa::path(
    put,
    path = "/api/v1/notifications/read-all",
    tag = "Notifications",
    security(("bearer" = [])),
    responses(
        (status = 200, description = "All marked read", body = MarkAllReadResponse),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
    ),
)]
pub async fn mark_all_read(
    AuthUser { user_id }: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<MarkAllReadResponse>, ApiError> {
    let updated = state.store.mark_all_read(&user_id).await?;
    Ok(Json(MarkAllReadResponse { updated }))
}

// ---------------------------------------------------------------------------
// DELETE /api/v1/notifications/:notification_id
// ---------------------------------------------------------------------------

#[utoipa::path(
    delete,
    path = "/api/v1/notifications/{notification_id}",
    tag = "Notifications",
    security(("bearer" = [])),
    params(("notification_id" = String, Path, description = "Notification ID")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 404, description = "Not found", body = ApiErrorBody),
    ),
)]
pub async fn delete_notification(
    AuthUser { user_id }: AuthUser,
    State(state): State<AppState>,
    Path(notification_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&notification_id)?;
    if !state.store.delete_notification(&user_id, id).await? {
        return Err(ApiError::not_found("Notification not found"));
    }
    Ok(StatusCode::NO_CONTENT)
}
