//! Web Push subscription endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::middleware::AuthUser;
use crate::error::{ApiError, ApiErrorBody};
use crate::models::push_subscription::SubscriptionKeys;
use crate::AppState;

/// Endpoint URLs from browsers stay well below this.
const MAX_ENDPOINT_LEN: usize = 2048;

pub fn router() -> Router<AppState> {
    Router::new().route(
        "/push-subscriptions",
        post(subscribe).delete(unsubscribe),
    )
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SubscribeRequest {
    pub endpoint: String,
    pub keys: SubscriptionKeys,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SubscribeResponse {
    pub endpoint: String,
    /// Whether the server will actually send pushes.
    pub push_enabled: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UnsubscribeRequest {
    pub endpoint: String,
}

fn validate_endpoint(endpoint: &str) -> Result<(), ApiError> {
    if endpoint.is_empty() || endpoint.len() > MAX_ENDPOINT_LEN {
        return Err(ApiError::bad_request("Invalid endpoint length"));
    }
    if !endpoint.starts_with("https://") {
        return Err(ApiError::bad_request("Endpoint must be an https URL"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// POST /api/v1/push-subscriptions
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/api/v1/push-subscriptions",
    tag = "Push",
    security(("bearer" = [])),
    request_body = SubscribeRequest,
    responses(
        (status = 201, description = "Subscribed", body = SubscribeResponse),
        (status = 400, description = "Invalid subscription", body = ApiErrorBody),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
    ),
)]
pub async fn subscribe(
    AuthUser { user_id }: AuthUser,
    State(state): State<AppState>,
    Json(body): Json<SubscribeRequest>,
) -> Result<(StatusCode, Json<SubscribeResponse>), ApiError> {
    validate_endpoint(&body.endpoint)?;
    if body.keys.p256dh.is_empty() || body.keys.auth.is_empty() {
        return Err(ApiError::bad_request("Subscription keys are required"));
    }

    state
        .store
        .upsert_push_subscription(&user_id, &body.endpoint, &body.keys)
        .await?;

    tracing::debug!(user_id = %user_id, endpoint = %body.endpoint, "push subscription saved");

    Ok((
        StatusCode::CREATED,
        Json(SubscribeResponse {
            endpoint: body.endpoint,
            push_enabled: state.config.push.is_enabled(),
        }),
    ))
}

// ---------------------------------------------------------------------------
// DELETE /api/v1/push-subscriptions
// ---------------------------------------------------------------------------

#[utoipa::path(
    delete,
    path = "/api/v1/push-subscriptions",
    tag = "Push",
    security(("bearer" = [])),
    request_body = UnsubscribeRequest,
    responses(
        (status = 204, description = "Unsubscribed, or was not subscribed"),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
    ),
)]
pub async fn unsubscribe(
    AuthUser { user_id }: AuthUser,
    State(state): State<AppState>,
    Json(body): Json<UnsubscribeRequest>,
) -> Result<StatusCode, ApiError> {
    let removed = state
        .store
        .delete_user_push_subscription(&user_id, &body.endpoint)
        .await?;
    tracing::debug!(user_id = %user_id, endpoint = %body.endpoint, removed, "push unsubscribe");
    Ok(StatusCode::NO_CONTENT)
}
