//! Triggers called by the services that own the domain data.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use circle_common::id::{has_prefix, prefix};

use crate::auth::middleware::InternalAuth;
use crate::error::{ApiError, ApiErrorBody, FieldError};
use crate::models::notification::{NewNotification, Notification};
use crate::relay::{RelayEvent, RelayOutcome};
use crate::AppState;

const MAX_TITLE_LEN: usize = 200;
const MAX_MESSAGE_LEN: usize = 2000;
const MAX_EVENT_ID_LEN: usize = 200;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/notifications", post(create_notification))
        .route("/presence/{user_id}/refresh", post(refresh_presence))
}

fn field_error(field: &str, message: &str) -> FieldError {
    FieldError {
        field: field.to_string(),
        message: message.to_string(),
    }
}

fn validate(event: &NewNotification) -> Result<(), ApiError> {
    let mut errors = Vec::new();
    if !has_prefix(&event.user_id, prefix::USER) {
        errors.push(field_error("user_id", "must be a user ID"));
    }
    if event.title.trim().is_empty() || event.title.len() > MAX_TITLE_LEN {
        errors.push(field_error("title", "must be 1-200 characters"));
    }
    if event.message.len() > MAX_MESSAGE_LEN {
        errors.push(field_error("message", "must be at most 2000 characters"));
    }
    if let Some(key) = &event.event_id {
        if key.trim().is_empty() || key.len() > MAX_EVENT_ID_LEN {
            errors.push(field_error("event_id", "must be 1-200 characters"));
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ApiError::validation(errors))
    }
}

// ---------------------------------------------------------------------------
// POST /internal/v1/notifications
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/internal/v1/notifications",
    tag = "Internal",
    security(("bearer" = [])),
    request_body = NewNotification,
    responses(
        (status = 201, description = "Persisted; delivery continues in the background", body = Notification),
        (status = 400, description = "Validation error", body = ApiErrorBody),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 503, description = "Could not persist", body = ApiErrorBody),
    ),
)]
pub async fn create_notification(
    _internal: InternalAuth,
    State(state): State<AppState>,
    Json(event): Json<NewNotification>,
) -> Result<(StatusCode, Json<Notification>), ApiError> {
    validate(&event)?;

    let outcome = state
        .relay
        .handle(RelayEvent::DomainEvent(event))
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "notification not persisted");
            ApiError::service_unavailable("Notification could not be stored")
        })?;

    match outcome {
        // Delivery keeps running after the response is sent.
        RelayOutcome::Notified { notification, .. } => {
            Ok((StatusCode::CREATED, Json(notification)))
        }
        _ => Err(ApiError::internal("Unexpected relay outcome")),
    }
}

// ---------------------------------------------------------------------------
// POST /internal/v1/presence/:user_id/refresh
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/internal/v1/presence/{user_id}/refresh",
    tag = "Internal",
    security(("bearer" = [])),
    params(("user_id" = String, Path, description = "User ID")),
    responses(
        (status = 202, description = "Refresh scheduled"),
        (status = 400, description = "Invalid user ID", body = ApiErrorBody),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
    ),
)]
pub async fn refresh_presence(
    _internal: InternalAuth,
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if !has_prefix(&user_id, prefix::USER) {
        return Err(ApiError::bad_request("Invalid user ID"));
    }
    // Runs in the background; the caller does not wait for the broadcast.
    state
        .relay
        .handle(RelayEvent::PresenceRefresh { user_id })
        .await?;
    Ok(StatusCode::ACCEPTED)
}
