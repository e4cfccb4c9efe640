//! Gateway ticket minting.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;
use utoipa::ToSchema;

use crate::auth::middleware::AuthUser;
use crate::auth::tokens::{self, TokenData};
use crate::error::{ApiError, ApiErrorBody};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/gateway/ticket", post(create_ticket))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TicketResponse {
    /// Single-use; send it in IDENTIFY.
    pub ticket: String,
    pub expires_in: u64,
}

// ---------------------------------------------------------------------------
// POST /api/v1/gateway/ticket
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/api/v1/gateway/ticket",
    tag = "Gateway",
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Ticket minted", body = TicketResponse),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
    ),
)]
pub async fn create_ticket(
    AuthUser { user_id }: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<TicketResponse>, ApiError> {
    let ticket = tokens::generate_ws_ticket();
    tokens::store_ws_ticket(state.kv.as_ref(), &ticket, &TokenData { user_id }).await?;
    Ok(Json(TicketResponse {
        ticket,
        expires_in: tokens::WS_TICKET_TTL_SECS,
    }))
}
