//! Access token (PAT) lookup and WebSocket ticket management.
//!
//! Tokens are minted by the account service and shared through the
//! key-value store; the relay only resolves them to a user.

use serde::{Deserialize, Serialize};

use circle_common::id::prefix;

use crate::db::kv::KeyValueStore;
use crate::error::ApiError;

// ---------------------------------------------------------------------------
// Opaque token generation
// ---------------------------------------------------------------------------

/// Generate an opaque random token with the given prefix.
pub fn generate_opaque_token(prefix: &str, bytes: usize) -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use rand::Rng;
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill(&mut buf[..]);
    format!("{}_{}", prefix, URL_SAFE_NO_PAD.encode(&buf))
}

/// Data stored alongside a PAT or a ticket.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenData {
    pub user_id: String,
}

fn encode(data: &TokenData) -> Result<String, ApiError> {
    serde_json::to_string(data).map_err(|_| ApiError::internal("serialization"))
}

fn decode(raw: Option<String>) -> Result<Option<TokenData>, ApiError> {
    raw.map(|v| serde_json::from_str(&v).map_err(|_| ApiError::internal("corrupt token data")))
        .transpose()
}

// ---------------------------------------------------------------------------
// PAT
// ---------------------------------------------------------------------------

/// PAT TTL in seconds (1 hour).
pub const PAT_TTL_SECS: u64 = 3600;

fn pat_key(token: &str) -> String {
    format!("relay:pat:{}", token)
}

/// Mint a PAT. The account service issues PATs in production and writes
/// them to the shared store; this service only reads them. Minting here is
/// a seam for tests and local tooling.
pub fn generate_pat() -> String {
    generate_opaque_token(prefix::ACCESS_TOKEN, 32)
}

/// Write a PAT the way the account service does. See [`generate_pat`].
pub async fn store_pat(
    kv: &dyn KeyValueStore,
    token: &str,
    data: &TokenData,
) -> Result<(), ApiError> {
    kv.set_ex(&pat_key(token), &encode(data)?, PAT_TTL_SECS).await
}

pub async fn lookup_pat(
    kv: &dyn KeyValueStore,
    token: &str,
) -> Result<Option<TokenData>, ApiError> {
    decode(kv.get(&pat_key(token)).await?)
}

// ---------------------------------------------------------------------------
// WebSocket ticket (30-second TTL, single-use)
// ---------------------------------------------------------------------------

/// WS ticket TTL in seconds.
pub const WS_TICKET_TTL_SECS: u64 = 30;

fn ticket_key(ticket: &str) -> String {
    format!("relay:wst:{}", ticket)
}

pub fn generate_ws_ticket() -> String {
    generate_opaque_token(prefix::TICKET, 32)
}

pub async fn store_ws_ticket(
    kv: &dyn KeyValueStore,
    ticket: &str,
    data: &TokenData,
) -> Result<(), ApiError> {
    kv.set_ex(&ticket_key(ticket), &encode(data)?, WS_TICKET_TTL_SECS)
        .await
}

/// Resolve and invalidate a ticket in one step.
pub async fn consume_ws_ticket(
    kv: &dyn KeyValueStore,
    ticket: &str,
) -> Result<Option<TokenData>, ApiError> {
    decode(kv.take(&ticket_key(ticket)).await?)
}
