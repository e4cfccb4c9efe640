//! Incoming opcode handling that needs application state.

use serde_json::json;

use crate::auth::tokens;
use crate::AppState;

use super::events::{EventName, GatewayMessage, IdentifyPayload};
use super::session::GatewaySession;

/// Process an IDENTIFY opcode for `connection_id`. Consumes the ticket and
/// returns the session plus the READY message to send.
pub async fn handle_identify(
    state: &AppState,
    connection_id: &str,
    payload: IdentifyPayload,
) -> Result<(GatewaySession, GatewayMessage), &'static str> {
    // Consume the WS ticket (single-use).
    let ticket_data = tokens::consume_ws_ticket(state.kv.as_ref(), &payload.ticket)
        .await
        .map_err(|_| "Ticket lookup failed")?
        .ok_or("Invalid or expired ticket")?;

    let heartbeat_interval = state.config.presence.heartbeat_interval.as_millis() as u64;
    let session = GatewaySession::new(connection_id.to_string(), ticket_data.user_id);

    let ready_data = json!({
        "connection_id": session.connection_id,
        "user_id": session.user_id,
        "heartbeat_interval": heartbeat_interval,
    });
    let seq = session.next_seq();
    let ready_msg = GatewayMessage::dispatch(EventName::READY, seq, ready_data);

    Ok((session, ready_msg))
}
