//! Gateway opcodes, event types, and wire-format messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::notification::Notification;
use crate::models::user_status::PresenceStatus;

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

pub const OP_DISPATCH: u8 = 0;
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_IDENTIFY: u8 = 2;
pub const OP_HEARTBEAT_ACK: u8 = 6;
pub const OP_PRESENCE_UPDATE: u8 = 9;

// ---------------------------------------------------------------------------
// Server → Client message
// ---------------------------------------------------------------------------

/// A message sent from the server to the client over WebSocket.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayMessage {
    pub op: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    pub d: Value,
}

impl GatewayMessage {
    /// Build a DISPATCH message (op=0).
    pub fn dispatch(event_name: &str, seq: u64, data: Value) -> Self {
        Self {
            op: OP_DISPATCH,
            t: Some(event_name.to_string()),
            s: Some(seq),
            d: data,
        }
    }

    /// Build a HEARTBEAT_ACK message (op=6).
    pub fn heartbeat_ack(seq: u64) -> Self {
        Self {
            op: OP_HEARTBEAT_ACK,
            t: None,
            s: None,
            d: serde_json::json!({ "ack": seq }),
        }
    }
}

// ---------------------------------------------------------------------------
// Client → Server message
// ---------------------------------------------------------------------------

/// A message received from the client over WebSocket.
#[derive(Debug, Deserialize)]
pub struct ClientMessage {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
}

#[derive(Debug, Deserialize)]
pub struct IdentifyPayload {
    pub ticket: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(default)]
    pub seq: u64,
}

/// Client-requested status. Only `online` and `away` may be set by hand;
/// `offline` is derived from the connection set.
#[derive(Debug, Deserialize)]
pub struct PresenceUpdatePayload {
    pub status: PresenceStatus,
}

// ---------------------------------------------------------------------------
// Dispatch events
// ---------------------------------------------------------------------------

/// Event names dispatched to clients.
pub struct EventName;

impl EventName {
    pub const READY: &'static str = "READY";
    pub const PRESENCE_UPDATE: &'static str = "PRESENCE_UPDATE";
    pub const NOTIFICATION_CREATE: &'static str = "NOTIFICATION_CREATE";
}

/// One event queued for a single connection. The session loop stamps the
/// per-connection sequence number when it writes the frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub event_name: &'static str,
    pub data: Value,
}

impl Dispatch {
    pub fn presence(user_id: &str, status: PresenceStatus) -> Self {
        Self {
            event_name: EventName::PRESENCE_UPDATE,
            data: serde_json::json!({ "user_id": user_id, "status": status }),
        }
    }

    pub fn notification(notification: &Notification) -> Self {
        Self {
            event_name: EventName::NOTIFICATION_CREATE,
            data: serde_json::json!({ "notification": notification }),
        }
    }
}
