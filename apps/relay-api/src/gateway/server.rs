//! WebSocket upgrade handler and per-connection event loop.

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use circle_common::id::{prefix, prefixed_ulid};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time;

use crate::models::user_status::PresenceStatus;
use crate::relay::RelayEvent;
use crate::AppState;

use super::events::{
    ClientMessage, Dispatch, GatewayMessage, HeartbeatPayload, IdentifyPayload,
    PresenceUpdatePayload, OP_HEARTBEAT, OP_IDENTIFY, OP_PRESENCE_UPDATE,
};
use super::handler::handle_identify;
use super::registry::OUTBOUND_CAPACITY;
use super::session::GatewaySession;

/// Close codes (4000-range for application-level).
const CLOSE_UNKNOWN_ERROR: u16 = 4000;
const CLOSE_UNKNOWN_OPCODE: u16 = 4001;
const CLOSE_DECODE_ERROR: u16 = 4002;
const CLOSE_NOT_AUTHENTICATED: u16 = 4003;
const CLOSE_AUTH_FAILED: u16 = 4004;
const CLOSE_SESSION_TIMEOUT: u16 = 4009;

/// Timeout for receiving IDENTIFY after connection (seconds).
const IDENTIFY_TIMEOUT_SECS: u64 = 10;

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

pub fn router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let connection_id = prefixed_ulid(prefix::CONNECTION);
    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    relay(
        &state,
        RelayEvent::Connected {
            connection_id: connection_id.clone(),
            sender: Some(out_tx),
        },
    )
    .await;

    let (mut ws_tx, mut ws_rx) = socket.split();

    match await_identify(&mut ws_rx).await {
        Ok(payload) => {
            established(&state, &connection_id, payload, ws_tx, ws_rx, out_rx).await;
        }
        Err((code, reason)) => {
            tracing::debug!(connection_id = %connection_id, %reason, "initial handshake failed");
            let _ = send_close(&mut ws_tx, code, reason).await;
        }
    }

    if let Some(info) = state.relay.registry().connection_info(&connection_id) {
        tracing::info!(
            connection_id = %info.connection_id,
            user_id = info.user_id.as_deref().unwrap_or("-"),
            connected_for_secs = (Utc::now() - info.connected_at).num_seconds(),
            idle_for_ms = info.idle_for.as_millis() as u64,
            "gateway session closed"
        );
    }

    relay(
        &state,
        RelayEvent::Disconnected {
            connection_id: connection_id.clone(),
        },
    )
    .await;
}

/// Wait for IDENTIFY within the timeout.
async fn await_identify(ws_rx: &mut WsStream) -> Result<IdentifyPayload, (u16, &'static str)> {
    let result = time::timeout(Duration::from_secs(IDENTIFY_TIMEOUT_SECS), async {
        while let Some(msg) = ws_rx.next().await {
            let text = match msg {
                Ok(Message::Text(t)) => t,
                Ok(Message::Close(_)) => return Err((CLOSE_UNKNOWN_ERROR, "client closed")),
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(?e, "ws read error during identify");
                    return Err((CLOSE_UNKNOWN_ERROR, "read error"));
                }
            };

            let client_msg: ClientMessage = serde_json::from_str(&text)
                .map_err(|_| (CLOSE_DECODE_ERROR, "Invalid JSON"))?;

            match client_msg.op {
                OP_IDENTIFY => {
                    return serde_json::from_value(client_msg.d)
                        .map_err(|_| (CLOSE_DECODE_ERROR, "Invalid identify payload"));
                }
                // Heartbeats before IDENTIFY are tolerated but not acknowledged.
                OP_HEARTBEAT => continue,
                _ => return Err((CLOSE_NOT_AUTHENTICATED, "Expected IDENTIFY")),
            }
        }
        Err((CLOSE_UNKNOWN_ERROR, "connection closed before identify"))
    })
    .await;

    result.unwrap_or(Err((CLOSE_SESSION_TIMEOUT, "Handshake timeout")))
}

/// IDENTIFY succeeded at the protocol level: resolve the ticket, register
/// the connection, send READY, and run the session.
async fn established(
    state: &AppState,
    connection_id: &str,
    payload: IdentifyPayload,
    mut ws_tx: WsSink,
    ws_rx: WsStream,
    out_rx: mpsc::Receiver<Dispatch>,
) {
    let (session, ready_msg) = match handle_identify(state, connection_id, payload).await {
        Ok(result) => result,
        Err(reason) => {
            tracing::debug!(connection_id, %reason, "identify handler failed");
            let _ = send_close(&mut ws_tx, CLOSE_AUTH_FAILED, reason).await;
            return;
        }
    };

    // Registered before READY so the client is reachable once it sees READY.
    relay(
        state,
        RelayEvent::Registered {
            connection_id: session.connection_id.clone(),
            user_id: session.user_id.clone(),
        },
    )
    .await;

    tracing::info!(
        connection_id = %session.connection_id,
        user_id = %session.user_id,
        "gateway session established"
    );

    if send_message(&mut ws_tx, &ready_msg).await.is_err() {
        return;
    }

    run_session(state, &session, ws_tx, ws_rx, out_rx).await;

    tracing::info!(
        connection_id = %session.connection_id,
        user_id = %session.user_id,
        "gateway session ended"
    );
}

/// Main session event loop: read client messages, forward dispatches,
/// enforce heartbeat.
async fn run_session(
    state: &AppState,
    session: &GatewaySession,
    mut ws_tx: WsSink,
    mut ws_rx: WsStream,
    mut out_rx: mpsc::Receiver<Dispatch>,
) {
    // Heartbeat deadline: client must heartbeat within 1.5× the interval.
    let heartbeat_deadline = state.config.presence.heartbeat_interval * 3 / 2;
    let mut heartbeat_timer = time::interval(heartbeat_deadline);
    heartbeat_timer.tick().await; // First tick fires immediately; skip it.
    let mut got_heartbeat = true;

    loop {
        tokio::select! {
            // Client sends us a message.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let client_msg: ClientMessage = match serde_json::from_str(&text) {
                            Ok(m) => m,
                            Err(_) => {
                                let _ = send_close(&mut ws_tx, CLOSE_DECODE_ERROR, "Invalid JSON").await;
                                break;
                            }
                        };

                        match client_msg.op {
                            OP_HEARTBEAT => {
                                got_heartbeat = true;
                                let payload: HeartbeatPayload =
                                    serde_json::from_value(client_msg.d).unwrap_or_default();
                                relay(state, RelayEvent::Heartbeat {
                                    connection_id: session.connection_id.clone(),
                                }).await;
                                let ack = GatewayMessage::heartbeat_ack(payload.seq);
                                if send_message(&mut ws_tx, &ack).await.is_err() {
                                    break;
                                }
                            }
                            OP_PRESENCE_UPDATE => {
                                let payload: PresenceUpdatePayload = match serde_json::from_value(client_msg.d) {
                                    Ok(p) => p,
                                    Err(_) => {
                                        let _ = send_close(&mut ws_tx, CLOSE_DECODE_ERROR, "Invalid presence payload").await;
                                        break;
                                    }
                                };
                                if payload.status == PresenceStatus::Offline {
                                    tracing::debug!(connection_id = %session.connection_id, "ignoring client-requested offline");
                                    continue;
                                }
                                relay(state, RelayEvent::PresenceUpdate {
                                    user_id: session.user_id.clone(),
                                    status: payload.status,
                                }).await;
                            }
                            OP_IDENTIFY => {
                                let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_ERROR, "Already identified").await;
                                break;
                            }
                            _ => {
                                let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_OPCODE, "Unknown opcode").await;
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(?e, connection_id = %session.connection_id, "ws read error");
                        break;
                    }
                }
            }

            // Event queued for this connection.
            dispatch = out_rx.recv() => {
                let Some(dispatch) = dispatch else {
                    // Registry dropped us (liveness eviction).
                    let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Session evicted").await;
                    break;
                };
                let seq = session.next_seq();
                let msg = GatewayMessage::dispatch(dispatch.event_name, seq, dispatch.data);
                if send_message(&mut ws_tx, &msg).await.is_err() {
                    break;
                }
            }

            // Heartbeat timeout check.
            _ = heartbeat_timer.tick() => {
                if !got_heartbeat {
                    tracing::debug!(
                        connection_id = %session.connection_id,
                        "heartbeat timeout, closing connection"
                    );
                    let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "Heartbeat timeout").await;
                    break;
                }
                got_heartbeat = false;
            }
        }
    }
}

/// Feed an event to the relay. Lifecycle events only schedule work, so
/// this never blocks the socket on a store call.
async fn relay(state: &AppState, event: RelayEvent) {
    if let Err(e) = state.relay.handle(event).await {
        tracing::warn!(error = %e, "relay event failed");
    }
}

async fn send_message(ws_tx: &mut WsSink, msg: &GatewayMessage) -> Result<(), axum::Error> {
    let json = serde_json::to_string(msg).map_err(axum::Error::new)?;
    ws_tx.send(Message::Text(json.into())).await
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(ws_tx: &mut WsSink, code: u16, reason: &str) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
