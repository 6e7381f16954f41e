//! Broker-side agent session: one accepted control channel.
//!
//! Lifecycle: AwaitingAuth → Authenticated → Closing → Closed. While
//! authenticated, two pumps share the loop below: the reader demultiplexes
//! inbound frames, the heartbeater pings on an interval and declares the
//! session dead after 2.5 silent intervals. All outbound frames funnel
//! through one mpsc queue drained by a single writer task, so concurrent
//! producers never interleave mid-frame.

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use tunely_core::{decode, encode, CodecError, Message, TunnelError};

use crate::pending::UnaryResponse;
use crate::registry::ActiveConnection;
use crate::server::AppState;

/// Why a session left the authenticated state.
enum CloseReason {
    Preempted,
    HeartbeatTimeout,
    Protocol(String),
    Transport(String),
    AgentClosed,
}

impl CloseReason {
    fn code(&self) -> &'static str {
        match self {
            CloseReason::Preempted => "session_preempted",
            CloseReason::HeartbeatTimeout => "heartbeat_timeout",
            CloseReason::Protocol(_) => "protocol_error",
            CloseReason::Transport(_) => "transport_error",
            CloseReason::AgentClosed => "agent_closed",
        }
    }

    fn detail(&self) -> Option<&str> {
        match self {
            CloseReason::Protocol(detail) | CloseReason::Transport(detail) => Some(detail),
            _ => None,
        }
    }
}

struct AuthFrame {
    token: String,
    force: bool,
    client_version: Option<String>,
}

/// Drive one accepted control channel to completion.
pub async fn run_session(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let auth = match await_auth(&mut ws_rx, &state).await {
        Ok(auth) => auth,
        Err((code, error)) => {
            warn!(code, %error, "agent rejected during authentication");
            reject(&mut ws_tx, code, &error).await;
            return;
        }
    };

    let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
    let (conn, record) = match state
        .registry
        .bind(&state.store, &auth.token, auth.force, out_tx)
        .await
    {
        Ok(bound) => bound,
        Err(err) => {
            warn!(code = err.kind.code(), "bind rejected: {}", err.message);
            reject(&mut ws_tx, err.kind.code(), &err.message).await;
            return;
        }
    };

    let auth_ok = Message::AuthOk {
        domain: record.domain.clone(),
        tunnel_id: record.tunnel_id.clone(),
        server_version: Some(env!("CARGO_PKG_VERSION").to_string()),
    };
    if send_frame(&mut ws_tx, &auth_ok).await.is_err() {
        state.registry.unbind(&conn);
        return;
    }

    info!(
        domain = %record.domain,
        conn = %conn.conn_id,
        client_version = auth.client_version.as_deref().unwrap_or("unknown"),
        "agent authenticated"
    );

    // Single writer: the only task that touches the sink from here on.
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let raw = match encode(&message) {
                Ok(raw) => raw,
                Err(err) => {
                    warn!("failed to encode outbound frame: {}", err);
                    break;
                }
            };
            if ws_tx.send(WsMessage::Text(raw)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let reason = pump(&mut ws_rx, &conn, &state).await;

    // Closing: unregister (if still owner), fail owned entries, stop writer.
    state.registry.unbind(&conn);
    state
        .pending
        .fail_all_owned_by(conn.conn_id, || TunnelError::session_closed("session closed"));
    writer.abort();

    info!(
        domain = %conn.domain,
        conn = %conn.conn_id,
        reason = reason.code(),
        detail = reason.detail().unwrap_or(""),
        "session closed"
    );
}

/// AwaitingAuth: accept exactly one frame, which must be `auth`.
async fn await_auth(
    ws_rx: &mut SplitStream<WebSocket>,
    state: &AppState,
) -> Result<AuthFrame, (&'static str, String)> {
    let frame = tokio::time::timeout(state.config.auth_timeout(), ws_rx.next())
        .await
        .map_err(|_| ("auth_timeout", "authentication timeout".to_string()))?
        .ok_or_else(|| {
            (
                "protocol_error",
                "connection closed before authentication".to_string(),
            )
        })?
        .map_err(|e| ("protocol_error", format!("websocket error: {e}")))?;

    let raw = match frame {
        WsMessage::Text(raw) => raw,
        WsMessage::Binary(bytes) => String::from_utf8(bytes)
            .map_err(|_| ("protocol_error", "non-UTF-8 auth frame".to_string()))?,
        _ => {
            return Err((
                "protocol_error",
                "expected an auth message as the first frame".to_string(),
            ))
        }
    };

    match decode(&raw, state.config.max_frame_bytes) {
        Ok(Message::Auth {
            token,
            client_version,
            force,
        }) => Ok(AuthFrame {
            token,
            force,
            client_version,
        }),
        Ok(other) => Err((
            "protocol_error",
            format!("expected auth, got {}", other.type_tag()),
        )),
        Err(err) => Err(("protocol_error", err.to_string())),
    }
}

/// Authenticated: reader and heartbeater multiplexed on one loop.
async fn pump(
    ws_rx: &mut SplitStream<WebSocket>,
    conn: &ActiveConnection,
    state: &AppState,
) -> CloseReason {
    let mut heartbeat = tokio::time::interval(state.config.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of an interval fires immediately; consume it so pings
    // start one full interval after authentication.
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = conn.wait_preempted() => return CloseReason::Preempted,

            _ = heartbeat.tick() => {
                if conn.since_last_alive() > state.config.heartbeat_grace() {
                    return CloseReason::HeartbeatTimeout;
                }
                if conn.send(Message::ping()).await.is_err() {
                    return CloseReason::Transport("writer is gone".to_string());
                }
            }

            frame = ws_rx.next() => {
                let raw = match frame {
                    Some(Ok(WsMessage::Text(raw))) => raw,
                    Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(raw) => raw,
                        Err(_) => return CloseReason::Protocol("non-UTF-8 frame".to_string()),
                    },
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {
                        conn.mark_alive();
                        continue;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => return CloseReason::AgentClosed,
                    Some(Err(e)) => return CloseReason::Transport(e.to_string()),
                };
                if let Some(reason) = dispatch(&raw, conn, state).await {
                    return reason;
                }
            }
        }
    }
}

/// Route one inbound frame. Returns a close reason for fatal frames.
async fn dispatch(raw: &str, conn: &ActiveConnection, state: &AppState) -> Option<CloseReason> {
    let message = match decode(raw, state.config.max_frame_bytes) {
        Ok(message) => message,
        Err(CodecError::UnknownType(tag)) => {
            warn!(domain = %conn.domain, %tag, "dropping frame of unknown type");
            return None;
        }
        Err(err) => return Some(CloseReason::Protocol(err.to_string())),
    };

    conn.mark_alive();

    match message {
        Message::Pong { .. } => {}
        Message::Ping { .. } => {
            // Either side may initiate heartbeat; answer through the writer.
            if conn.send(Message::pong()).await.is_err() {
                return Some(CloseReason::Transport("writer is gone".to_string()));
            }
        }
        Message::Response {
            id,
            status,
            headers,
            body,
            error,
            duration_ms,
            ..
        } => {
            state.pending.deliver_response(
                &id,
                UnaryResponse {
                    status,
                    headers,
                    body,
                    error,
                    duration_ms,
                },
            );
        }
        Message::StreamStart {
            id, status, headers, ..
        } => {
            state.pending.deliver_stream_start(&id, status, headers);
        }
        Message::StreamChunk {
            id, data, sequence, ..
        } => {
            // May block on a full chunk queue; that back-pressure is how a
            // slow public client throttles the agent.
            state.pending.deliver_stream_chunk(&id, data, sequence).await;
        }
        Message::StreamEnd {
            id,
            error,
            duration_ms,
            total_chunks,
            ..
        } => {
            state
                .pending
                .deliver_stream_end(&id, error, duration_ms, total_chunks)
                .await;
        }
        other => {
            debug!(domain = %conn.domain, tag = other.type_tag(), "unexpected frame");
            return Some(CloseReason::Protocol(format!(
                "unexpected {} frame from agent",
                other.type_tag()
            )));
        }
    }
    None
}

async fn send_frame(
    ws_tx: &mut SplitSink<WebSocket, WsMessage>,
    message: &Message,
) -> Result<(), ()> {
    let raw = encode(message).map_err(|_| ())?;
    ws_tx.send(WsMessage::Text(raw)).await.map_err(|_| ())
}

async fn reject(ws_tx: &mut SplitSink<WebSocket, WsMessage>, code: &str, error: &str) {
    let frame = Message::AuthError {
        error: error.to_string(),
        code: code.to_string(),
    };
    let _ = send_frame(ws_tx, &frame).await;
    let _ = ws_tx.close().await;
}
