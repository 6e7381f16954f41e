//! Agent connect loop and control-channel session.
//!
//! One active control channel at a time: dial, authenticate, then pump
//! inbound frames. Transport failures and transient rejects reconnect with
//! exponential backoff; permanent rejects exit. A single writer task drains
//! the outbound queue shared by the executors and the pong replies.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};
use tunely_core::{decode, encode, CodecError, ErrorKind, Message};

use crate::backoff::Backoff;
use crate::config::ClientConfig;
use crate::executor::{self, InboundRequest};
use crate::target::TargetUrl;

/// How a session ended, as seen by the reconnect loop.
enum SessionEnd {
    /// User-initiated stop; in-flight requests are abandoned.
    Stopped,
    /// Authenticated, then the channel was lost.
    Lost(String),
    /// The broker answered `auth_error`.
    Rejected { code: String, error: String },
}

/// Run the agent until it is stopped or permanently rejected.
pub async fn run(config: ClientConfig) -> Result<()> {
    let target = TargetUrl::parse(&config.target_url)?;
    let mut backoff = Backoff::new(
        config.reconnect_base(),
        config.reconnect_max(),
        config.reconnect_factor_cap,
    );

    loop {
        match run_session(&config, &target).await {
            Ok(SessionEnd::Stopped) => {
                info!("Shutting down");
                return Ok(());
            }
            Ok(SessionEnd::Lost(reason)) => {
                warn!("Connection lost: {}", reason);
                // The session authenticated, so the factor restarts at one.
                backoff.reset();
                backoff.record_reconnect();
            }
            Ok(SessionEnd::Rejected { code, error }) => {
                let permanent = ErrorKind::from_code(&code)
                    .map(|kind| kind.is_permanent_reject())
                    .unwrap_or(false);
                // `already_connected` is only final when we are not allowed
                // to preempt; a forcing agent retries the race.
                if permanent && !(code == "already_connected" && config.force) {
                    if code == "already_connected" {
                        bail!(
                            "another agent is connected for this domain; \
                             rerun with --force to preempt it"
                        );
                    }
                    bail!("rejected by server ({code}): {error}");
                }
                warn!("Authentication rejected ({}): {}", code, error);
                backoff.record_reject();
            }
            Err(err) => {
                warn!("Connection failed: {:#}", err);
                backoff.record_reconnect();
            }
        }

        let delay = backoff.delay();
        info!(
            "Reconnecting in {:.1}s (attempt {})",
            delay.as_secs_f64(),
            backoff.attempts()
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                return Ok(());
            }
        }
    }
}

async fn run_session(config: &ClientConfig, target: &TargetUrl) -> Result<SessionEnd> {
    info!("Connecting to {}", config.server_url);
    let (ws, _) = connect_async(&config.server_url)
        .await
        .context("websocket connect failed")?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    let auth = Message::auth(config.token.clone(), config.force);
    ws_tx
        .send(WsMessage::Text(encode(&auth)?))
        .await
        .context("failed to send auth")?;

    let reply = tokio::time::timeout(Duration::from_secs(30), ws_rx.next())
        .await
        .context("timed out waiting for the auth reply")?
        .ok_or_else(|| anyhow!("connection closed during authentication"))?
        .context("websocket error during authentication")?;
    let raw = match reply {
        WsMessage::Text(raw) => raw,
        WsMessage::Binary(bytes) => {
            String::from_utf8(bytes).context("non-UTF-8 auth reply")?
        }
        other => bail!("unexpected auth reply frame: {other:?}"),
    };

    let domain = match decode(&raw, config.max_frame_bytes)? {
        Message::AuthOk {
            domain, tunnel_id, ..
        } => {
            info!("Tunnel is live: domain={} (tunnel {})", domain, tunnel_id);
            info!("Forwarding to {}", config.target_url);
            domain
        }
        Message::AuthError { error, code } => {
            return Ok(SessionEnd::Rejected { code, error })
        }
        other => bail!("unexpected {} frame during authentication", other.type_tag()),
    };

    // Outbound queue with a single consumer; executors, pong replies and
    // nothing else write frames.
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(128);
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let raw = match encode(&message) {
                Ok(raw) => raw,
                Err(err) => {
                    warn!("failed to encode outbound frame: {}", err);
                    continue;
                }
            };
            if ws_tx.send(WsMessage::Text(raw)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let end = loop {
        tokio::select! {
            _ = &mut shutdown => break SessionEnd::Stopped,

            frame = ws_rx.next() => {
                let raw = match frame {
                    Some(Ok(WsMessage::Text(raw))) => raw,
                    Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(raw) => raw,
                        Err(_) => {
                            warn!("dropping non-UTF-8 frame");
                            continue;
                        }
                    },
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {
                        continue
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        break SessionEnd::Lost("server closed the connection".to_string())
                    }
                    Some(Err(err)) => break SessionEnd::Lost(err.to_string()),
                };
                handle_frame(&raw, config, target, &out_tx).await;
            }
        }
    };

    writer.abort();
    if matches!(end, SessionEnd::Lost(_)) {
        debug!(%domain, "session lost, will reconnect");
    }
    Ok(end)
}

/// Dispatch one inbound frame. Requests each get their own executor task so
/// a slow target never blocks the channel reader.
async fn handle_frame(
    raw: &str,
    config: &ClientConfig,
    target: &TargetUrl,
    out_tx: &mpsc::Sender<Message>,
) {
    match decode(raw, config.max_frame_bytes) {
        Ok(Message::Ping { .. }) => {
            let _ = out_tx.send(Message::pong()).await;
        }
        Ok(Message::Pong { .. }) => {}
        Ok(Message::Request {
            id,
            method,
            path,
            headers,
            body,
            timeout,
            ..
        }) => {
            let request = InboundRequest {
                id,
                method,
                path,
                headers,
                body,
                timeout,
            };
            let target = target.clone();
            let out_tx = out_tx.clone();
            let default_timeout = config.request_timeout();
            tokio::spawn(async move {
                executor::execute(request, &target, &out_tx, default_timeout).await;
            });
        }
        Ok(other) => debug!("ignoring {} frame from server", other.type_tag()),
        Err(CodecError::UnknownType(tag)) => {
            warn!("dropping frame of unknown type '{}'", tag)
        }
        Err(err) => warn!("invalid frame from server: {}", err),
    }
}
