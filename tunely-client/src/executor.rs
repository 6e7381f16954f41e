//! Request executor: performs the local HTTP call for one relayed request
//! and replies on the control channel.
//!
//! A `text/event-stream` Content-Type on the target's response head switches
//! delivery from a single `response` frame to the streamed
//! `stream_start · stream_chunk* · stream_end` sequence. Nothing else is
//! auto-detected; other streaming transports belong to the raw-TCP mode.

use std::fmt::Display;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::HeaderMap;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use tunely_core::{
    encode_body, now_timestamp, Headers, Message, EVENT_STREAM_CONTENT_TYPE,
};

use crate::target::TargetUrl;

/// Fields of one inbound `request` frame.
#[derive(Debug)]
pub struct InboundRequest {
    pub id: String,
    pub method: String,
    pub path: String,
    pub headers: Headers,
    pub body: Option<String>,
    pub timeout: Option<f64>,
}

struct Failure {
    status: u16,
    error: String,
}

impl Failure {
    fn unavailable(detail: impl Display) -> Self {
        Self {
            status: 503,
            error: format!("target unavailable: {detail}"),
        }
    }

    fn timeout() -> Self {
        Self {
            status: 504,
            error: "target timeout".to_string(),
        }
    }
}

/// Execute one relayed request against the local target. Every outcome is
/// reported on the control channel; failures become an error `response`.
pub async fn execute(
    request: InboundRequest,
    target: &TargetUrl,
    outbound: &mpsc::Sender<Message>,
    default_timeout: Duration,
) {
    let started = Instant::now();
    let timeout = request
        .timeout
        .filter(|t| t.is_finite() && *t > 0.0)
        .map(Duration::from_secs_f64)
        .unwrap_or(default_timeout);
    let id = request.id.clone();

    if let Err(failure) = relay(request, target, timeout, outbound, started).await {
        debug!(%id, status = failure.status, "local request failed: {}", failure.error);
        let reply = Message::Response {
            id,
            status: failure.status,
            headers: Headers::new(),
            body: None,
            error: Some(failure.error),
            duration_ms: Some(elapsed_ms(started)),
            timestamp: Some(now_timestamp()),
        };
        let _ = outbound.send(reply).await;
    }
}

async fn relay(
    request: InboundRequest,
    target: &TargetUrl,
    timeout: Duration,
    outbound: &mpsc::Sender<Message>,
    started: Instant,
) -> Result<(), Failure> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(target.authority()))
        .await
        .map_err(|_| Failure::timeout())?
        .map_err(Failure::unavailable)?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(Failure::unavailable)?;
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            debug!("local connection error: {}", err);
        }
    });

    let local_request = build_request(&request, target)?;
    let response = tokio::time::timeout(timeout, sender.send_request(local_request))
        .await
        .map_err(|_| Failure::timeout())?
        .map_err(Failure::unavailable)?;

    let (parts, body) = response.into_parts();
    let headers = collapse_headers(&parts.headers);
    let content_type = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
        .map(|(_, value)| value.clone());
    let status = parts.status.as_u16();

    if content_type.as_deref().is_some_and(is_event_stream) {
        stream_reply(&request.id, status, headers, body, timeout, outbound, started).await;
        Ok(())
    } else {
        unary_reply(
            &request.id,
            status,
            headers,
            body,
            content_type.as_deref(),
            timeout,
            outbound,
            started,
        )
        .await
    }
}

/// The only streaming signal: a Content-Type starting with
/// `text/event-stream`, case-insensitively.
fn is_event_stream(content_type: &str) -> bool {
    content_type
        .trim_start()
        .to_ascii_lowercase()
        .starts_with(EVENT_STREAM_CONTENT_TYPE)
}

#[allow(clippy::too_many_arguments)]
async fn unary_reply(
    id: &str,
    status: u16,
    headers: Headers,
    body: Incoming,
    content_type: Option<&str>,
    timeout: Duration,
    outbound: &mpsc::Sender<Message>,
    started: Instant,
) -> Result<(), Failure> {
    let collected = tokio::time::timeout(timeout, body.collect())
        .await
        .map_err(|_| Failure::timeout())?
        .map_err(|err| Failure::unavailable(format!("reading response body: {err}")))?;
    let bytes = collected.to_bytes();

    let reply = Message::Response {
        id: id.to_string(),
        status,
        headers,
        body: Some(encode_body(&bytes, content_type)),
        error: None,
        duration_ms: Some(elapsed_ms(started)),
        timestamp: Some(now_timestamp()),
    };
    let _ = outbound.send(reply).await;
    Ok(())
}

/// Stream mode: head immediately, then one chunk per non-empty body frame,
/// UTF-8 with replacement, sequence counting from 0.
async fn stream_reply(
    id: &str,
    status: u16,
    headers: Headers,
    mut body: Incoming,
    timeout: Duration,
    outbound: &mpsc::Sender<Message>,
    started: Instant,
) {
    let start = Message::StreamStart {
        id: id.to_string(),
        status,
        headers,
        timestamp: Some(now_timestamp()),
    };
    if outbound.send(start).await.is_err() {
        return;
    }

    let mut sequence: u64 = 0;
    let mut error: Option<String> = None;

    loop {
        match tokio::time::timeout(timeout, body.frame()).await {
            Ok(Some(Ok(frame))) => {
                let Ok(data) = frame.into_data() else {
                    continue; // trailers
                };
                if data.is_empty() {
                    continue;
                }
                let chunk = Message::StreamChunk {
                    id: id.to_string(),
                    data: String::from_utf8_lossy(&data).into_owned(),
                    sequence,
                    timestamp: Some(now_timestamp()),
                };
                // Blocking here is the back-pressure path: a full outbound
                // queue throttles this read loop and, with it, the target.
                if outbound.send(chunk).await.is_err() {
                    return;
                }
                sequence += 1;
            }
            Ok(Some(Err(err))) => {
                error = Some(format!("stream read error: {err}"));
                break;
            }
            Ok(None) => break,
            Err(_) => {
                error = Some("target timeout".to_string());
                break;
            }
        }
    }

    if let Some(ref err) = error {
        warn!(id, "stream ended with error: {}", err);
    }
    let end = Message::StreamEnd {
        id: id.to_string(),
        error,
        duration_ms: Some(elapsed_ms(started)),
        total_chunks: Some(sequence),
        timestamp: Some(now_timestamp()),
    };
    let _ = outbound.send(end).await;
}

fn build_request(
    request: &InboundRequest,
    target: &TargetUrl,
) -> Result<Request<Full<Bytes>>, Failure> {
    let method = Method::from_bytes(request.method.as_bytes())
        .map_err(|_| Failure::unavailable(format!("invalid method '{}'", request.method)))?;

    let mut builder = Request::builder()
        .method(method)
        .uri(target.request_uri(&request.path));

    // Hop-by-hop stripping already happened broker-side; headers pass
    // through unchanged. The local call still needs a Host.
    let mut has_host = false;
    for (name, value) in &request.headers {
        if name.eq_ignore_ascii_case("host") {
            has_host = true;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    if !has_host {
        builder = builder.header("Host", target.authority());
    }

    let body = Full::new(Bytes::from(request.body.clone().unwrap_or_default()));
    builder
        .body(body)
        .map_err(|err| Failure::unavailable(format!("building request: {err}")))
}

/// Collapse a response header map onto the wire shape; duplicate names keep
/// the last value.
fn collapse_headers(map: &HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in map {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_string(), value.to_string());
        }
    }
    headers
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
