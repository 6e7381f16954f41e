//! HTTP front of the broker: control-channel upgrade endpoint, the public
//! forward endpoint, and the streaming relay that turns a settled stream
//! into a `text/event-stream` response body.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{ws::WebSocketUpgrade, Path, State},
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;
use tunely_core::{Headers, TunnelError};

use crate::config::ServerConfig;
use crate::forward::{ForwardDispatcher, ForwardOutcome, ForwardRequest, ForwardStream};
use crate::pending::{PendingTable, StreamEvent};
use crate::registry::DomainRegistry;
use crate::session;
use crate::store::TunnelStore;

/// Response headers never copied from the relayed head onto the public
/// response; the broker owns framing.
const FRAMING_HEADERS: [&str; 4] = [
    "transfer-encoding",
    "connection",
    "keep-alive",
    "content-length",
];

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub store: TunnelStore,
    pub registry: Arc<DomainRegistry>,
    pub pending: Arc<PendingTable>,
    pub dispatcher: Arc<ForwardDispatcher>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: ServerConfig, store: TunnelStore) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(DomainRegistry::new());
        let pending = Arc::new(PendingTable::new(config.stream_queue_depth));
        let dispatcher = Arc::new(ForwardDispatcher::new(
            registry.clone(),
            pending.clone(),
            store.clone(),
            config.request_timeout(),
        ));
        Self {
            config,
            store,
            registry,
            pending,
            dispatcher,
            started_at: Instant::now(),
        }
    }
}

/// Assemble the full router: control channel, forward endpoint, admin API.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(&state.config.control_path, get(control_channel))
        .route("/api/tunnels/:domain/forward", post(forward))
        .merge(crate::api::router())
        .with_state(state)
}

async fn control_channel(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| session::run_session(socket, state))
}

/// Public forward envelope.
///
/// `body` accepts any JSON value: strings pass through verbatim onto the
/// control channel, other values are serialized to compact JSON first.
#[derive(Debug, Deserialize)]
pub struct ForwardEnvelope {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: serde_json::Value,
    #[serde(default)]
    pub timeout: Option<f64>,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_path() -> String {
    "/".to_string()
}

impl ForwardEnvelope {
    fn into_request(self) -> ForwardRequest {
        let body = match self.body {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s),
            other => Some(other.to_string()),
        };
        ForwardRequest {
            method: self.method,
            path: self.path,
            headers: self.headers,
            body,
            timeout: self.timeout,
        }
    }
}

async fn forward(
    State(state): State<AppState>,
    Path(domain): Path<String>,
    Json(envelope): Json<ForwardEnvelope>,
) -> Response {
    match state
        .dispatcher
        .forward(&domain, envelope.into_request())
        .await
    {
        Ok(ForwardOutcome::Unary(reply)) => Json(reply).into_response(),
        Ok(ForwardOutcome::Stream(stream)) => stream_response(&state, stream),
        Err(err) => error_response(&err),
    }
}

/// Shared JSON error body for forward and admin endpoints.
pub fn error_response(err: &TunnelError) -> Response {
    let status = StatusCode::from_u16(err.kind.http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(serde_json::json!({
            "error": err.message,
            "code": err.kind.code(),
        })),
    )
        .into_response()
}

/// Build the streaming public response: head first, then every chunk as it
/// arrives, ending when the agent's `stream_end` lands. A mid-body failure
/// can only terminate the connection; the status line is already committed.
fn stream_response(state: &AppState, stream: ForwardStream) -> Response {
    let status = StatusCode::from_u16(stream.status).unwrap_or(StatusCode::OK);
    let mut builder = Response::builder().status(status);
    for (name, value) in &stream.headers {
        if FRAMING_HEADERS
            .iter()
            .any(|framing| name.eq_ignore_ascii_case(framing))
        {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            builder = builder.header(name, value);
        }
    }

    let relay = StreamRelay {
        events: stream.events,
        id: stream.id,
        domain: stream.domain,
        method: stream.method,
        path: stream.path,
        status: stream.status,
        started: stream.started,
        timeout: stream.timeout,
        dispatcher: state.dispatcher.clone(),
        finished: false,
    };

    let body = futures_util::stream::unfold(relay, |mut relay| async move {
        match tokio::time::timeout(relay.timeout, relay.events.recv()).await {
            Ok(Some(StreamEvent::Chunk { data, .. })) => {
                Some((Ok::<Bytes, std::io::Error>(Bytes::from(data)), relay))
            }
            Ok(Some(StreamEvent::End {
                error,
                duration_ms,
                ..
            })) => {
                relay.finish(error.as_deref(), duration_ms);
                None
            }
            Ok(None) => {
                // The owning session died mid-stream.
                relay.finish(Some("session_closed"), None);
                None
            }
            Err(_) => {
                relay.finish(Some("request_timeout"), None);
                None
            }
        }
    });

    builder
        .body(Body::from_stream(body))
        .unwrap_or_else(|_| error_response(&TunnelError::internal("failed to build response")))
}

/// Drives one stream body and settles its bookkeeping exactly once, whether
/// the stream ends, times out, or the public client disconnects.
struct StreamRelay {
    events: mpsc::Receiver<StreamEvent>,
    id: String,
    domain: String,
    method: String,
    path: String,
    status: u16,
    started: Instant,
    timeout: Duration,
    dispatcher: Arc<ForwardDispatcher>,
    finished: bool,
}

impl StreamRelay {
    fn finish(&mut self, error: Option<&str>, duration_ms: Option<u64>) {
        if self.finished {
            return;
        }
        self.finished = true;

        // No-op when the entry already completed via stream_end.
        self.dispatcher
            .pending()
            .cancel(&self.id, TunnelError::session_closed("stream relay finished"));

        let duration = duration_ms.unwrap_or_else(|| self.started.elapsed().as_millis() as u64);
        let dispatcher = self.dispatcher.clone();
        let (domain, method, path) = (self.domain.clone(), self.method.clone(), self.path.clone());
        let status = self.status;
        let error = error.map(str::to_string);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                dispatcher
                    .log_stream_end((&domain, &method, &path), status, error.as_deref(), duration)
                    .await;
            });
        }
    }
}

impl Drop for StreamRelay {
    fn drop(&mut self) {
        if !self.finished {
            debug!(id = %self.id, domain = %self.domain, "public client disconnected mid-stream");
            self.finish(Some("client_disconnected"), None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_defaults_and_body_shapes() {
        let envelope: ForwardEnvelope = serde_json::from_str("{}").unwrap();
        assert_eq!(envelope.method, "POST");
        assert_eq!(envelope.path, "/");
        let request = envelope.into_request();
        assert!(request.body.is_none());

        let envelope: ForwardEnvelope =
            serde_json::from_str(r#"{"method":"GET","path":"/ping","body":"raw text"}"#).unwrap();
        assert_eq!(envelope.into_request().body.as_deref(), Some("raw text"));

        let envelope: ForwardEnvelope =
            serde_json::from_str(r#"{"body":{"message":"hi"}}"#).unwrap();
        assert_eq!(
            envelope.into_request().body.as_deref(),
            Some(r#"{"message":"hi"}"#)
        );
    }

    #[test]
    fn framing_headers_are_not_relayed() {
        assert!(FRAMING_HEADERS.contains(&"transfer-encoding"));
        assert!(FRAMING_HEADERS.contains(&"content-length"));
    }
}
