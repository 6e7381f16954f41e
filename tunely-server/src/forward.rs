//! Forward dispatcher: the public `forward(domain, request)` operation.
//!
//! Serializes one public HTTP request into a `request` frame, dispatches it
//! on the domain's control channel, and awaits the discriminated first
//! reply: a unary `response`, or a `stream_start` that hands back a chunk
//! receiver for the relay. Enforces the per-request deadline and writes one
//! request-log record per completed forward.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};
use tunely_core::{now_timestamp, Headers, Message, TunnelError, TunnelResult};

use crate::pending::{FirstReply, PendingTable, StreamEvent};
use crate::registry::DomainRegistry;
use crate::store::{RequestLog, TunnelStore};

/// Hop-by-hop headers stripped before a request enters the tunnel.
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "host",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "proxy-authorization",
    "proxy-connection",
];

/// Remove hop-by-hop headers, case-insensitively.
pub fn strip_hop_by_hop(headers: &mut Headers) {
    headers.retain(|name, _| {
        !HOP_BY_HOP_HEADERS
            .iter()
            .any(|hop| name.eq_ignore_ascii_case(hop))
    });
}

/// One public request to relay.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: String,
    pub path: String,
    pub headers: Headers,
    pub body: Option<String>,
    pub timeout: Option<f64>,
}

/// Unary result surfaced to the public client.
#[derive(Debug, Serialize)]
pub struct ForwardReply {
    pub status: u16,
    pub headers: Headers,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Streamed result: response head plus the live chunk queue. The HTTP layer
/// drains `events` into the public response body.
#[derive(Debug)]
pub struct ForwardStream {
    pub id: String,
    pub domain: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub headers: Headers,
    pub events: tokio::sync::mpsc::Receiver<StreamEvent>,
    pub started: Instant,
    pub timeout: Duration,
}

#[derive(Debug)]
pub enum ForwardOutcome {
    Unary(ForwardReply),
    Stream(ForwardStream),
}

pub struct ForwardDispatcher {
    registry: Arc<DomainRegistry>,
    pending: Arc<PendingTable>,
    store: TunnelStore,
    default_timeout: Duration,
}

impl ForwardDispatcher {
    pub fn new(
        registry: Arc<DomainRegistry>,
        pending: Arc<PendingTable>,
        store: TunnelStore,
        default_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            pending,
            store,
            default_timeout,
        }
    }

    pub fn pending(&self) -> &Arc<PendingTable> {
        &self.pending
    }

    pub fn store(&self) -> &TunnelStore {
        &self.store
    }

    /// Relay one request through the domain's agent. No retries: a failed
    /// forward surfaces its error to the caller.
    pub async fn forward(
        &self,
        domain: &str,
        request: ForwardRequest,
    ) -> TunnelResult<ForwardOutcome> {
        let conn = self
            .registry
            .lookup(domain)
            .ok_or_else(|| TunnelError::domain_unavailable(domain))?;

        let mut headers = request.headers.clone();
        strip_hop_by_hop(&mut headers);

        let timeout = request
            .timeout
            .filter(|t| t.is_finite() && *t > 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or(self.default_timeout);

        let (id, first_reply) = self.pending.create(conn.conn_id, Instant::now() + timeout);
        debug!(domain, %id, method = %request.method, path = %request.path, "dispatching forward");

        let frame = Message::Request {
            id: id.clone(),
            method: request.method.clone(),
            path: request.path.clone(),
            headers,
            body: request.body.clone(),
            timeout: Some(timeout.as_secs_f64()),
            timestamp: Some(now_timestamp()),
        };

        if let Err(err) = conn.send(frame).await {
            self.pending.cancel(&id, TunnelError::session_closed("session closed"));
            self.log(domain, &request, Some(err.kind.http_status()), Some(&err.message), 0, None)
                .await;
            return Err(err);
        }

        let started = Instant::now();
        let reply = match tokio::time::timeout(timeout, first_reply).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                // The waiter's sender vanished without a verdict; treat it
                // as the owning session going away.
                let err = TunnelError::session_closed("session closed");
                self.log(domain, &request, Some(502), Some("session closed"), elapsed_ms(started), None)
                    .await;
                return Err(err);
            }
            Err(_) => {
                self.pending
                    .cancel(&id, TunnelError::request_timeout("request timeout"));
                self.log(
                    domain,
                    &request,
                    Some(504),
                    Some("request timeout"),
                    timeout.as_millis() as u64,
                    None,
                )
                .await;
                return Err(TunnelError::request_timeout("request timeout"));
            }
        };

        match reply {
            FirstReply::Unary(response) => {
                let duration_ms = elapsed_ms(started);
                if let Err(err) = self.store.increment_requests(domain).await {
                    warn!(domain, "failed to bump request counter: {}", err);
                }
                self.log(
                    domain,
                    &request,
                    Some(response.status),
                    response.error.as_deref(),
                    duration_ms,
                    response.body.as_deref(),
                )
                .await;
                Ok(ForwardOutcome::Unary(ForwardReply {
                    status: response.status,
                    headers: response.headers,
                    body: response.body,
                    duration_ms,
                    error: response.error,
                }))
            }
            FirstReply::Stream(handle) => {
                if let Err(err) = self.store.increment_requests(domain).await {
                    warn!(domain, "failed to bump request counter: {}", err);
                }
                Ok(ForwardOutcome::Stream(ForwardStream {
                    id,
                    domain: domain.to_string(),
                    method: request.method,
                    path: request.path,
                    status: handle.status,
                    headers: handle.headers,
                    events: handle.events,
                    started,
                    timeout,
                }))
            }
            FirstReply::Failed(err) => {
                self.log(
                    domain,
                    &request,
                    Some(err.kind.http_status()),
                    Some(&err.message),
                    elapsed_ms(started),
                    None,
                )
                .await;
                Err(err)
            }
        }
    }

    /// Write the record for a finished stream; called by the relay when the
    /// body completes.
    pub async fn log_stream_end(
        &self,
        stream_meta: (&str, &str, &str),
        status: u16,
        error: Option<&str>,
        duration_ms: u64,
    ) {
        let (domain, method, path) = stream_meta;
        let log = RequestLog::new(
            domain,
            method,
            path,
            Some(status),
            error.map(str::to_string),
            duration_ms,
            None,
            None,
        );
        if let Err(err) = self.store.record_request(log).await {
            warn!(domain, "failed to record stream log: {}", err);
        }
    }

    async fn log(
        &self,
        domain: &str,
        request: &ForwardRequest,
        status: Option<u16>,
        error: Option<&str>,
        duration_ms: u64,
        response_body: Option<&str>,
    ) {
        let log = RequestLog::new(
            domain,
            &request.method,
            &request.path,
            status,
            error.map(str::to_string),
            duration_ms,
            request.body.as_deref(),
            response_body,
        );
        // Logging failures must not affect the forward itself.
        if let Err(err) = self.store.record_request(log).await {
            warn!(domain, "failed to record request log: {}", err);
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::UnaryResponse;
    use crate::store::TunnelMode;
    use tokio::sync::mpsc;
    use tunely_core::ErrorKind;

    struct Harness {
        dispatcher: ForwardDispatcher,
        store: TunnelStore,
        registry: Arc<DomainRegistry>,
        pending: Arc<PendingTable>,
    }

    fn harness() -> Harness {
        let registry = Arc::new(DomainRegistry::new());
        let pending = Arc::new(PendingTable::new(8));
        let store = TunnelStore::memory();
        let dispatcher = ForwardDispatcher::new(
            registry.clone(),
            pending.clone(),
            store.clone(),
            Duration::from_secs(300),
        );
        Harness {
            dispatcher,
            store,
            registry,
            pending,
        }
    }

    async fn bind_agent(h: &Harness, domain: &str) -> mpsc::Receiver<Message> {
        let record = h
            .store
            .create_domain(domain, None, None, TunnelMode::Http)
            .await
            .unwrap();
        let (tx, rx) = mpsc::channel(16);
        h.registry
            .bind(&h.store, &record.token, false, tx)
            .await
            .unwrap();
        rx
    }

    fn request(timeout: Option<f64>) -> ForwardRequest {
        let mut headers = Headers::new();
        headers.insert("Host".to_string(), "public.example".to_string());
        headers.insert("X-Custom".to_string(), "1".to_string());
        ForwardRequest {
            method: "GET".to_string(),
            path: "/ping".to_string(),
            headers,
            body: None,
            timeout,
        }
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut headers = Headers::new();
        for name in ["Host", "CONNECTION", "Transfer-Encoding", "te", "Upgrade"] {
            headers.insert(name.to_string(), "x".to_string());
        }
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("Content-Type"));
    }

    #[tokio::test]
    async fn forward_without_agent_is_domain_unavailable() {
        let h = harness();
        let err = h
            .dispatcher
            .forward("ghost", request(None))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DomainUnavailable);
        assert_eq!(err.kind.http_status(), 502);
    }

    #[tokio::test]
    async fn unary_forward_round_trip() {
        let h = harness();
        let mut agent_rx = bind_agent(&h, "demo").await;

        let pending = h.pending.clone();
        let agent = tokio::spawn(async move {
            let frame = agent_rx.recv().await.unwrap();
            let Message::Request { id, headers, .. } = frame else {
                panic!("expected request frame");
            };
            // Hop-by-hop stripping happened broker-side.
            assert!(!headers.keys().any(|k| k.eq_ignore_ascii_case("host")));
            assert!(headers.contains_key("X-Custom"));
            pending.deliver_response(
                &id,
                UnaryResponse {
                    status: 200,
                    headers: Headers::new(),
                    body: Some("pong".to_string()),
                    error: None,
                    duration_ms: Some(5),
                },
            );
        });

        let outcome = h.dispatcher.forward("demo", request(None)).await.unwrap();
        agent.await.unwrap();

        let ForwardOutcome::Unary(reply) = outcome else {
            panic!("expected unary outcome");
        };
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body.as_deref(), Some("pong"));

        // One log record, and the domain counter moved.
        let (total, logs) = h.store.recent_logs("demo", 10, 0).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(logs[0].status_code, Some(200));
        let record = h.store.lookup_by_domain("demo").await.unwrap().unwrap();
        assert_eq!(record.total_requests, 1);
    }

    #[tokio::test]
    async fn timeout_cancels_entry_and_drops_late_reply() {
        let h = harness();
        let mut agent_rx = bind_agent(&h, "demo").await;

        let err = h
            .dispatcher
            .forward("demo", request(Some(0.05)))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RequestTimeout);
        assert!(h.pending.is_empty());

        // The agent answers late; the reply is dropped silently.
        let Message::Request { id, .. } = agent_rx.recv().await.unwrap() else {
            panic!("expected request frame");
        };
        h.pending.deliver_response(
            &id,
            UnaryResponse {
                status: 200,
                headers: Headers::new(),
                body: None,
                error: None,
                duration_ms: None,
            },
        );
        assert!(h.pending.is_empty());

        let (total, logs) = h.store.recent_logs("demo", 10, 0).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(logs[0].status_code, Some(504));
    }

    #[tokio::test]
    async fn stream_forward_returns_handle() {
        let h = harness();
        let mut agent_rx = bind_agent(&h, "demo").await;

        let pending = h.pending.clone();
        tokio::spawn(async move {
            let Message::Request { id, .. } = agent_rx.recv().await.unwrap() else {
                panic!("expected request frame");
            };
            let mut headers = Headers::new();
            headers.insert(
                "content-type".to_string(),
                "text/event-stream".to_string(),
            );
            pending.deliver_stream_start(&id, 200, headers);
            pending
                .deliver_stream_chunk(&id, "data: 0\n\n".to_string(), 0)
                .await;
            pending.deliver_stream_end(&id, None, Some(3), Some(1)).await;
        });

        let outcome = h.dispatcher.forward("demo", request(None)).await.unwrap();
        let ForwardOutcome::Stream(mut stream) = outcome else {
            panic!("expected stream outcome");
        };
        assert_eq!(stream.status, 200);

        let mut chunks = Vec::new();
        while let Some(event) = stream.events.recv().await {
            match event {
                StreamEvent::Chunk { data, .. } => chunks.push(data),
                StreamEvent::End { total_chunks, .. } => {
                    assert_eq!(total_chunks, Some(1));
                    break;
                }
            }
        }
        assert_eq!(chunks, vec!["data: 0\n\n".to_string()]);
    }
}
