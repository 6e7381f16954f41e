//! Error types shared by the broker and the agent.
//!
//! Errors are named by their protocol semantics rather than by the Rust type
//! that produced them: the `kind` decides the wire code sent in `auth_error`
//! frames, the HTTP status shown to public clients, and whether the agent
//! should retry.

use std::fmt;

use crate::protocol::CodecError;

/// Semantic error kinds of the relay protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Token not found in the domain store.
    AuthFailed,
    /// The record exists but is disabled (or not in HTTP mode).
    TunnelDisabled,
    /// Another agent holds the domain and the bind was not forced.
    AlreadyConnected,
    /// The agent stopped answering pings.
    HeartbeatTimeout,
    /// Bad frame, wrong ordering, or an oversized frame.
    Protocol,
    /// Control-channel I/O failure.
    Transport,
    /// A forwarded request ran past its deadline.
    RequestTimeout,
    /// The agent could not reach its local target.
    TargetUnavailable,
    /// The owning session closed while the request was in flight.
    SessionClosed,
    /// No agent is bound for the requested domain.
    DomainUnavailable,
    /// The domain (or record) a caller named does not exist.
    NotFound,
    /// A uniqueness constraint was violated (domain already registered).
    Conflict,
    /// Broker-side fault (store failure, poisoned state).
    Internal,
}

impl ErrorKind {
    /// Wire code carried in `auth_error` frames and API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::AuthFailed => "auth_failed",
            ErrorKind::TunnelDisabled => "tunnel_disabled",
            ErrorKind::AlreadyConnected => "already_connected",
            ErrorKind::HeartbeatTimeout => "heartbeat_timeout",
            ErrorKind::Protocol => "protocol_error",
            ErrorKind::Transport => "transport_error",
            ErrorKind::RequestTimeout => "request_timeout",
            ErrorKind::TargetUnavailable => "target_unavailable",
            ErrorKind::SessionClosed => "session_closed",
            ErrorKind::DomainUnavailable => "domain_unavailable",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Internal => "internal_error",
        }
    }

    /// HTTP status surfaced to the public client for this kind.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::AuthFailed => 401,
            ErrorKind::TunnelDisabled => 403,
            ErrorKind::AlreadyConnected => 409,
            ErrorKind::HeartbeatTimeout => 504,
            ErrorKind::Protocol => 400,
            ErrorKind::Transport => 502,
            ErrorKind::RequestTimeout => 504,
            ErrorKind::TargetUnavailable => 503,
            ErrorKind::SessionClosed => 502,
            ErrorKind::DomainUnavailable => 502,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Internal => 500,
        }
    }

    /// Whether an agent seeing this error should reconnect.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::HeartbeatTimeout
                | ErrorKind::Transport
                | ErrorKind::RequestTimeout
                | ErrorKind::SessionClosed
        )
    }

    /// Rejections that end the agent instead of feeding its backoff.
    pub fn is_permanent_reject(&self) -> bool {
        matches!(
            self,
            ErrorKind::AuthFailed | ErrorKind::TunnelDisabled | ErrorKind::AlreadyConnected
        )
    }

    /// Resolve a wire code back to its kind; `None` for codes this version
    /// does not know.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "auth_failed" => Some(ErrorKind::AuthFailed),
            "tunnel_disabled" => Some(ErrorKind::TunnelDisabled),
            "already_connected" => Some(ErrorKind::AlreadyConnected),
            "heartbeat_timeout" => Some(ErrorKind::HeartbeatTimeout),
            "protocol_error" => Some(ErrorKind::Protocol),
            "transport_error" => Some(ErrorKind::Transport),
            "request_timeout" => Some(ErrorKind::RequestTimeout),
            "target_unavailable" => Some(ErrorKind::TargetUnavailable),
            "session_closed" => Some(ErrorKind::SessionClosed),
            "domain_unavailable" => Some(ErrorKind::DomainUnavailable),
            "not_found" => Some(ErrorKind::NotFound),
            "conflict" => Some(ErrorKind::Conflict),
            "internal_error" => Some(ErrorKind::Internal),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A tunnel error: a semantic kind plus a human-readable message.
#[derive(Debug)]
pub struct TunnelError {
    pub kind: ErrorKind,
    pub message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TunnelError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Attach the underlying cause.
    pub fn with_source<E: std::error::Error + Send + Sync + 'static>(mut self, source: E) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthFailed, message)
    }

    pub fn tunnel_disabled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TunnelDisabled, message)
    }

    pub fn already_connected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyConnected, message)
    }

    pub fn heartbeat_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::HeartbeatTimeout, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    pub fn request_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RequestTimeout, message)
    }

    pub fn target_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TargetUnavailable, message)
    }

    pub fn session_closed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SessionClosed, message)
    }

    pub fn domain_unavailable(domain: &str) -> Self {
        Self::new(
            ErrorKind::DomainUnavailable,
            format!("no agent connected for domain '{domain}'"),
        )
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl fmt::Display for TunnelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)?;
        if let Some(ref source) = self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl std::error::Error for TunnelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<CodecError> for TunnelError {
    fn from(err: CodecError) -> Self {
        TunnelError::protocol(err.to_string()).with_source(err)
    }
}

/// Result alias used throughout the broker and agent.
pub type TunnelResult<T> = Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_wire_names() {
        assert_eq!(ErrorKind::AuthFailed.code(), "auth_failed");
        assert_eq!(ErrorKind::Protocol.code(), "protocol_error");
        assert_eq!(ErrorKind::SessionClosed.code(), "session_closed");
    }

    #[test]
    fn codes_round_trip() {
        for kind in [
            ErrorKind::AuthFailed,
            ErrorKind::TunnelDisabled,
            ErrorKind::AlreadyConnected,
            ErrorKind::HeartbeatTimeout,
            ErrorKind::Protocol,
            ErrorKind::Transport,
            ErrorKind::RequestTimeout,
            ErrorKind::TargetUnavailable,
            ErrorKind::SessionClosed,
            ErrorKind::DomainUnavailable,
            ErrorKind::NotFound,
            ErrorKind::Conflict,
            ErrorKind::Internal,
        ] {
            assert_eq!(ErrorKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(ErrorKind::from_code("connection_exists"), None);
    }

    #[test]
    fn http_statuses() {
        assert_eq!(ErrorKind::DomainUnavailable.http_status(), 502);
        assert_eq!(ErrorKind::RequestTimeout.http_status(), 504);
        assert_eq!(ErrorKind::TargetUnavailable.http_status(), 503);
    }

    #[test]
    fn permanent_rejects_do_not_retry() {
        for kind in [
            ErrorKind::AuthFailed,
            ErrorKind::TunnelDisabled,
            ErrorKind::AlreadyConnected,
        ] {
            assert!(kind.is_permanent_reject());
            assert!(!kind.is_retryable());
        }
        assert!(ErrorKind::Transport.is_retryable());
    }

    #[test]
    fn display_includes_kind_and_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = TunnelError::target_unavailable("dial failed").with_source(io);
        let text = err.to_string();
        assert!(text.contains("[target_unavailable]"));
        assert!(text.contains("dial failed"));
        assert!(text.contains("refused"));
    }
}
