//! Wire protocol for the broker ⇄ agent control channel.
//!
//! One JSON message per WebSocket frame, discriminated by a `type` field.
//! Unknown fields are ignored on receive; unknown `type` values surface as
//! [`CodecError::UnknownType`] so the session can log and drop the frame
//! without tearing down the channel.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default upper bound for a single control-channel frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Content-Type prefix that switches the agent into stream mode.
pub const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";

/// The `type` tags this protocol version understands.
const KNOWN_TYPES: [&str; 10] = [
    "auth",
    "auth_ok",
    "auth_error",
    "request",
    "response",
    "stream_start",
    "stream_chunk",
    "stream_end",
    "ping",
    "pong",
];

/// Header map carried on the wire. Keys are compared case-insensitively by
/// consumers; duplicate names collapse to the last value at conversion time.
pub type Headers = HashMap<String, String>;

/// A control-channel message.
///
/// The broker originates `request` and `ping`; the agent originates `auth`,
/// `response`, the `stream_*` triple and `pong`. Either side may answer the
/// other's `ping`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Auth {
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_version: Option<String>,
        #[serde(default)]
        force: bool,
    },
    AuthOk {
        domain: String,
        tunnel_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_version: Option<String>,
    },
    AuthError {
        error: String,
        #[serde(default = "default_auth_error_code")]
        code: String,
    },
    Request {
        id: String,
        method: String,
        path: String,
        #[serde(default)]
        headers: Headers,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
    Response {
        id: String,
        status: u16,
        #[serde(default)]
        headers: Headers,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
    StreamStart {
        id: String,
        status: u16,
        #[serde(default)]
        headers: Headers,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
    StreamChunk {
        id: String,
        data: String,
        #[serde(default)]
        sequence: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
    StreamEnd {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_chunks: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
}

fn default_auth_error_code() -> String {
    "auth_failed".to_string()
}

impl Message {
    /// Create an auth message carrying this crate's version.
    pub fn auth(token: impl Into<String>, force: bool) -> Self {
        Message::Auth {
            token: token.into(),
            client_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            force,
        }
    }

    /// Create a ping message stamped with the current time.
    pub fn ping() -> Self {
        Message::Ping {
            timestamp: Some(now_timestamp()),
        }
    }

    /// Create a pong message stamped with the current time.
    pub fn pong() -> Self {
        Message::Pong {
            timestamp: Some(now_timestamp()),
        }
    }

    /// The wire tag of this message.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Message::Auth { .. } => "auth",
            Message::AuthOk { .. } => "auth_ok",
            Message::AuthError { .. } => "auth_error",
            Message::Request { .. } => "request",
            Message::Response { .. } => "response",
            Message::StreamStart { .. } => "stream_start",
            Message::StreamChunk { .. } => "stream_chunk",
            Message::StreamEnd { .. } => "stream_end",
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
        }
    }
}

/// Codec failures, split so the session can distinguish frames that close
/// the channel from frames that are merely dropped.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The frame exceeds the configured size limit. Closes the session.
    #[error("frame of {got} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { got: usize, limit: usize },
    /// The `type` tag is not part of this protocol version. Logged, dropped.
    #[error("unknown message type: {0}")]
    UnknownType(String),
    /// The frame is not valid JSON or does not match its schema. Closes the
    /// session.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Encode a message into a single text frame.
pub fn encode(message: &Message) -> Result<String, CodecError> {
    Ok(serde_json::to_string(message)?)
}

/// Decode a single text frame into a message, enforcing the frame size
/// limit. A frame of exactly `max_frame_bytes` is accepted.
pub fn decode(raw: &str, max_frame_bytes: usize) -> Result<Message, CodecError> {
    if raw.len() > max_frame_bytes {
        return Err(CodecError::FrameTooLarge {
            got: raw.len(),
            limit: max_frame_bytes,
        });
    }

    let value: serde_json::Value = serde_json::from_str(raw)?;
    let tag = value
        .get("type")
        .and_then(|t| t.as_str())
        .map(str::to_string);

    match serde_json::from_value::<Message>(value) {
        Ok(message) => Ok(message),
        Err(err) => match tag {
            Some(tag) if !KNOWN_TYPES.contains(&tag.as_str()) => Err(CodecError::UnknownType(tag)),
            _ => Err(CodecError::Malformed(err)),
        },
    }
}

/// ISO-8601 timestamp for the optional `timestamp` message fields.
pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Whether a Content-Type transports a textual body.
///
/// Text bodies travel verbatim; anything else is Base64-encoded on the wire
/// (see [`encode_body`]).
pub fn is_text_content_type(content_type: &str) -> bool {
    let main = content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_ascii_lowercase();

    main.starts_with("text/")
        || main == "application/json"
        || main == "application/javascript"
        || main == "application/xml"
        || main == "application/x-www-form-urlencoded"
        || main.ends_with("+json")
        || main.ends_with("+xml")
}

/// Encode an HTTP body for transport as a wire string.
///
/// Textual bodies are carried as UTF-8 (invalid sequences replaced); binary
/// bodies are Base64-encoded. With no Content-Type, valid UTF-8 is treated
/// as text.
pub fn encode_body(bytes: &[u8], content_type: Option<&str>) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    match content_type {
        Some(ct) if is_text_content_type(ct) => String::from_utf8_lossy(bytes).into_owned(),
        Some(_) => STANDARD.encode(bytes),
        None => match std::str::from_utf8(bytes) {
            Ok(text) => text.to_string(),
            Err(_) => STANDARD.encode(bytes),
        },
    }
}
