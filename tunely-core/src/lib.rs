//! Core types and wire protocol for the Tunely tunneling service.
//!
//! This crate holds what the broker (`tunely-server`) and the agent
//! (`tunely-client`) must agree on: the framed JSON message protocol, body
//! encoding rules, and the shared error vocabulary.

pub mod error;
pub mod protocol;

pub use error::{ErrorKind, TunnelError, TunnelResult};
pub use protocol::{
    decode, encode, encode_body, is_text_content_type, now_timestamp, CodecError, Headers,
    Message, DEFAULT_MAX_FRAME_BYTES, EVENT_STREAM_CONTENT_TYPE,
};
