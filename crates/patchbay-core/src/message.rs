//! Transport-agnostic WebSocket frame vocabulary.
//!
//! The dispatch layer moves these frames through channels; only the axum
//! integration at the edge converts to and from the transport's own message
//! type. Payloads are `bytes::Bytes` so multicast clones stay cheap.

use crate::close::{CloseCode, CloseFrame};
use bytes::Bytes;

/// One WebSocket frame as seen by handlers and pipelines.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Bytes),
    /// Keepalive probe.
    Ping(Bytes),
    /// Keepalive reply.
    Pong(Bytes),
    /// Close frame, optionally carrying code + reason.
    Close(Option<CloseFrame>),
}

impl Message {
    /// Build a text frame.
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    /// Build a binary frame.
    pub fn binary(value: impl Into<Bytes>) -> Self {
        Self::Binary(value.into())
    }

    /// Build a close frame with a code and reason.
    pub fn close(code: CloseCode, reason: impl Into<String>) -> Self {
        Self::Close(Some(CloseFrame { code, reason: reason.into() }))
    }

    /// Text payload, if this is a text frame.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t),
            _ => None,
        }
    }

    /// True for [`Message::Close`].
    pub fn is_close(&self) -> bool {
        matches!(self, Self::Close(_))
    }
}

impl From<String> for Message {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for Message {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}
