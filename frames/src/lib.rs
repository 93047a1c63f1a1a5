//! Realtime envelope shared by the booking runtime and its test servers.
//!
//! Every message on the realtime channel is a [`Frame`]: a named event with a
//! lifecycle status and a free-form JSON payload. A reply carries the id of
//! the request it answers in `parent_id`; that is the only correlation
//! mechanism on the push channel (a bot round trip is `bot:message` out,
//! `bot:reply` back with the matching parent).
//!
//! Binary messages are protobuf (see [`wire`]). Text messages carry the same
//! frame as JSON.

mod wire;

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed protobuf frame: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("unknown frame status {0}")]
    InvalidStatus(i32),
    #[error("malformed json frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// Where a frame sits in a request/response exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// A request, or a one-way push from the server.
    Request,
    /// Partial answer; more follow.
    Item,
    Done,
    Error,
    Cancel,
}

impl Status {
    /// `Done`, `Error` and `Cancel` close an exchange.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Request | Self::Item)
    }

    /// Numeric value used on the wire.
    #[must_use]
    pub fn as_i32(self) -> i32 {
        wire::WireStatus::from(self) as i32
    }

    fn from_i32(raw: i32) -> Result<Self, CodecError> {
        wire::WireStatus::try_from(raw)
            .map(Self::from)
            .map_err(|_| CodecError::InvalidStatus(raw))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub id: String,
    /// Id of the request this frame answers.
    pub parent_id: Option<String>,
    /// Creation time, Unix millis.
    pub ts: i64,
    /// Sender label (user id or `"bot"`), when the server sets one.
    pub from: Option<String>,
    /// Namespaced event name such as `booking:updated`.
    pub event: String,
    pub status: Status,
    pub data: Value,
}

#[must_use]
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|elapsed| i64::try_from(elapsed.as_millis()).ok())
        .unwrap_or(0)
}

impl Frame {
    fn new(event: String, parent_id: Option<String>, status: Status, data: Value) -> Self {
        Self { id: Uuid::new_v4().to_string(), parent_id, ts: now_ms(), from: None, event, status, data }
    }

    /// A fresh request (or push) for `event`.
    pub fn request(event: impl Into<String>, data: Value) -> Self {
        Self::new(event.into(), None, Status::Request, data)
    }

    /// An answer to `self`, possibly under another event name.
    #[must_use]
    pub fn reply(&self, event: impl Into<String>, status: Status, data: Value) -> Self {
        Self::new(event.into(), Some(self.id.clone()), status, data)
    }

    #[must_use]
    pub fn is_reply_to(&self, request_id: &str) -> bool {
        self.parent_id.as_deref() == Some(request_id)
    }

    /// String field `key` of an object payload.
    #[must_use]
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key)?.as_str()
    }
}

/// Protobuf bytes for a binary websocket message.
#[must_use]
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    wire::encode(frame)
}

/// Parse a binary websocket message.
///
/// # Errors
///
/// [`CodecError::Decode`] for malformed bytes, [`CodecError::InvalidStatus`]
/// for a status this version does not know.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, CodecError> {
    wire::decode(bytes)
}

/// Parse a text websocket message.
///
/// # Errors
///
/// [`CodecError::Json`] when the text is not a JSON frame.
pub fn decode_text(text: &str) -> Result<Frame, CodecError> {
    serde_json::from_str(text).map_err(CodecError::from)
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
