//! Reply channels: how a user prompt reaches the bot.
//!
//! Two implementations: over the realtime connection (`bot:message` request,
//! `bot:reply` answer correlated by `parent_id`) and over the REST API.

use std::time::Duration;

use frames::Status;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::realtime::{ConnectionError, ConnectionManager, Subscription};
use crate::session::SessionManager;

pub const BOT_REQUEST_EVENT: &str = "bot:message";
pub const BOT_REPLY_EVENT: &str = "bot:reply";

#[derive(Debug, thiserror::Error)]
pub enum ReplyError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("chatbot request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("chatbot returned HTTP {0}")]
    Status(u16),
    #[error("not signed in")]
    Unauthenticated,
    #[error("bot error: {0}")]
    Remote(String),
    #[error("reply stream closed")]
    Closed,
}

/// Sends one prompt and resolves with the bot's answer.
#[async_trait::async_trait]
pub trait ReplyChannel: Send + Sync + 'static {
    async fn send(&self, text: &str) -> Result<String, ReplyError>;
}

// =============================================================================
// REALTIME
// =============================================================================

pub struct RealtimeReplyChannel {
    conn: ConnectionManager,
}

impl RealtimeReplyChannel {
    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

/// Unsubscribes when the round trip ends or is cancelled.
struct ReplyListener(Option<Subscription>);

impl Drop for ReplyListener {
    fn drop(&mut self) {
        if let Some(sub) = self.0.take() {
            sub.unsubscribe();
        }
    }
}

#[async_trait::async_trait]
impl ReplyChannel for RealtimeReplyChannel {
    async fn send(&self, text: &str) -> Result<String, ReplyError> {
        // Listen before emitting so a fast reply cannot slip past.
        let (sub, mut replies) = self.conn.subscribe_channel(BOT_REPLY_EVENT);
        let _listener = ReplyListener(Some(sub));

        let request_id = self.conn.emit(BOT_REQUEST_EVENT, json!({ "text": text }))?;

        while let Some(frame) = replies.recv().await {
            // Partial answers stream as `Item`; only a terminal frame settles.
            if !frame.is_reply_to(&request_id) || !frame.status.is_terminal() {
                continue;
            }
            if frame.status != Status::Done {
                let fallback = match frame.status {
                    Status::Cancel => "bot cancelled the reply",
                    _ => "bot failed to answer",
                };
                let message = frame.data_str("message").unwrap_or(fallback);
                return Err(ReplyError::Remote(message.to_owned()));
            }
            return frame
                .data_str("text")
                .map(ToOwned::to_owned)
                .ok_or_else(|| ReplyError::Remote("reply without text".into()));
        }
        Err(ReplyError::Closed)
    }
}

// =============================================================================
// HTTP
// =============================================================================

#[derive(Debug, Deserialize)]
struct ChatbotResponse {
    reply: String,
}

/// POSTs `{ "message": … }` to `/api/chatbot` with the session's bearer token.
/// A 401/403 answer expires the session.
pub struct HttpReplyChannel {
    client: reqwest::Client,
    api_url: String,
    session: SessionManager,
}

impl HttpReplyChannel {
    /// # Errors
    ///
    /// Returns [`ReplyError::Http`] if the HTTP client cannot be built.
    pub fn new(api_url: impl Into<String>, timeout: Duration, session: SessionManager) -> Result<Self, ReplyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, api_url: api_url.into().trim_end_matches('/').to_owned(), session })
    }
}

#[async_trait::async_trait]
impl ReplyChannel for HttpReplyChannel {
    async fn send(&self, text: &str) -> Result<String, ReplyError> {
        let token = self.session.token().ok_or(ReplyError::Unauthenticated)?;
        let resp = self
            .client
            .post(format!("{}/api/chatbot", self.api_url))
            .bearer_auth(token)
            .json(&json!({ "message": text }))
            .send()
            .await?;

        match resp.status() {
            s @ (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => {
                warn!(status = s.as_u16(), "chatbot rejected the session token");
                self.session.expire();
                return Err(ReplyError::Unauthenticated);
            }
            s if !s.is_success() => return Err(ReplyError::Status(s.as_u16())),
            _ => {}
        }
        let body: ChatbotResponse = resp.json().await?;
        Ok(body.reply)
    }
}

#[cfg(test)]
#[path = "channel_test.rs"]
mod tests;
