//! Bot conversation engine: transcript, pending gate, chat visibility.
//!
//! DESIGN
//! ======
//! At most one bot round trip is in flight. `send_user_message` appends the
//! user's message, marks the conversation pending and spawns the round trip
//! over a [`ReplyChannel`]. Each round trip is tagged with the generation it
//! was started under; `reset` (new conversation, logout) bumps the
//! generation, so a reply or failure arriving afterwards is discarded.
//!
//! Messages are ordered by `seq`, assigned at append time. Timestamps are
//! informational only.
//!
//! ERROR HANDLING
//! ==============
//! A failed or timed-out round trip appends nothing, clears `pending` and
//! raises a warning toast. The user may retry immediately.

pub mod channel;

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ConversationConfig;
use crate::notify::Notifier;

pub use channel::{HttpReplyChannel, RealtimeReplyChannel, ReplyChannel, ReplyError};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    User,
    Bot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub text: String,
    pub origin: Origin,
    /// Unix millis at append time.
    pub timestamp: i64,
    /// Append order within the conversation.
    pub seq: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationSnapshot {
    pub messages: Vec<ChatMessage>,
    pub pending: bool,
    pub visible: bool,
    pub unread: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversationError {
    #[error("a bot reply is still pending")]
    ConversationBusy,
    #[error("assistant unavailable: {0}")]
    BotUnavailable(String),
    #[error("message is empty")]
    EmptyMessage,
    #[error("message exceeds {max} characters")]
    MessageTooLong { max: usize },
}

// =============================================================================
// ENGINE
// =============================================================================

#[derive(Clone)]
pub struct ConversationEngine {
    inner: Arc<Mutex<ConvInner>>,
    channel: Arc<dyn ReplyChannel>,
    notifier: Notifier,
    config: ConversationConfig,
    state_tx: watch::Sender<ConversationSnapshot>,
}

#[derive(Default)]
struct ConvInner {
    messages: Vec<ChatMessage>,
    pending: bool,
    visible: bool,
    unread: usize,
    generation: u64,
    next_seq: u64,
    round_trip: Option<JoinHandle<()>>,
}

impl ConvInner {
    fn append(&mut self, text: String, origin: Origin) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.messages.push(ChatMessage { id: Uuid::new_v4(), text, origin, timestamp: frames::now_ms(), seq });
    }

    fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            messages: self.messages.clone(),
            pending: self.pending,
            visible: self.visible,
            unread: self.unread,
        }
    }
}

impl ConversationEngine {
    #[must_use]
    pub fn new(channel: Arc<dyn ReplyChannel>, notifier: Notifier, config: ConversationConfig) -> Self {
        let (state_tx, _) = watch::channel(ConversationSnapshot::default());
        Self { inner: Arc::new(Mutex::new(ConvInner::default())), channel, notifier, config, state_tx }
    }

    /// Show the chat surface and mark everything read.
    pub fn open(&self) {
        self.update(|inner| {
            inner.visible = true;
            inner.unread = 0;
        });
    }

    pub fn close(&self) {
        self.update(|inner| inner.visible = false);
    }

    pub fn toggle(&self) {
        let visible = self.lock().visible;
        if visible { self.close() } else { self.open() }
    }

    /// Append a user message and start the bot round trip.
    ///
    /// Returns the generation the round trip runs under.
    ///
    /// # Errors
    ///
    /// - [`ConversationError::EmptyMessage`] for blank input
    /// - [`ConversationError::MessageTooLong`] over the configured limit
    /// - [`ConversationError::ConversationBusy`] while a reply is pending
    pub fn send_user_message(&self, text: &str) -> Result<u64, ConversationError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ConversationError::EmptyMessage);
        }
        let max = self.config.max_message_chars;
        if text.chars().count() > max {
            return Err(ConversationError::MessageTooLong { max });
        }

        let mut inner = self.lock();
        if inner.pending {
            return Err(ConversationError::ConversationBusy);
        }
        inner.generation += 1;
        let generation = inner.generation;
        inner.append(text.to_owned(), Origin::User);
        inner.pending = true;
        self.state_tx.send_replace(inner.snapshot());

        let engine = self.clone();
        let prompt = text.to_owned();
        inner.round_trip = Some(tokio::spawn(async move {
            engine.round_trip(generation, prompt).await;
        }));
        debug!(generation, "bot round trip started");
        Ok(generation)
    }

    /// Deliver a bot reply for `generation`. Returns `false` if it was stale.
    pub(crate) fn on_bot_reply(&self, generation: u64, text: String) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation || !inner.pending {
            debug!(generation, current = inner.generation, "discarding stale bot reply");
            return false;
        }
        inner.append(text, Origin::Bot);
        inner.pending = false;
        inner.round_trip = None;
        if !inner.visible {
            inner.unread += 1;
        }
        self.state_tx.send_replace(inner.snapshot());
        true
    }

    fn on_bot_failure(&self, generation: u64, reason: String) {
        {
            let mut inner = self.lock();
            if inner.generation != generation || !inner.pending {
                debug!(generation, "discarding stale bot failure");
                return;
            }
            inner.pending = false;
            inner.round_trip = None;
            self.state_tx.send_replace(inner.snapshot());
        }
        warn!(generation, %reason, "bot round trip failed");
        self.notifier.warning(ConversationError::BotUnavailable(reason).to_string());
    }

    async fn round_trip(&self, generation: u64, prompt: String) {
        match tokio::time::timeout(self.config.reply_timeout, self.channel.send(&prompt)).await {
            Ok(Ok(reply)) => {
                self.on_bot_reply(generation, reply);
            }
            Ok(Err(e)) => self.on_bot_failure(generation, e.to_string()),
            Err(_) => self.on_bot_failure(generation, "no reply in time".into()),
        }
    }

    /// Start a new conversation: drop the transcript and cancel any pending reply.
    pub fn reset(&self) {
        let round_trip = {
            let mut inner = self.lock();
            inner.generation += 1;
            inner.messages.clear();
            inner.pending = false;
            inner.unread = 0;
            let round_trip = inner.round_trip.take();
            self.state_tx.send_replace(inner.snapshot());
            round_trip
        };
        if let Some(task) = round_trip {
            task.abort();
        }
        info!("conversation reset");
    }

    #[must_use]
    pub fn snapshot(&self) -> ConversationSnapshot {
        self.lock().snapshot()
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ConversationSnapshot> {
        self.state_tx.subscribe()
    }

    fn update(&self, f: impl FnOnce(&mut ConvInner)) {
        let mut inner = self.lock();
        f(&mut inner);
        self.state_tx.send_replace(inner.snapshot());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConvInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "conversation_test.rs"]
mod tests;
