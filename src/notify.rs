//! Notification dispatcher: toasts and the single modal slot.
//!
//! DESIGN
//! ======
//! All runtime services report user-facing feedback here instead of
//! rendering it. Toasts live in a bounded queue (oldest evicted) and expire
//! after the configured duration; the modal is one slot where the last writer
//! wins. Consumers either poll snapshots (`toasts`, `modal`) or follow the
//! broadcast of [`NotificationEvent`]s.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::config::NotifyConfig;

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastKind {
    Success,
    Error,
    Info,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toast {
    pub id: Uuid,
    pub kind: ToastKind,
    pub message: String,
    pub expires_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modal {
    pub id: Uuid,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    ToastAdded(Toast),
    ToastRemoved(Uuid),
    ModalShown(Modal),
    ModalHidden,
}

#[derive(Clone)]
pub struct Notifier {
    inner: Arc<Mutex<NotifierInner>>,
    events: broadcast::Sender<NotificationEvent>,
    config: NotifyConfig,
}

struct NotifierInner {
    toasts: VecDeque<Toast>,
    modal: Option<Modal>,
}

impl Notifier {
    #[must_use]
    pub fn new(config: NotifyConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { inner: Arc::new(Mutex::new(NotifierInner { toasts: VecDeque::new(), modal: None })), events, config }
    }

    /// Enqueue a transient toast and return its id.
    pub fn notify(&self, kind: ToastKind, message: impl Into<String>) -> Uuid {
        self.notify_at(kind, message.into(), Instant::now())
    }

    fn notify_at(&self, kind: ToastKind, message: String, now: Instant) -> Uuid {
        let toast = Toast { id: Uuid::new_v4(), kind, message, expires_at: now + self.config.toast_duration };
        let id = toast.id;
        debug!(?kind, message = %toast.message, "toast");

        let evicted = {
            let mut inner = self.lock();
            inner.toasts.push_back(toast.clone());
            let mut evicted = Vec::new();
            while inner.toasts.len() > self.config.max_toasts {
                if let Some(old) = inner.toasts.pop_front() {
                    evicted.push(old.id);
                }
            }
            evicted
        };

        for old in evicted {
            self.publish(NotificationEvent::ToastRemoved(old));
        }
        self.publish(NotificationEvent::ToastAdded(toast));
        id
    }

    pub fn success(&self, message: impl Into<String>) -> Uuid {
        self.notify(ToastKind::Success, message)
    }

    pub fn error(&self, message: impl Into<String>) -> Uuid {
        self.notify(ToastKind::Error, message)
    }

    pub fn info(&self, message: impl Into<String>) -> Uuid {
        self.notify(ToastKind::Info, message)
    }

    pub fn warning(&self, message: impl Into<String>) -> Uuid {
        self.notify(ToastKind::Warning, message)
    }

    /// Remove a toast before it expires. Returns `false` if it was already gone.
    pub fn dismiss(&self, id: Uuid) -> bool {
        let removed = {
            let mut inner = self.lock();
            let before = inner.toasts.len();
            inner.toasts.retain(|t| t.id != id);
            inner.toasts.len() != before
        };
        if removed {
            self.publish(NotificationEvent::ToastRemoved(id));
        }
        removed
    }

    /// Drop every toast whose expiry is at or before `now`. Returns how many were dropped.
    pub fn prune_expired(&self, now: Instant) -> usize {
        let expired: Vec<Uuid> = {
            let mut inner = self.lock();
            let expired = inner
                .toasts
                .iter()
                .filter(|t| t.expires_at <= now)
                .map(|t| t.id)
                .collect::<Vec<_>>();
            inner.toasts.retain(|t| t.expires_at > now);
            expired
        };
        for id in &expired {
            self.publish(NotificationEvent::ToastRemoved(*id));
        }
        expired.len()
    }

    /// Current toasts, oldest first.
    #[must_use]
    pub fn toasts(&self) -> Vec<Toast> {
        self.lock().toasts.iter().cloned().collect()
    }

    /// Show `content` in the modal slot, replacing whatever was there.
    pub fn show_modal(&self, content: impl Into<String>) -> Uuid {
        let modal = Modal { id: Uuid::new_v4(), content: content.into() };
        let id = modal.id;
        self.lock().modal = Some(modal.clone());
        self.publish(NotificationEvent::ModalShown(modal));
        id
    }

    /// Clear the modal slot. No-op when empty.
    pub fn hide_modal(&self) {
        let had_modal = self.lock().modal.take().is_some();
        if had_modal {
            self.publish(NotificationEvent::ModalHidden);
        }
    }

    #[must_use]
    pub fn modal(&self) -> Option<Modal> {
        self.lock().modal.clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: NotificationEvent) {
        let _ = self.events.send(event);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NotifierInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "notify_test.rs"]
mod tests;
