//! Durable key/value storage shared by every runtime instance ("tab").
//!
//! DESIGN
//! ======
//! Reads are synchronous, mirroring browser `localStorage`. Every successful
//! write or removal is published on a broadcast channel tagged with the
//! writer's [`TabId`], so other tabs sharing the same store can refresh their
//! in-memory mirrors. Writers never receive meaningful events for their own
//! writes; consumers filter on origin.
//!
//! Values are plain scalar strings. Structured data is never persisted here.

pub mod file;
pub mod memory;

use std::fmt;

use tokio::sync::broadcast;
use uuid::Uuid;

pub use file::FileStorage;
pub use memory::MemoryStorage;

// =============================================================================
// KEYS
// =============================================================================

/// Persisted key names.
pub mod keys {
    pub const AUTH_TOKEN: &str = "auth_token";
    pub const THEME: &str = "theme_preference";
    pub const LANGUAGE: &str = "language_preference";
    pub const SIDEBAR_COLLAPSED: &str = "sidebar_collapsed";
    pub const SIDEBAR_VISIBLE: &str = "sidebar_visible";
    pub const COOKIE_CONSENT: &str = "cookie_consent";
    pub const PWA_PROMPT_DISMISSED: &str = "pwa_prompt_dismissed";

    /// Keys hydrated into the preference mirror at startup.
    pub const PREFERENCES: &[&str] =
        &[THEME, LANGUAGE, SIDEBAR_COLLAPSED, SIDEBAR_VISIBLE, COOKIE_CONSENT, PWA_PROMPT_DISMISSED];
}

const CHANGE_CHANNEL_CAPACITY: usize = 64;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage document is not valid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Identity of one runtime instance sharing a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TabId(Uuid);

impl TabId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TabId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A committed change to the durable store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    /// New value, or `None` when the key was removed.
    pub value: Option<String>,
    pub origin: TabId,
}

/// Durable key/value store with cross-tab change notification.
pub trait Storage: Send + Sync {
    /// Read the durable value for `key`.
    ///
    /// # Errors
    ///
    /// Backend-specific read failure.
    fn read(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Write `value` under `key` on behalf of tab `origin`.
    ///
    /// # Errors
    ///
    /// The write did not reach durable storage; the previous value is kept.
    fn write(&self, origin: TabId, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove `key` on behalf of tab `origin`. Removing a missing key is not an error.
    ///
    /// # Errors
    ///
    /// The removal did not reach durable storage.
    fn remove(&self, origin: TabId, key: &str) -> Result<(), StorageError>;

    /// Subscribe to committed changes from every tab.
    fn subscribe(&self) -> broadcast::Receiver<StorageEvent>;
}

// =============================================================================
// CHANGE NOTIFIER
// =============================================================================

/// Broadcast fan-out used by the storage backends.
#[derive(Debug, Clone)]
pub(crate) struct ChangeNotifier {
    tx: broadcast::Sender<StorageEvent>,
}

impl ChangeNotifier {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub(crate) fn publish(&self, origin: TabId, key: &str, value: Option<&str>) {
        // No subscribers is fine: a lone tab has nobody to notify.
        let _ = self.tx.send(StorageEvent { key: key.to_owned(), value: value.map(ToOwned::to_owned), origin });
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.tx.subscribe()
    }
}
