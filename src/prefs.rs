//! Preference sync: per-tab mirror over the shared durable store.
//!
//! DESIGN
//! ======
//! `set` updates the in-memory mirror first and then writes through to
//! storage, so a `get` in the same tab sees the new value immediately no
//! matter how slow (or broken) the durable write is. Other tabs converge when
//! their listener task applies the storage change event; events that
//! originate from this tab are ignored because the local echo already
//! happened.
//!
//! ERROR HANDLING
//! ==============
//! A failed durable write keeps the mirror value (the UI stays responsive)
//! but returns [`PreferenceStorageError`]. The user is warned once per tab,
//! not on every subsequent write.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::notify::Notifier;
use crate::storage::{Storage, StorageError, StorageEvent, TabId, keys};

// =============================================================================
// ERRORS
// =============================================================================

/// A preference change was applied locally but did not reach durable storage.
#[derive(Debug, thiserror::Error)]
#[error("preference `{key}` not persisted: {source}")]
pub struct PreferenceStorageError {
    pub key: String,
    #[source]
    pub source: StorageError,
}

#[derive(Debug, thiserror::Error)]
pub enum PreferenceError {
    #[error(transparent)]
    Storage(#[from] PreferenceStorageError),
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
}

// =============================================================================
// TYPED VALUES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Theme {
    Light,
    Dark,
    /// Follow the platform colour scheme.
    #[default]
    System,
}

impl Theme {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Dark => "dark",
            Self::System => "system",
        }
    }
}

impl fmt::Display for Theme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Theme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "light" => Ok(Self::Light),
            "dark" => Ok(Self::Dark),
            "system" => Ok(Self::System),
            other => Err(format!("unknown theme: {other}")),
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

fn flag_str(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

// =============================================================================
// PREFERENCE SYNC
// =============================================================================

#[derive(Clone)]
pub struct PreferenceSync {
    inner: Arc<PrefsInner>,
}

struct PrefsInner {
    storage: Arc<dyn Storage>,
    tab: TabId,
    mirror: Mutex<HashMap<String, String>>,
    /// Taken by the listener task; subscribed before hydration so no change is missed.
    changes: Mutex<Option<broadcast::Receiver<StorageEvent>>>,
    revision: watch::Sender<u64>,
    notifier: Notifier,
    storage_error_reported: AtomicBool,
    supported_languages: Vec<String>,
}

impl PreferenceSync {
    /// Create the mirror for tab `tab` and hydrate it from storage.
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>, tab: TabId, notifier: Notifier, supported_languages: Vec<String>) -> Self {
        let changes = storage.subscribe();
        let (revision, _) = watch::channel(0);
        let sync = Self {
            inner: Arc::new(PrefsInner {
                storage,
                tab,
                mirror: Mutex::new(HashMap::new()),
                changes: Mutex::new(Some(changes)),
                revision,
                notifier,
                storage_error_reported: AtomicBool::new(false),
                supported_languages,
            }),
        };
        sync.hydrate();
        sync
    }

    #[must_use]
    pub fn tab(&self) -> TabId {
        self.inner.tab
    }

    /// Reload every known preference key from durable storage.
    pub fn hydrate(&self) {
        let mut loaded = HashMap::new();
        for key in keys::PREFERENCES {
            match self.inner.storage.read(key) {
                Ok(Some(value)) => {
                    loaded.insert((*key).to_owned(), value);
                }
                Ok(None) => {}
                Err(e) => warn!(key, error = %e, "preference read failed; using default"),
            }
        }
        *self.mirror() = loaded;
        self.bump();
    }

    // -------------------------------------------------------------------------
    // Raw access
    // -------------------------------------------------------------------------

    /// Mirror value for `key`, or `fallback` when absent.
    #[must_use]
    pub fn get(&self, key: &str, fallback: &str) -> String {
        self.mirror()
            .get(key)
            .cloned()
            .unwrap_or_else(|| fallback.to_owned())
    }

    /// Set `key` locally, then write it through to durable storage.
    ///
    /// # Errors
    ///
    /// Returns [`PreferenceStorageError`] when the durable write fails. The
    /// local value is updated regardless.
    pub fn set(&self, key: &str, value: &str) -> Result<(), PreferenceStorageError> {
        self.mirror().insert(key.to_owned(), value.to_owned());
        self.bump();
        let result = self.inner.storage.write(self.inner.tab, key, value);
        self.check_persisted(key, result)
    }

    /// Remove `key` locally and durably.
    ///
    /// # Errors
    ///
    /// Returns [`PreferenceStorageError`] when the durable removal fails.
    pub fn remove(&self, key: &str) -> Result<(), PreferenceStorageError> {
        self.mirror().remove(key);
        self.bump();
        let result = self.inner.storage.remove(self.inner.tab, key);
        self.check_persisted(key, result)
    }

    fn check_persisted(&self, key: &str, result: Result<(), StorageError>) -> Result<(), PreferenceStorageError> {
        let Err(source) = result else {
            return Ok(());
        };
        warn!(key, error = %source, "preference write failed; change will not survive reload");
        if !self
            .inner
            .storage_error_reported
            .swap(true, Ordering::SeqCst)
        {
            self.inner
                .notifier
                .warning("Your settings could not be saved and will reset on reload.");
        }
        Err(PreferenceStorageError { key: key.to_owned(), source })
    }

    // -------------------------------------------------------------------------
    // Cross-tab sync
    // -------------------------------------------------------------------------

    /// Apply a storage change from another tab. Returns `true` if the mirror changed.
    pub fn apply_event(&self, event: &StorageEvent) -> bool {
        if event.origin == self.inner.tab {
            return false;
        }
        let changed = {
            let mut mirror = self.mirror();
            match &event.value {
                Some(value) => mirror.insert(event.key.clone(), value.clone()).as_ref() != Some(value),
                None => mirror.remove(&event.key).is_some(),
            }
        };
        if changed {
            debug!(key = %event.key, origin = %event.origin, "preference synced from another tab");
            self.bump();
        }
        changed
    }

    /// Spawn the task that applies other tabs' changes. Returns `None` if already spawned.
    pub fn spawn_listener(&self) -> Option<JoinHandle<()>> {
        let mut rx = self
            .inner
            .changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        let sync = self.clone();
        Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        sync.apply_event(&event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "preference listener lagged; rehydrating");
                        sync.hydrate();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }))
    }

    /// Watch channel bumped on every mirror change.
    #[must_use]
    pub fn revisions(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    // -------------------------------------------------------------------------
    // Typed preferences
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn theme(&self) -> Theme {
        self.mirror()
            .get(keys::THEME)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }

    /// # Errors
    ///
    /// See [`PreferenceSync::set`].
    pub fn set_theme(&self, theme: Theme) -> Result<(), PreferenceStorageError> {
        self.set(keys::THEME, theme.as_str())
    }

    /// Current language code, falling back to the first supported language.
    #[must_use]
    pub fn language(&self) -> String {
        let stored = self.mirror().get(keys::LANGUAGE).cloned();
        match stored {
            Some(code) if self.is_supported_language(&code) => code,
            _ => self.default_language(),
        }
    }

    /// # Errors
    ///
    /// Returns [`PreferenceError::UnsupportedLanguage`] without touching any
    /// state, or [`PreferenceError::Storage`] if the write did not persist.
    pub fn set_language(&self, code: &str) -> Result<(), PreferenceError> {
        let code = code.trim().to_ascii_lowercase();
        if !self.is_supported_language(&code) {
            return Err(PreferenceError::UnsupportedLanguage(code));
        }
        self.set(keys::LANGUAGE, &code)?;
        Ok(())
    }

    fn is_supported_language(&self, code: &str) -> bool {
        self.inner.supported_languages.iter().any(|l| l == code)
    }

    fn default_language(&self) -> String {
        self.inner
            .supported_languages
            .first()
            .cloned()
            .unwrap_or_else(|| "en".to_owned())
    }

    #[must_use]
    pub fn sidebar_collapsed(&self) -> bool {
        self.flag(keys::SIDEBAR_COLLAPSED).unwrap_or(false)
    }

    /// # Errors
    ///
    /// See [`PreferenceSync::set`].
    pub fn set_sidebar_collapsed(&self, collapsed: bool) -> Result<(), PreferenceStorageError> {
        self.set(keys::SIDEBAR_COLLAPSED, flag_str(collapsed))
    }

    #[must_use]
    pub fn sidebar_visible(&self) -> bool {
        self.flag(keys::SIDEBAR_VISIBLE).unwrap_or(true)
    }

    /// # Errors
    ///
    /// See [`PreferenceSync::set`].
    pub fn set_sidebar_visible(&self, visible: bool) -> Result<(), PreferenceStorageError> {
        self.set(keys::SIDEBAR_VISIBLE, flag_str(visible))
    }

    /// `None` until the user has answered the consent prompt.
    #[must_use]
    pub fn cookie_consent(&self) -> Option<bool> {
        self.flag(keys::COOKIE_CONSENT)
    }

    /// # Errors
    ///
    /// See [`PreferenceSync::set`].
    pub fn set_cookie_consent(&self, accepted: bool) -> Result<(), PreferenceStorageError> {
        self.set(keys::COOKIE_CONSENT, flag_str(accepted))
    }

    /// Forget the consent answer so the prompt shows again.
    ///
    /// # Errors
    ///
    /// See [`PreferenceSync::remove`].
    pub fn reset_cookie_consent(&self) -> Result<(), PreferenceStorageError> {
        self.remove(keys::COOKIE_CONSENT)
    }

    #[must_use]
    pub fn pwa_prompt_dismissed(&self) -> bool {
        self.flag(keys::PWA_PROMPT_DISMISSED).unwrap_or(false)
    }

    /// # Errors
    ///
    /// See [`PreferenceSync::set`].
    pub fn dismiss_pwa_prompt(&self) -> Result<(), PreferenceStorageError> {
        self.set(keys::PWA_PROMPT_DISMISSED, flag_str(true))
    }

    fn flag(&self, key: &str) -> Option<bool> {
        self.mirror().get(key).and_then(|v| parse_flag(v))
    }

    fn mirror(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.inner
            .mirror
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.inner.revision.send_modify(|r| *r += 1);
    }
}

#[cfg(test)]
#[path = "prefs_test.rs"]
mod tests;
