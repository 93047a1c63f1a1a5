use super::*;
use crate::config::NotifyConfig;
use crate::notify::ToastKind;
use crate::storage::MemoryStorage;
use std::time::Duration;
use tokio::time::timeout;

/// Storage whose reads work but whose writes always fail.
struct ReadOnlyStorage {
    inner: MemoryStorage,
}

impl Storage for ReadOnlyStorage {
    fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.inner.read(key)
    }

    fn write(&self, _origin: TabId, _key: &str, _value: &str) -> Result<(), StorageError> {
        Err(StorageError::Io(std::io::Error::other("quota exceeded")))
    }

    fn remove(&self, _origin: TabId, _key: &str) -> Result<(), StorageError> {
        Err(StorageError::Io(std::io::Error::other("quota exceeded")))
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.inner.subscribe()
    }
}

fn notifier() -> Notifier {
    Notifier::new(NotifyConfig::default())
}

fn languages() -> Vec<String> {
    vec!["en".into(), "es".into()]
}

fn tab_on(storage: &Arc<dyn Storage>) -> PreferenceSync {
    PreferenceSync::new(Arc::clone(storage), TabId::new(), notifier(), languages())
}

// =============================================================================
// hydration and fallbacks
// =============================================================================

#[test]
fn hydrates_from_storage() {
    let storage: Arc<dyn Storage> = Arc::new(
        MemoryStorage::new()
            .with_value(keys::THEME, "dark")
            .with_value(keys::LANGUAGE, "es")
            .with_value(keys::SIDEBAR_COLLAPSED, "true"),
    );
    let prefs = tab_on(&storage);
    assert_eq!(prefs.theme(), Theme::Dark);
    assert_eq!(prefs.language(), "es");
    assert!(prefs.sidebar_collapsed());
}

#[test]
fn invalid_values_fall_back_to_defaults() {
    let storage: Arc<dyn Storage> = Arc::new(
        MemoryStorage::new()
            .with_value(keys::THEME, "neon")
            .with_value(keys::LANGUAGE, "klingon")
            .with_value(keys::SIDEBAR_VISIBLE, "maybe"),
    );
    let prefs = tab_on(&storage);
    assert_eq!(prefs.theme(), Theme::System);
    assert_eq!(prefs.language(), "en");
    assert!(prefs.sidebar_visible());
    assert_eq!(prefs.cookie_consent(), None);
    assert!(!prefs.pwa_prompt_dismissed());
}

#[test]
fn get_returns_fallback_when_absent() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let prefs = tab_on(&storage);
    assert_eq!(prefs.get("missing", "fallback"), "fallback");
}

// =============================================================================
// local echo
// =============================================================================

#[test]
fn set_then_get_returns_value() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let prefs = tab_on(&storage);
    prefs.set(keys::THEME, "light").unwrap();
    assert_eq!(prefs.get(keys::THEME, "system"), "light");
    assert_eq!(storage.read(keys::THEME).unwrap().as_deref(), Some("light"));
}

#[test]
fn set_then_get_returns_value_even_when_write_fails() {
    let storage: Arc<dyn Storage> = Arc::new(ReadOnlyStorage { inner: MemoryStorage::new() });
    let prefs = tab_on(&storage);
    let err = prefs.set_theme(Theme::Dark).expect_err("write should fail");
    assert_eq!(err.key, keys::THEME);
    assert_eq!(prefs.theme(), Theme::Dark);
    assert_eq!(prefs.get(keys::THEME, "system"), "dark");
}

#[test]
fn storage_failure_is_surfaced_once() {
    let storage: Arc<dyn Storage> = Arc::new(ReadOnlyStorage { inner: MemoryStorage::new() });
    let notifier = notifier();
    let prefs = PreferenceSync::new(storage, TabId::new(), notifier.clone(), languages());

    assert!(prefs.set_theme(Theme::Dark).is_err());
    assert!(prefs.set_sidebar_collapsed(true).is_err());
    assert!(prefs.reset_cookie_consent().is_err());

    let toasts = notifier.toasts();
    assert_eq!(toasts.len(), 1);
    assert_eq!(toasts[0].kind, ToastKind::Warning);
}

#[test]
fn set_language_rejects_unsupported_without_change() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let prefs = tab_on(&storage);
    prefs.set_language("ES").unwrap();
    let err = prefs.set_language("de").expect_err("unsupported");
    assert!(matches!(err, PreferenceError::UnsupportedLanguage(code) if code == "de"));
    assert_eq!(prefs.language(), "es");
}

#[test]
fn cookie_consent_reset_removes_answer() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let prefs = tab_on(&storage);
    prefs.set_cookie_consent(true).unwrap();
    assert_eq!(prefs.cookie_consent(), Some(true));
    prefs.reset_cookie_consent().unwrap();
    assert_eq!(prefs.cookie_consent(), None);
    assert_eq!(storage.read(keys::COOKIE_CONSENT).unwrap(), None);
}

#[test]
fn revision_bumps_on_change() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let prefs = tab_on(&storage);
    let before = *prefs.revisions().borrow();
    prefs.dismiss_pwa_prompt().unwrap();
    assert!(*prefs.revisions().borrow() > before);
    assert!(prefs.pwa_prompt_dismissed());
}

// =============================================================================
// cross-tab sync
// =============================================================================

#[test]
fn apply_event_ignores_own_origin() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let prefs = tab_on(&storage);
    let own = StorageEvent { key: keys::THEME.into(), value: Some("dark".into()), origin: prefs.tab() };
    assert!(!prefs.apply_event(&own));
    assert_eq!(prefs.theme(), Theme::System);
}

#[test]
fn apply_event_from_other_tab_updates_and_removes() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let prefs = tab_on(&storage);
    let other = TabId::new();

    assert!(prefs.apply_event(&StorageEvent { key: keys::THEME.into(), value: Some("dark".into()), origin: other }));
    assert_eq!(prefs.theme(), Theme::Dark);
    assert!(!prefs.apply_event(&StorageEvent { key: keys::THEME.into(), value: Some("dark".into()), origin: other }));
    assert!(prefs.apply_event(&StorageEvent { key: keys::THEME.into(), value: None, origin: other }));
    assert_eq!(prefs.theme(), Theme::System);
}

#[tokio::test]
async fn listener_converges_other_tab() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let tab_a = tab_on(&storage);
    let tab_b = tab_on(&storage);
    let _listener = tab_b.spawn_listener().expect("first spawn");
    assert!(tab_b.spawn_listener().is_none());

    let mut revisions = tab_b.revisions();
    revisions.borrow_and_update();
    tab_a.set_theme(Theme::Dark).unwrap();

    timeout(Duration::from_millis(500), revisions.wait_for(|_| tab_b.theme() == Theme::Dark))
        .await
        .expect("tab b should converge")
        .expect("revision channel open");
    assert_eq!(tab_b.get(keys::THEME, "system"), "dark");
}

#[test]
fn theme_parse_round_trip_names() {
    for theme in [Theme::Light, Theme::Dark, Theme::System] {
        assert_eq!(theme.as_str().parse::<Theme>().unwrap(), theme);
    }
    assert!("sepia".parse::<Theme>().is_err());
}
