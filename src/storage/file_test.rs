use super::*;
use crate::storage::keys;

fn scratch_path() -> PathBuf {
    std::env::temp_dir()
        .join(format!("booking-runtime-{}", uuid::Uuid::new_v4()))
        .join("prefs.json")
}

#[test]
fn open_missing_file_is_empty() {
    let store = FileStorage::open(scratch_path()).unwrap();
    assert_eq!(store.read(keys::THEME).unwrap(), None);
}

#[test]
fn values_survive_reopen() {
    let path = scratch_path();
    {
        let store = FileStorage::open(&path).unwrap();
        store.write(TabId::new(), keys::THEME, "dark").unwrap();
        store.write(TabId::new(), keys::AUTH_TOKEN, "tok-1").unwrap();
    }
    let reopened = FileStorage::open(&path).unwrap();
    assert_eq!(reopened.read(keys::THEME).unwrap().as_deref(), Some("dark"));
    assert_eq!(reopened.read(keys::AUTH_TOKEN).unwrap().as_deref(), Some("tok-1"));
}

#[test]
fn remove_survives_reopen() {
    let path = scratch_path();
    {
        let store = FileStorage::open(&path).unwrap();
        store.write(TabId::new(), keys::AUTH_TOKEN, "tok-1").unwrap();
        store.remove(TabId::new(), keys::AUTH_TOKEN).unwrap();
    }
    let reopened = FileStorage::open(&path).unwrap();
    assert_eq!(reopened.read(keys::AUTH_TOKEN).unwrap(), None);
}

#[test]
fn corrupt_document_opens_empty() {
    let path = scratch_path();
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, "{not json").unwrap();
    let store = FileStorage::open(&path).unwrap();
    assert_eq!(store.read(keys::THEME).unwrap(), None);
}

#[test]
fn write_publishes_event() {
    let store = FileStorage::open(scratch_path()).unwrap();
    let mut rx = store.subscribe();
    let tab = TabId::new();
    store.write(tab, keys::SIDEBAR_COLLAPSED, "true").unwrap();
    let event = rx.try_recv().expect("event");
    assert_eq!(event.origin, tab);
    assert_eq!(event.value.as_deref(), Some("true"));
}

#[test]
fn failed_write_rolls_back_and_stays_silent() {
    // A directory where the document should be makes the rename fail.
    let path = scratch_path();
    std::fs::create_dir_all(&path).unwrap();
    let store = FileStorage::open(&path);
    // Reading a directory as a file fails on open on most platforms.
    let Ok(store) = store else {
        return;
    };
    let mut rx = store.subscribe();
    assert!(store.write(TabId::new(), keys::THEME, "dark").is_err());
    assert_eq!(store.read(keys::THEME).unwrap(), None);
    assert!(rx.try_recv().is_err());
}
