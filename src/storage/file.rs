//! JSON-file storage backend for non-browser targets.
//!
//! DESIGN
//! ======
//! The whole store is one flat JSON object loaded once at open time. Reads
//! are served from the loaded copy; each write rewrites the document to a
//! sibling temp file and renames it over the original, so a crash mid-write
//! leaves the previous document intact.
//!
//! ERROR HANDLING
//! ==============
//! A failed write rolls the cached entry back, so `read` keeps reporting what
//! actually survives a restart. A corrupt document on open is treated as an
//! empty store (logged), matching how a browser silently drops unreadable
//! `localStorage` entries.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tokio::sync::broadcast;
use tracing::warn;

use super::{ChangeNotifier, Storage, StorageError, StorageEvent, TabId};

#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
    notifier: ChangeNotifier,
}

impl FileStorage {
    /// Open (or lazily create) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the file exists but cannot be read.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<BTreeMap<String, String>>(&raw) {
                Ok(values) => values,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "preference file unreadable; starting empty");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, values: Mutex::new(values), notifier: ChangeNotifier::new() })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &BTreeMap<String, String>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let body = serde_json::to_vec_pretty(values)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn write(&self, origin: TabId, key: &str, value: &str) -> Result<(), StorageError> {
        {
            let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
            let previous = values.insert(key.to_owned(), value.to_owned());
            if let Err(e) = self.persist(&values) {
                match previous {
                    Some(prev) => values.insert(key.to_owned(), prev),
                    None => values.remove(key),
                };
                return Err(e);
            }
        }
        self.notifier.publish(origin, key, Some(value));
        Ok(())
    }

    fn remove(&self, origin: TabId, key: &str) -> Result<(), StorageError> {
        {
            let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(previous) = values.remove(key) else {
                return Ok(());
            };
            if let Err(e) = self.persist(&values) {
                values.insert(key.to_owned(), previous);
                return Err(e);
            }
        }
        self.notifier.publish(origin, key, None);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.notifier.subscribe()
    }
}

#[cfg(test)]
#[path = "file_test.rs"]
mod tests;
