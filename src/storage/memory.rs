//! Process-local storage backend. Used by tests and ephemeral sessions.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio::sync::broadcast;

use super::{ChangeNotifier, Storage, StorageError, StorageEvent, TabId};

#[derive(Debug)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, String>>,
    notifier: ChangeNotifier,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self { values: Mutex::new(HashMap::new()), notifier: ChangeNotifier::new() }
    }

    /// Seed a value without publishing a change event.
    #[must_use]
    pub fn with_value(self, key: &str, value: &str) -> Self {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), value.to_owned());
        self
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn read(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn write(&self, origin: TabId, key: &str, value: &str) -> Result<(), StorageError> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), value.to_owned());
        self.notifier.publish(origin, key, Some(value));
        Ok(())
    }

    fn remove(&self, origin: TabId, key: &str) -> Result<(), StorageError> {
        let removed = self
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        if removed.is_some() {
            self.notifier.publish(origin, key, None);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.notifier.subscribe()
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
