use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::StorageError;

/// Asynchronous key/value backend for [`persist`](super::persist()).
///
/// Values are already-serialized payloads; backends only move strings around.
#[async_trait]
pub trait StateStorage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set(&self, key: &str, value: String) -> Result<(), StorageError>;

    async fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// An in-process [`StateStorage`]. Clones share the same map.
#[derive(Clone, Debug, Default)]
pub struct MemoryStorage {
    items: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed `key` with a raw payload.
    pub fn with(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.items.lock().insert(key.into(), value.into());
        self
    }

    /// Read `key` without going through the async interface.
    pub fn peek(&self, key: &str) -> Option<String> {
        self.items.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

#[async_trait]
impl StateStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.peek(key))
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        self.items.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.items.lock().remove(key);
        Ok(())
    }
}

#[async_trait]
impl<T: StateStorage + ?Sized> StateStorage for Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
        (**self).set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        (**self).remove(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_storage_round_trips_and_shares_between_clones() {
        let storage = MemoryStorage::new();
        let other = storage.clone();

        storage.set("prefs", "{}".to_string()).await.unwrap();
        assert_eq!(other.get("prefs").await.unwrap(), Some("{}".to_string()));

        other.remove("prefs").await.unwrap();
        assert!(storage.is_empty());
        assert_eq!(storage.get("prefs").await.unwrap(), None);
    }

    #[tokio::test]
    async fn shared_storage_works_through_arc() {
        let storage: Arc<dyn StateStorage> = Arc::new(MemoryStorage::new().with("k", "v"));
        assert_eq!(storage.get("k").await.unwrap(), Some("v".to_string()));
    }
}
