//! In-memory backend. Grounded on
//! `convex_storage::memory::InMemoryStorage`: one `RwLock<HashMap<...>>`
//! per collection, with lock-poisoning mapped to `StorageError::Database`
//! exactly as the teacher's `.map_err(|e| StorageError::Database(...))?`
//! idiom does.

use std::collections::HashMap;
use std::sync::RwLock;

use fish_base::uid::Uid;
use tokio::sync::broadcast;

use crate::error::{StorageError, StorageResult};
use crate::event::{EventKind, StorageEvent, EVENT_CHANNEL_CAPACITY};
use crate::typed_store::TypedStore;

/// In-memory, process-local collection. The default backend for tests
/// and single-process demos.
pub struct MemoryStore<T> {
    entity: &'static str,
    rows: RwLock<HashMap<Uid, T>>,
    events: broadcast::Sender<StorageEvent<T>>,
}

impl<T: Clone + Send + Sync + 'static> MemoryStore<T> {
    /// Create an empty store. `entity` is a human-readable name used
    /// only in error messages (e.g. `"Node"`).
    pub fn new(entity: &'static str) -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            entity,
            rows: RwLock::new(HashMap::new()),
            events: tx,
        }
    }

    fn lock_read(&self) -> StorageResult<std::sync::RwLockReadGuard<'_, HashMap<Uid, T>>> {
        self.rows
            .read()
            .map_err(|e| StorageError::Database(format!("lock error: {e}")))
    }

    fn lock_write(&self) -> StorageResult<std::sync::RwLockWriteGuard<'_, HashMap<Uid, T>>> {
        self.rows
            .write()
            .map_err(|e| StorageError::Database(format!("lock error: {e}")))
    }
}

impl<T: Clone + Send + Sync + 'static> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new("entity")
    }
}

impl<T: Clone + Send + Sync + 'static> TypedStore<T> for MemoryStore<T> {
    fn list(&self) -> StorageResult<Vec<T>> {
        Ok(self.lock_read()?.values().cloned().collect())
    }

    fn get(&self, key: &Uid) -> StorageResult<Option<T>> {
        Ok(self.lock_read()?.get(key).cloned())
    }

    fn put(&self, key: Uid, value: T) -> StorageResult<bool> {
        let created = {
            let mut rows = self.lock_write()?;
            let created = !rows.contains_key(&key);
            rows.insert(key, value.clone());
            created
        };
        let kind = if created {
            EventKind::Create
        } else {
            EventKind::Update
        };
        // A send error just means nobody is subscribed right now.
        let _ = self.events.send(StorageEvent {
            kind,
            object: value,
        });
        Ok(created)
    }

    fn delete(&self, key: &Uid) -> StorageResult<bool> {
        let removed = self.lock_write()?.remove(key);
        match removed {
            Some(object) => {
                let _ = self.events.send(StorageEvent {
                    kind: EventKind::Delete,
                    object,
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn count(&self) -> StorageResult<usize> {
        Ok(self.lock_read()?.len())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent<T>> {
        self.events.subscribe()
    }
}

impl<T> std::fmt::Debug for MemoryStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").field("entity", &self.entity).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_reports_create_then_update() {
        let store: MemoryStore<i32> = MemoryStore::new("test");
        let key = Uid::new();
        assert!(store.put(key, 1).unwrap());
        assert!(!store.put(key, 2).unwrap());
        assert_eq!(store.get(&key).unwrap(), Some(2));
    }

    #[test]
    fn delete_reports_presence() {
        let store: MemoryStore<i32> = MemoryStore::new("test");
        let key = Uid::new();
        assert!(!store.delete(&key).unwrap());
        store.put(key, 1).unwrap();
        assert!(store.delete(&key).unwrap());
        assert_eq!(store.get(&key).unwrap(), None);
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let store: MemoryStore<i32> = MemoryStore::new("test");
        let mut rx = store.subscribe();
        let key = Uid::new();
        store.put(key, 42).unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Create);
        assert_eq!(event.object, 42);
    }

    #[test]
    fn list_and_count_agree() {
        let store: MemoryStore<i32> = MemoryStore::new("test");
        for i in 0..5 {
            store.put(Uid::new(), i).unwrap();
        }
        assert_eq!(store.count().unwrap(), 5);
        assert_eq!(store.list().unwrap().len(), 5);
    }
}
