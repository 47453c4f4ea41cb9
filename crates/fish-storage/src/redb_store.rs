//! Durable backend. Grounded on
//! `convex_storage::redb::storage::RedbStorage`: one
//! `redb::TableDefinition<&str, &[u8]>` per collection, values
//! serialized as JSON (matching the teacher's serde-based encoding
//! rather than inventing a binary format this spec never asked for).

use std::sync::Arc;

use fish_base::uid::Uid;
use redb::{Database, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::StorageResult;
use crate::event::{EventKind, StorageEvent, EVENT_CHANNEL_CAPACITY};
use crate::typed_store::TypedStore;

/// A collection backed by a single `redb` table, keyed by the
/// string form of a [`Uid`].
pub struct RedbStore<T> {
    db: Arc<Database>,
    table: TableDefinition<'static, &'static str, &'static [u8]>,
    events: broadcast::Sender<StorageEvent<T>>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static> RedbStore<T> {
    /// Wrap an already-open database handle and table definition. The
    /// table is created if it does not yet exist.
    pub fn new(
        db: Arc<Database>,
        table: TableDefinition<'static, &'static str, &'static [u8]>,
    ) -> StorageResult<Self> {
        {
            let txn = db.begin_write()?;
            {
                txn.open_table(table)?;
            }
            txn.commit()?;
        }
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            db,
            table,
            events: tx,
            _marker: std::marker::PhantomData,
        })
    }
}

impl<T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static> TypedStore<T>
    for RedbStore<T>
{
    fn list(&self) -> StorageResult<Vec<T>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(self.table)?;
        let mut out = Vec::new();
        for row in table.iter()? {
            let (_, value) = row?;
            out.push(serde_json::from_slice(value.value())?);
        }
        Ok(out)
    }

    fn get(&self, key: &Uid) -> StorageResult<Option<T>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(self.table)?;
        let key = key.to_string();
        match table.get(key.as_str())? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    fn put(&self, key: Uid, value: T) -> StorageResult<bool> {
        let key_str = key.to_string();
        let encoded = serde_json::to_vec(&value)?;
        let created = {
            let txn = self.db.begin_write()?;
            let created = {
                let mut table = txn.open_table(self.table)?;
                let existed = table.get(key_str.as_str())?.is_some();
                table.insert(key_str.as_str(), encoded.as_slice())?;
                !existed
            };
            txn.commit()?;
            created
        };
        let kind = if created {
            EventKind::Create
        } else {
            EventKind::Update
        };
        let _ = self.events.send(StorageEvent {
            kind,
            object: value,
        });
        Ok(created)
    }

    fn delete(&self, key: &Uid) -> StorageResult<bool> {
        let key_str = key.to_string();
        let removed = {
            let txn = self.db.begin_write()?;
            let removed = {
                let mut table = txn.open_table(self.table)?;
                table.remove(key_str.as_str())?
            };
            txn.commit()?;
            removed
        };
        match removed {
            Some(value) => {
                let object = serde_json::from_slice(value.value())?;
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
        let txn = self.db.begin_read()?;
        let table = txn.open_table(self.table)?;
        Ok(table.len()? as usize)
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent<T>> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    const TEST_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("test");

    #[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
    struct Row {
        value: i32,
    }

    fn temp_db() -> Arc<Database> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.redb");
        // Leak the tempdir so the file survives for the test's duration;
        // acceptable in a throwaway test database.
        std::mem::forget(dir);
        Arc::new(Database::create(path).unwrap())
    }

    #[test]
    fn put_get_delete_round_trip() {
        let store: RedbStore<Row> = RedbStore::new(temp_db(), TEST_TABLE).unwrap();
        let key = Uid::new();
        assert!(store.put(key, Row { value: 7 }).unwrap());
        assert_eq!(store.get(&key).unwrap(), Some(Row { value: 7 }));
        assert!(store.delete(&key).unwrap());
        assert_eq!(store.get(&key).unwrap(), None);
    }

    #[test]
    fn put_reports_update_on_existing_key() {
        let store: RedbStore<Row> = RedbStore::new(temp_db(), TEST_TABLE).unwrap();
        let key = Uid::new();
        assert!(store.put(key, Row { value: 1 }).unwrap());
        assert!(!store.put(key, Row { value: 2 }).unwrap());
        assert_eq!(store.get(&key).unwrap(), Some(Row { value: 2 }));
    }
}
