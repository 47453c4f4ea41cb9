//! The generic collection contract every backend implements once,
//! generalized from `convex_storage::adapter::StorageAdapter`'s
//! per-entity method list into a single generic trait — this spec's
//! ten collections share identical CRUD/subscribe semantics, so one
//! `TypedStore<T>` plays the role the teacher's `store_versioned<T>`
//! generic method plays for its one versioned-record concern.

use fish_base::uid::Uid;
use tokio::sync::broadcast;

use crate::error::StorageResult;
use crate::event::StorageEvent;

/// List/Get/Add/Delete/Subscribe over one typed collection.
///
/// Implementations must never block on a slow subscriber: `subscribe`
/// hands back a `broadcast::Receiver`, and a receiver that lags behind
/// simply misses events and must `list` again to resynchronize
/// (`SPEC_FULL.md` §5.1/§6).
pub trait TypedStore<T>: Send + Sync
where
    T: Clone + Send + Sync + 'static,
{
    /// All current values, in unspecified order.
    fn list(&self) -> StorageResult<Vec<T>>;

    /// A single value by key, or `None` if absent.
    fn get(&self, key: &Uid) -> StorageResult<Option<T>>;

    /// Create-or-replace. Returns whether this was a create (`true`)
    /// or an update of an existing key (`false`).
    fn put(&self, key: Uid, value: T) -> StorageResult<bool>;

    /// Remove a value by key. Returns whether a value was present.
    fn delete(&self, key: &Uid) -> StorageResult<bool>;

    /// Number of values currently stored.
    fn count(&self) -> StorageResult<usize>;

    /// Subscribe to future mutations. Past events are never replayed;
    /// callers that need the current contents must also call `list`.
    fn subscribe(&self) -> broadcast::Receiver<StorageEvent<T>>;
}
