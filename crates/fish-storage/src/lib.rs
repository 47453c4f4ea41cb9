//! Typed key/value collections with subscribe-on-change events.
//!
//! Grounded on `convex-storage`'s adapter-trait-plus-backends shape:
//! a [`TypedStore`] collection contract implemented by both
//! [`memory::MemoryStore`] (the default, in-process backend) and
//! [`redb_store::RedbStore`] (the durable backend), aggregated by
//! [`storage::Storage`] into the ten collections this spec names plus
//! the `Cluster` singleton file.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod cluster;
pub mod error;
pub mod event;
pub mod memory;
pub mod redb_store;
pub mod storage;
pub mod typed_store;

pub mod prelude {
    //! Convenience re-exports for downstream crates.
    pub use crate::error::{StorageError, StorageResult};
    pub use crate::event::{EventKind, StorageEvent};
    pub use crate::storage::Storage;
    pub use crate::typed_store::TypedStore;
}
