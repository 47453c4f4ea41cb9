//! Per-mutation events emitted to subscribers (`SPEC_FULL.md` §5.1).

/// What kind of mutation produced a [`StorageEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Create,
    Update,
    Delete,
}

/// One change notification. `object` is the post-mutation value for
/// `Create`/`Update`, and the pre-deletion value for `Delete`.
#[derive(Debug, Clone)]
pub struct StorageEvent<T> {
    pub kind: EventKind,
    pub object: T,
}

/// Default broadcast channel capacity for a collection's event stream.
/// Sized generously since subscribers that fall behind are expected to
/// re-`list` rather than rely on catching every event.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;
