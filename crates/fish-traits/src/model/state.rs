use chrono::{DateTime, Utc};
use fish_base::uid::Uid;
use serde::{Deserialize, Serialize};

/// Status of an [`Application`](super::Application) at a point in its
/// lifecycle. See `SPEC_FULL.md` §5.3 for the full transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    New,
    Elected,
    Allocated,
    Deallocate,
    Deallocated,
    Error,
    Recovered,
}

impl Status {
    /// Terminal statuses never have a later non-terminal entry for the
    /// same Application (`SPEC_FULL.md` §4 invariant).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Deallocated | Status::Error)
    }
}

/// One append-only entry in an Application's state log. The "latest"
/// state of an Application is the entry with the highest `created_at`,
/// ties broken by the writing node's UID — never trust arrival order,
/// since replication is eventually consistent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationState {
    pub uid: Uid,
    pub application_uid: Uid,
    pub status: Status,
    /// Human-readable detail, populated for `Error` and optionally for
    /// any other status.
    pub description: Option<String>,
    /// Node that wrote this entry; used for ordering ties and, for
    /// `Elected`, to record which node owns the Application.
    pub node_uid: Uid,
    pub created_at: DateTime<Utc>,
}

impl ApplicationState {
    /// Compare two entries for the same Application by the ordering
    /// rule in `SPEC_FULL.md` §6 ("Ordering guarantees"): `created_at`
    /// first, then `node_uid` as a tiebreaker.
    pub fn is_later_than(&self, other: &ApplicationState) -> bool {
        (self.created_at, self.node_uid) > (other.created_at, other.node_uid)
    }
}
