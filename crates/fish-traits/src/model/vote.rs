use chrono::{DateTime, Utc};
use fish_base::uid::Uid;
use serde::{Deserialize, Serialize};

/// One node's entry in the election for `(ApplicationUID, round)`. At
/// most one per `(application_uid, node_uid, round)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub uid: Uid,
    pub application_uid: Uid,
    pub node_uid: Uid,
    pub round: u32,
    /// Random 64-bit rank; the capable vote with the lowest rank wins,
    /// ties broken by `node_uid`.
    pub rank: u64,
    /// Whether this node can host the Application, i.e. at least one
    /// `LabelDefinition` validated and matched this node's filter at
    /// the time of voting.
    pub capable: bool,
    pub created_at: DateTime<Utc>,
}
