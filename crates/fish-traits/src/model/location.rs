use chrono::{DateTime, Utc};
use fish_base::uid::Uid;
use serde::{Deserialize, Serialize};

/// A static lookup entry for a site tag, used by node filters and
/// mesh spread rules (`min_remote_loc_clients`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
    pub uid: Uid,
    pub tag: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
