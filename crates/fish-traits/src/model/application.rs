use chrono::{DateTime, Utc};
use fish_base::uid::Uid;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A request to run a [`Label`](super::Label) somewhere in the
/// cluster. Immutable after create; everything that changes over its
/// lifetime lives in [`ApplicationState`](super::ApplicationState)
/// entries instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub uid: Uid,
    pub label_uid: Uid,
    /// Opaque metadata merged onto the Label's metadata at allocation
    /// time; this Application wins on key conflicts.
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
