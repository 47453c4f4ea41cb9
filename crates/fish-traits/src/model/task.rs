use chrono::{DateTime, Utc};
use fish_base::uid::Uid;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// When an [`ApplicationTask`] runs relative to the driver's
/// allocate/deallocate calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskWhen {
    /// After the resource is allocated.
    Allocated,
    /// Before the driver's deallocate call (ordering matters: a
    /// snapshot/image task may need the still-live resource).
    Deallocate,
}

/// Side-work attached to an Application, keyed by `(name, when)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationTask {
    pub uid: Uid,
    pub application_uid: Uid,
    pub name: String,
    pub when: TaskWhen,
    pub options: Value,
    /// Populated once the task has run; absent while pending.
    pub result: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
