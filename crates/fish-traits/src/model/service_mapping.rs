use chrono::{DateTime, Utc};
use fish_base::uid::Uid;
use serde::{Deserialize, Serialize};

/// Maps an Application to a service name used by proxy collaborators.
/// Opaque to the core: carried and replicated, never interpreted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceMapping {
    pub uid: Uid,
    pub application_uid: Uid,
    pub service_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
