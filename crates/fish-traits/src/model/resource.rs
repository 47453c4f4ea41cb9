use chrono::{DateTime, Utc};
use fish_base::uid::Uid;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Authentication;

/// Produced on successful `Allocate`; at most one per Application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationResource {
    pub uid: Uid,
    pub application_uid: Uid,
    /// Driver-assigned identifier for the allocated resource.
    pub identifier: String,
    pub ip_addr: Option<String>,
    pub hw_addr: Option<String>,
    pub authentication: Option<Authentication>,
    /// Wall-clock expiration; past this, the engine triggers
    /// `ALLOCATED -> DEALLOCATE`.
    pub timeout: Option<DateTime<Utc>>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The driver-side record of a successful allocation, independent of
/// any one Application. `fish-driver-dedicated` uses this to track
/// leased dedicated hosts across the pool, separate from the
/// Application-facing [`ApplicationResource`] projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub uid: Uid,
    pub driver_name: String,
    pub identifier: String,
    pub zone: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
