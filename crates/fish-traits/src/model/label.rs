use std::collections::HashMap;

use chrono::{DateTime, Utc};
use fish_base::uid::Uid;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Immutable template keyed by `(name, version)`, describing how to
/// satisfy an [`Application`](super::Application) request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    pub uid: Uid,
    pub name: String,
    pub version: u32,
    /// Opaque metadata merged onto an Application's own metadata at
    /// allocation time; the Application wins on key conflicts.
    pub metadata: Value,
    /// Alternative ways to satisfy this Label; the engine picks the
    /// first one whose driver accepts it and has spare capacity.
    pub definitions: Vec<LabelDefinition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One alternative within a [`Label`]: a driver plus the resources it
/// should provision and the node filter restricting where it may run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelDefinition {
    pub driver_name: String,
    /// Opaque, driver-specific configuration.
    pub options: Value,
    pub resources: Resources,
    /// Node names or location tags this definition may run on; empty
    /// means any node is eligible.
    pub node_filter: Vec<String>,
}

/// Resource requirements and policy flags for one [`LabelDefinition`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resources {
    pub cpu: u32,
    /// RAM in megabytes.
    pub ram: u32,
    pub disks: HashMap<String, Disk>,
    /// Network tag, resolved by the driver against its own network
    /// configuration.
    pub network: Option<String>,
    pub authentication: Option<Authentication>,
    /// Whether this definition is willing to share a node with other
    /// tenants under the overbook rule.
    pub multitenancy: bool,
    pub cpu_overbook: bool,
    pub ram_overbook: bool,
}

/// One disk attached to an allocated resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Disk {
    /// Size in gigabytes.
    pub size: u32,
    #[serde(rename = "type")]
    pub disk_type: String,
    pub label: Option<String>,
    /// Source image/disk to clone from, if any.
    pub clone: Option<String>,
    /// Whether the disk should be reused across reallocations with the
    /// same label, rather than recreated.
    pub reuse: bool,
}

/// Requested access credentials for an allocated resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Authentication {
    pub username: String,
    pub port: u16,
    /// Whether the driver should generate a fresh key for this
    /// allocation rather than reuse a configured one.
    pub generate_key: bool,
}
