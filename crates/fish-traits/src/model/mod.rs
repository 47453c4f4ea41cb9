//! Plain domain value types. Storage owns these exclusively; every
//! other component holds short-lived copies (`SPEC_FULL.md` §4).

mod application;
mod label;
mod location;
mod node;
mod resource;
mod service_mapping;
mod state;
mod task;
mod vote;

pub use application::Application;
pub use label::{Authentication, Disk, Label, LabelDefinition, Resources};
pub use location::Location;
pub use node::Node;
pub use resource::{ApplicationResource, Resource};
pub use service_mapping::ServiceMapping;
pub use state::{ApplicationState, Status};
pub use task::{ApplicationTask, TaskWhen};
pub use vote::Vote;

use chrono::{DateTime, Utc};
use fish_base::uid::Uid;
use serde::{Deserialize, Serialize};

/// The singleton cluster identity record (`SPEC_FULL.md` §4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    /// Identity of this cluster; all peers must agree on it to mesh.
    pub uid: Uid,
    /// Last replication watermark persisted to disk.
    pub updated_at: DateTime<Utc>,
}

impl Cluster {
    /// A fresh cluster identity, as generated the first time a node
    /// boots with an empty data directory.
    pub fn new() -> Self {
        Self {
            uid: Uid::new(),
            updated_at: fish_base::time::now(),
        }
    }
}

impl Default for Cluster {
    fn default() -> Self {
        Self::new()
    }
}
