//! The aggregate `Storage` handle: one [`TypedStore`] per collection
//! named in `SPEC_FULL.md` §4.1, plus the `Cluster` singleton file.
//! Acquired once at node start and closed on shutdown with a
//! best-effort compaction, per the same spec section.

use std::path::Path;
use std::sync::Arc;

use fish_traits::model::{
    Application, ApplicationResource, ApplicationState, ApplicationTask, Label, Location, Node,
    Resource, ServiceMapping, Vote,
};
use redb::{Database, TableDefinition};

use crate::error::{StorageError, StorageResult};
use crate::memory::MemoryStore;
use crate::redb_store::RedbStore;
use crate::typed_store::TypedStore;

const NODE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");
const LABEL_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("labels");
const APPLICATION_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("applications");
const APPLICATION_STATE_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("application_states");
const APPLICATION_RESOURCE_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("application_resources");
const APPLICATION_TASK_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("application_tasks");
const VOTE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("votes");
const SERVICE_MAPPING_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("service_mappings");
const LOCATION_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("locations");
const RESOURCE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("resources");

/// Process-wide storage handle bundling every typed collection.
pub struct Storage {
    pub nodes: Arc<dyn TypedStore<Node>>,
    pub labels: Arc<dyn TypedStore<Label>>,
    pub applications: Arc<dyn TypedStore<Application>>,
    pub application_states: Arc<dyn TypedStore<ApplicationState>>,
    pub application_resources: Arc<dyn TypedStore<ApplicationResource>>,
    pub application_tasks: Arc<dyn TypedStore<ApplicationTask>>,
    pub votes: Arc<dyn TypedStore<Vote>>,
    pub service_mappings: Arc<dyn TypedStore<ServiceMapping>>,
    pub locations: Arc<dyn TypedStore<Location>>,
    pub resources: Arc<dyn TypedStore<Resource>>,
    backend_name: &'static str,
    db: Option<Arc<Database>>,
}

impl Storage {
    /// An in-memory, process-local store. Used for tests and as the
    /// default when no data directory is configured.
    pub fn memory() -> Self {
        Self {
            nodes: Arc::new(MemoryStore::new("Node")),
            labels: Arc::new(MemoryStore::new("Label")),
            applications: Arc::new(MemoryStore::new("Application")),
            application_states: Arc::new(MemoryStore::new("ApplicationState")),
            application_resources: Arc::new(MemoryStore::new("ApplicationResource")),
            application_tasks: Arc::new(MemoryStore::new("ApplicationTask")),
            votes: Arc::new(MemoryStore::new("Vote")),
            service_mappings: Arc::new(MemoryStore::new("ServiceMapping")),
            locations: Arc::new(MemoryStore::new("Location")),
            resources: Arc::new(MemoryStore::new("Resource")),
            backend_name: "memory",
            db: None,
        }
    }

    /// Open (or create) a durable `redb`-backed store at `path`.
    pub fn redb(path: impl AsRef<Path>) -> StorageResult<Self> {
        let db = Arc::new(Database::create(path)?);
        Ok(Self {
            nodes: Arc::new(RedbStore::new(db.clone(), NODE_TABLE)?),
            labels: Arc::new(RedbStore::new(db.clone(), LABEL_TABLE)?),
            applications: Arc::new(RedbStore::new(db.clone(), APPLICATION_TABLE)?),
            application_states: Arc::new(RedbStore::new(db.clone(), APPLICATION_STATE_TABLE)?),
            application_resources: Arc::new(RedbStore::new(
                db.clone(),
                APPLICATION_RESOURCE_TABLE,
            )?),
            application_tasks: Arc::new(RedbStore::new(db.clone(), APPLICATION_TASK_TABLE)?),
            votes: Arc::new(RedbStore::new(db.clone(), VOTE_TABLE)?),
            service_mappings: Arc::new(RedbStore::new(db.clone(), SERVICE_MAPPING_TABLE)?),
            locations: Arc::new(RedbStore::new(db.clone(), LOCATION_TABLE)?),
            resources: Arc::new(RedbStore::new(db.clone(), RESOURCE_TABLE)?),
            backend_name: "redb",
            db: Some(db),
        })
    }

    /// Backend name, surfaced for logging.
    pub fn backend_name(&self) -> &'static str {
        self.backend_name
    }

    /// Create a `Node`, enforcing the `(name)`/`(pubkey)` uniqueness
    /// invariant (`SPEC_FULL.md` §4) that the generic `TypedStore`
    /// contract alone cannot express.
    pub fn put_node(&self, node: Node) -> StorageResult<bool> {
        for existing in self.nodes.list()? {
            if existing.uid == node.uid {
                continue;
            }
            if existing.name == node.name {
                return Err(StorageError::Conflict {
                    entity_type: "Node",
                    key: format!("name={}", node.name),
                });
            }
            if existing.pubkey == node.pubkey {
                return Err(StorageError::Conflict {
                    entity_type: "Node",
                    key: format!("pubkey={}", node.pubkey),
                });
            }
        }
        self.nodes.put(node.uid, node)
    }

    /// Create an `ApplicationResource`, enforcing "at most one per
    /// Application" (`SPEC_FULL.md` §4/§8).
    pub fn put_application_resource(
        &self,
        resource: ApplicationResource,
    ) -> StorageResult<bool> {
        for existing in self.application_resources.list()? {
            if existing.application_uid == resource.application_uid
                && existing.uid != resource.uid
            {
                return Err(StorageError::Conflict {
                    entity_type: "ApplicationResource",
                    key: format!("application_uid={}", resource.application_uid),
                });
            }
        }
        self.application_resources.put(resource.uid, resource)
    }

    /// Best-effort compaction on shutdown. A no-op for the in-memory
    /// backend, and a no-op for `redb` too: compaction requires
    /// exclusive access to the database, which the shared `Arc`
    /// handles held by each collection's `RedbStore` preclude while
    /// any collection is still reachable. Left as a hook for a
    /// deployment that wants to compact during a maintenance window
    /// with all collections dropped first.
    pub fn compact(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fish_base::uid::Uid;

    fn sample_node(name: &str, pubkey: &str) -> Node {
        Node {
            uid: Uid::new(),
            name: name.into(),
            pubkey: pubkey.into(),
            address: "127.0.0.1:8080".into(),
            location: "local".into(),
            last_ping: fish_base::time::now(),
            multitenancy: false,
            maintenance: false,
            created_at: fish_base::time::now(),
            updated_at: fish_base::time::now(),
        }
    }

    #[test]
    fn duplicate_node_name_is_conflict() {
        let storage = Storage::memory();
        storage.put_node(sample_node("a", "key-a")).unwrap();
        let err = storage.put_node(sample_node("a", "key-b")).unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }));
    }

    #[test]
    fn duplicate_node_pubkey_is_conflict() {
        let storage = Storage::memory();
        storage.put_node(sample_node("a", "key-a")).unwrap();
        let err = storage.put_node(sample_node("b", "key-a")).unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }));
    }

    #[test]
    fn at_most_one_resource_per_application() {
        let storage = Storage::memory();
        let app_uid = Uid::new();
        let resource = ApplicationResource {
            uid: Uid::new(),
            application_uid: app_uid,
            identifier: "i-1".into(),
            ip_addr: None,
            hw_addr: None,
            authentication: None,
            timeout: None,
            metadata: serde_json::json!({}),
            created_at: fish_base::time::now(),
            updated_at: fish_base::time::now(),
        };
        storage.put_application_resource(resource.clone()).unwrap();
        let mut second = resource;
        second.uid = Uid::new();
        let err = storage.put_application_resource(second).unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }));
    }
}
