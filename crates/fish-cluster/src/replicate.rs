//! Bridges the nine syncable domain collections to/from mesh
//! [`Message`]s. Grounded on `SPEC_FULL.md`'s design note replacing the
//! source's ORM create/update hooks with "explicit writes-then-publish":
//! `fish-storage` emits a [`StorageEvent`](fish_storage::event::StorageEvent)
//! after every mutation, and this module is the one place that turns
//! those events into outbound [`Message`]s and, symmetrically, turns
//! inbound `Message`s into `Storage`/`Engine` writes.

use std::sync::Arc;

use fish_engine::lifecycle::Engine;
use fish_storage::event::EventKind;
use fish_storage::storage::Storage;
use fish_storage::typed_store::TypedStore;
use fish_traits::model::{
    Application, ApplicationState, ApplicationTask, Label, Location, Node, Resource,
    ServiceMapping, Vote,
};
use serde_json::Value;

use fish_base::uid::Uid;

use crate::error::{ClusterError, ClusterResult};
use crate::hub::Hub;
use crate::message::{kind, Message, RESP_DELETE, RESP_SYNC};

/// Apply one incoming [`Message`] to local state: bulk-sync
/// collection messages (`Resp=sync`, `data` an array) are unpacked
/// element by element, steady-state deletes (`Resp=delete`) remove
/// the named row, and everything else is a single-object upsert.
pub async fn apply_message(
    storage: &Storage,
    engine: &Arc<Engine>,
    message: &Message,
) -> ClusterResult<()> {
    match message.resp.as_deref() {
        Some(RESP_SYNC) => {
            let rows = message
                .data
                .as_array()
                .ok_or_else(|| ClusterError::Malformed("sync payload was not an array".into()))?;
            for row in rows {
                apply_incoming(storage, engine, &message.kind, row).await?;
            }
            Ok(())
        }
        Some(RESP_DELETE) => apply_delete(storage, engine, &message.kind, &message.data),
        _ => apply_incoming(storage, engine, &message.kind, &message.data).await,
    }
}

/// Remove the row identified by the uid carried in `data` from the
/// collection named by `kind_name`. `Application` has no delete path
/// (immutable once created, per `SPEC_FULL.md` §4) and is rejected.
fn apply_delete(
    _storage: &Storage,
    _engine: &Arc<Engine>,
    kind_name: &str,
    data: &Value,
) -> ClusterResult<()> {
    let uid: Uid =
        serde_json::from_value(data.clone()).map_err(|e| ClusterError::Malformed(e.to_string()))?;
    let storage = _storage;
    let deleted = match kind_name {
        kind::NODE => storage.nodes.delete(&uid)?,
        kind::LABEL => storage.labels.delete(&uid)?,
        kind::APPLICATION_TASK => storage.application_tasks.delete(&uid)?,
        kind::SERVICE_MAPPING => storage.service_mappings.delete(&uid)?,
        kind::VOTE => storage.votes.delete(&uid)?,
        kind::LOCATION => storage.locations.delete(&uid)?,
        kind::RESOURCE => storage.resources.delete(&uid)?,
        kind::APPLICATION | kind::APPLICATION_STATE => {
            return Err(ClusterError::Malformed(format!(
                "{kind_name} records are append-only and cannot be deleted over the mesh"
            )))
        }
        other => {
            return Err(ClusterError::Malformed(format!(
                "unknown syncable type {other}"
            )))
        }
    };
    if !deleted {
        debug_missing_delete(kind_name, &uid);
    }
    Ok(())
}

fn debug_missing_delete(kind_name: &str, uid: &Uid) {
    tracing::debug!(kind = kind_name, %uid, "delete for unknown row, already absent locally");
}

/// Apply one replicated object of type `kind_name` into local state.
/// `Application`/`ApplicationState` route through the [`Engine`]'s
/// ingest path so out-of-order arrival and worker-spawning are
/// handled exactly as they are for locally originated writes
/// (`SPEC_FULL.md` §5.3/§6); every other collection is a plain
/// last-writer-wins `Storage::put`.
async fn apply_incoming(
    storage: &Storage,
    engine: &Arc<Engine>,
    kind_name: &str,
    data: &Value,
) -> ClusterResult<()> {
    match kind_name {
        kind::NODE => {
            let node: Node = serde_json::from_value(data.clone())
                .map_err(|e| ClusterError::Malformed(e.to_string()))?;
            // A peer's own record always wins on its own uid; the
            // fingerprint-reuse check happens at handshake time, not
            // here, since by the time a Node is replicated it has
            // already passed that gate on whichever node first saw it.
            storage.nodes.put(node.uid, node)?;
        }
        kind::LABEL => {
            let label: Label = serde_json::from_value(data.clone())
                .map_err(|e| ClusterError::Malformed(e.to_string()))?;
            storage.labels.put(label.uid, label)?;
        }
        kind::APPLICATION => {
            let application: Application = serde_json::from_value(data.clone())
                .map_err(|e| ClusterError::Malformed(e.to_string()))?;
            engine.ingest_application(application)?;
        }
        kind::APPLICATION_STATE => {
            let state: ApplicationState = serde_json::from_value(data.clone())
                .map_err(|e| ClusterError::Malformed(e.to_string()))?;
            engine.ingest_application_state(state)?;
        }
        kind::APPLICATION_TASK => {
            let task: ApplicationTask = serde_json::from_value(data.clone())
                .map_err(|e| ClusterError::Malformed(e.to_string()))?;
            storage.application_tasks.put(task.uid, task)?;
        }
        kind::SERVICE_MAPPING => {
            let mapping: ServiceMapping = serde_json::from_value(data.clone())
                .map_err(|e| ClusterError::Malformed(e.to_string()))?;
            storage.service_mappings.put(mapping.uid, mapping)?;
        }
        kind::VOTE => {
            let vote: Vote = serde_json::from_value(data.clone())
                .map_err(|e| ClusterError::Malformed(e.to_string()))?;
            storage.votes.put(vote.uid, vote)?;
        }
        kind::LOCATION => {
            let location: Location = serde_json::from_value(data.clone())
                .map_err(|e| ClusterError::Malformed(e.to_string()))?;
            storage.locations.put(location.uid, location)?;
        }
        kind::RESOURCE => {
            let resource: Resource = serde_json::from_value(data.clone())
                .map_err(|e| ClusterError::Malformed(e.to_string()))?;
            storage.resources.put(resource.uid, resource)?;
        }
        other => {
            return Err(ClusterError::Malformed(format!(
                "unknown syncable type {other}"
            )))
        }
    }
    Ok(())
}

/// One `(kind, json-array)` pair per non-empty collection, in the
/// fixed order `SPEC_FULL.md` §5.5 streams them during bulk sync.
/// Collections with zero rows are omitted, matching spec.md §4.5
/// step 3 ("one message per non-empty collection").
pub fn collect_all(storage: &Storage) -> ClusterResult<Vec<(&'static str, Value)>> {
    let mut out = Vec::new();
    push_if_non_empty(&mut out, kind::NODE, storage.nodes.list()?)?;
    push_if_non_empty(&mut out, kind::LABEL, storage.labels.list()?)?;
    push_if_non_empty(&mut out, kind::APPLICATION, storage.applications.list()?)?;
    push_if_non_empty(
        &mut out,
        kind::APPLICATION_STATE,
        storage.application_states.list()?,
    )?;
    push_if_non_empty(
        &mut out,
        kind::APPLICATION_TASK,
        storage.application_tasks.list()?,
    )?;
    push_if_non_empty(
        &mut out,
        kind::SERVICE_MAPPING,
        storage.service_mappings.list()?,
    )?;
    push_if_non_empty(&mut out, kind::VOTE, storage.votes.list()?)?;
    push_if_non_empty(&mut out, kind::LOCATION, storage.locations.list()?)?;
    push_if_non_empty(&mut out, kind::RESOURCE, storage.resources.list()?)?;
    Ok(out)
}

fn push_if_non_empty<T: serde::Serialize>(
    out: &mut Vec<(&'static str, Value)>,
    kind_name: &'static str,
    rows: Vec<T>,
) -> ClusterResult<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let value =
        serde_json::to_value(rows).map_err(|e| ClusterError::Malformed(e.to_string()))?;
    out.push((kind_name, value));
    Ok(())
}

/// Spawn one forwarding task per syncable collection: each subscribes
/// to that collection's [`fish_storage::event::StorageEvent`] stream
/// and turns every `Create`/`Update` into a `Hub::broadcast_upsert`
/// and every `Delete` into a `Hub::broadcast_delete`. This is the
/// "explicit writes-then-publish" bridge `SPEC_FULL.md` §9 substitutes
/// for the source's ORM create/update hooks: nothing here special-cases
/// whether the write originated locally or from an inbound mesh frame,
/// so a frame applied via [`apply_message`] is naturally rebroadcast
/// on its way back out, same as the per-peer sum-cache would allow for
/// any genuinely new message.
pub fn spawn_local_bridge(storage: &Storage, hub: Hub) {
    spawn_one(storage.nodes.clone(), kind::NODE, |n: &Node| n.uid, hub.clone());
    spawn_one(storage.labels.clone(), kind::LABEL, |l: &Label| l.uid, hub.clone());
    spawn_one(
        storage.applications.clone(),
        kind::APPLICATION,
        |a: &Application| a.uid,
        hub.clone(),
    );
    spawn_one(
        storage.application_states.clone(),
        kind::APPLICATION_STATE,
        |s: &ApplicationState| s.uid,
        hub.clone(),
    );
    spawn_one(
        storage.application_tasks.clone(),
        kind::APPLICATION_TASK,
        |t: &ApplicationTask| t.uid,
        hub.clone(),
    );
    spawn_one(
        storage.service_mappings.clone(),
        kind::SERVICE_MAPPING,
        |m: &ServiceMapping| m.uid,
        hub.clone(),
    );
    spawn_one(storage.votes.clone(), kind::VOTE, |v: &Vote| v.uid, hub.clone());
    spawn_one(
        storage.locations.clone(),
        kind::LOCATION,
        |l: &Location| l.uid,
        hub.clone(),
    );
    spawn_one(storage.resources.clone(), kind::RESOURCE, |r: &Resource| r.uid, hub);
}

fn spawn_one<T>(
    store: Arc<dyn TypedStore<T>>,
    kind_name: &'static str,
    uid_of: fn(&T) -> Uid,
    hub: Hub,
) where
    T: Clone + Send + Sync + serde::Serialize + 'static,
{
    let mut events = store.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match event.kind {
                    EventKind::Create | EventKind::Update => {
                        let Ok(value) = serde_json::to_value(&event.object) else {
                            continue;
                        };
                        hub.broadcast_upsert(kind_name, value).await;
                    }
                    EventKind::Delete => {
                        hub.broadcast_delete(kind_name, uid_of(&event.object)).await;
                    }
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use fish_base::uid::Uid;

    #[tokio::test]
    async fn apply_incoming_node_writes_storage() {
        let storage = Storage::memory();
        let node = Node {
            uid: Uid::new(),
            name: "peer-a".into(),
            pubkey: "fingerprint-a".into(),
            address: "10.0.0.2:8080".into(),
            location: "us-west".into(),
            last_ping: fish_base::time::now(),
            multitenancy: false,
            maintenance: false,
            created_at: fish_base::time::now(),
            updated_at: fish_base::time::now(),
        };
        let data = serde_json::to_value(&node).unwrap();
        let engine_storage = Arc::new(Storage::memory());
        let engine = Arc::new(
            fish_engine::lifecycle::EngineBuilder::new()
                .with_storage(engine_storage.clone())
                .with_local_node(Uid::new())
                .build()
                .unwrap(),
        );
        let message = Message::object_upsert(kind::NODE, data);
        apply_message(&storage, &engine, &message).await.unwrap();
        assert_eq!(storage.nodes.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn apply_message_delete_removes_row() {
        let storage = Storage::memory();
        let location = Location {
            uid: Uid::new(),
            tag: "us-east".into(),
            description: None,
            created_at: fish_base::time::now(),
            updated_at: fish_base::time::now(),
        };
        storage.locations.put(location.uid, location.clone()).unwrap();
        let engine = Arc::new(
            fish_engine::lifecycle::EngineBuilder::new()
                .with_storage(Arc::new(Storage::memory()))
                .with_local_node(Uid::new())
                .build()
                .unwrap(),
        );
        let message = Message::object_delete(kind::LOCATION, location.uid);
        apply_message(&storage, &engine, &message).await.unwrap();
        assert!(storage.locations.get(&location.uid).unwrap().is_none());
    }

    #[tokio::test]
    async fn apply_message_bulk_sync_unpacks_array() {
        let storage = Storage::memory();
        let a = Location {
            uid: Uid::new(),
            tag: "a".into(),
            description: None,
            created_at: fish_base::time::now(),
            updated_at: fish_base::time::now(),
        };
        let b = Location {
            uid: Uid::new(),
            tag: "b".into(),
            description: None,
            created_at: fish_base::time::now(),
            updated_at: fish_base::time::now(),
        };
        let engine = Arc::new(
            fish_engine::lifecycle::EngineBuilder::new()
                .with_storage(Arc::new(Storage::memory()))
                .with_local_node(Uid::new())
                .build()
                .unwrap(),
        );
        let message = Message::sync_collection(
            kind::LOCATION,
            serde_json::to_value(vec![a, b]).unwrap(),
        );
        apply_message(&storage, &engine, &message).await.unwrap();
        assert_eq!(storage.locations.list().unwrap().len(), 2);
    }

    #[test]
    fn collect_all_omits_empty_collections() {
        let storage = Storage::memory();
        let collected = collect_all(&storage).unwrap();
        assert!(collected.is_empty());
    }

    #[test]
    fn collect_all_includes_non_empty_collections() {
        let storage = Storage::memory();
        let location = Location {
            uid: Uid::new(),
            tag: "us-east".into(),
            description: None,
            created_at: fish_base::time::now(),
            updated_at: fish_base::time::now(),
        };
        storage.locations.put(location.uid, location).unwrap();
        let collected = collect_all(&storage).unwrap();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].0, kind::LOCATION);
    }
}
