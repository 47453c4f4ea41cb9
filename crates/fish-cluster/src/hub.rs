//! The cluster hub: owns the peer client set and dispatches inbound
//! and locally originated messages, realizing spec.md §5's "the hub's
//! client set is single-writer" guarantee as a single dispatcher task
//! draining an `mpsc` command channel. Grounded on
//! `convex_server::websocket::WebSocketState`'s `broadcast::Sender` +
//! `AtomicUsize` counter shape, generalized from one-way broadcast
//! fan-out to a full mesh hub with per-client command channels and
//! per-client + hub-wide dedup (`SPEC_FULL.md` §5.5).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use fish_base::uid::Uid;
use fish_engine::lifecycle::Engine;
use fish_storage::storage::Storage;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::message::Message;
use crate::replicate::apply_message;
use crate::sumcache::SumCache;

/// Per-peer admission timeout for queuing a broadcast payload
/// (`SPEC_FULL.md` §5.5/§6): a stalled client is dropped rather than
/// allowed to block the dispatcher.
pub const BROADCAST_ADMISSION_TIMEOUT: Duration = Duration::from_millis(100);

/// Mesh-wide tunables (spec.md §4.5).
#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    pub max_clients: usize,
    pub min_remote_loc_clients: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_clients: 8,
            min_remote_loc_clients: 1,
        }
    }
}

/// A connected peer as seen by the hub: an outbound queue feeding its
/// write pump, plus the per-client dedup cache that decides whether a
/// rebroadcast is actually new information to that peer.
struct PeerHandle {
    location: String,
    outbound: mpsc::Sender<Message>,
    sums: Arc<SumCache>,
}

enum HubCommand {
    Register {
        node_uid: Uid,
        location: String,
        outbound: mpsc::Sender<Message>,
        reply: oneshot::Sender<Arc<SumCache>>,
    },
    Remove {
        node_uid: Uid,
    },
    Inbound {
        from: Uid,
        message: Message,
    },
    BroadcastLocal {
        message: Message,
    },
}

/// Cloneable handle to the hub's dispatcher task. Every peer pump and
/// every local storage-change bridge holds one of these; the
/// dispatcher itself owns the only mutable view of the peer set.
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::Sender<HubCommand>,
    pub cluster_uid: Uid,
    pub local_node: Uid,
    peer_count: Arc<AtomicU64>,
}

impl Hub {
    /// Spawn the dispatcher task and return a handle to it.
    pub fn spawn(
        storage: Arc<Storage>,
        engine: Arc<Engine>,
        local_node: Uid,
        cluster_uid: Uid,
        config: HubConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let peer_count = Arc::new(AtomicU64::new(0));
        let hub = Hub {
            commands: tx,
            cluster_uid,
            local_node,
            peer_count: peer_count.clone(),
        };
        tokio::spawn(run_dispatcher(rx, storage, engine, config, peer_count));
        hub
    }

    /// Register a freshly accepted/connected peer, returning its
    /// per-client sum-cache for the caller's read pump to consult
    /// before forwarding each inbound frame to [`Hub::handle_inbound`].
    pub async fn register(
        &self,
        node_uid: Uid,
        location: String,
        outbound: mpsc::Sender<Message>,
    ) -> Arc<SumCache> {
        let (reply, reply_rx) = oneshot::channel();
        let _ = self
            .commands
            .send(HubCommand::Register {
                node_uid,
                location,
                outbound,
                reply,
            })
            .await;
        reply_rx.await.unwrap_or_else(|_| Arc::new(SumCache::new()))
    }

    /// Drop a peer that disconnected or failed liveness checks.
    pub async fn remove(&self, node_uid: Uid) {
        let _ = self.commands.send(HubCommand::Remove { node_uid }).await;
    }

    /// Hand a frame received from `from` to the dispatcher: applied
    /// to local state (if newly seen) and rebroadcast to every other
    /// peer whose own cache hasn't seen it yet.
    pub async fn handle_inbound(&self, from: Uid, message: Message) {
        let _ = self.commands.send(HubCommand::Inbound { from, message }).await;
    }

    /// Broadcast a locally originated mutation to every connected peer
    /// (`SPEC_FULL.md` §5.5 steady-state replication).
    pub async fn broadcast_local(&self, message: Message) {
        let _ = self.commands.send(HubCommand::BroadcastLocal { message }).await;
    }

    /// Convenience wrapper for a single-object upsert.
    pub async fn broadcast_upsert(&self, kind_name: &'static str, object: Value) {
        self.broadcast_local(Message::object_upsert(kind_name, object)).await;
    }

    /// Convenience wrapper for a single-object delete.
    pub async fn broadcast_delete(&self, kind_name: &'static str, uid: Uid) {
        self.broadcast_local(Message::object_delete(kind_name, uid)).await;
    }

    pub fn peer_count(&self) -> u64 {
        self.peer_count.load(Ordering::Relaxed)
    }
}

async fn run_dispatcher(
    mut commands: mpsc::Receiver<HubCommand>,
    storage: Arc<Storage>,
    engine: Arc<Engine>,
    config: HubConfig,
    peer_count: Arc<AtomicU64>,
) {
    let peers: DashMap<Uid, PeerHandle> = DashMap::new();
    let global_sums = SumCache::new();
    info!("cluster hub dispatcher started");

    while let Some(command) = commands.recv().await {
        match command {
            HubCommand::Register {
                node_uid,
                location,
                outbound,
                reply,
            } => {
                if peers.len() >= config.max_clients {
                    warn!(%node_uid, max = config.max_clients, "at max_clients, registering anyway (inbound takes priority over outbound dial caps)");
                }
                let sums = Arc::new(SumCache::new());
                peers.insert(
                    node_uid,
                    PeerHandle {
                        location,
                        outbound,
                        sums: sums.clone(),
                    },
                );
                peer_count.store(peers.len() as u64, Ordering::Relaxed);
                info!(%node_uid, peers = peers.len(), "peer registered");
                let _ = reply.send(sums);
            }
            HubCommand::Remove { node_uid } => {
                if peers.remove(&node_uid).is_some() {
                    peer_count.store(peers.len() as u64, Ordering::Relaxed);
                    info!(%node_uid, peers = peers.len(), "peer removed");
                }
            }
            HubCommand::Inbound { from, message } => {
                if !global_sums.put(message.sum) {
                    debug!(sum = message.sum, "duplicate message, dropping");
                    continue;
                }
                if let Err(e) = apply_message(&storage, &engine, &message).await {
                    warn!(error = %e, kind = %message.kind, "failed to apply replicated message, will retry on redelivery");
                    global_sums.delete(message.sum);
                    continue;
                }
                rebroadcast(&peers, Some(from), &message).await;
            }
            HubCommand::BroadcastLocal { message } => {
                global_sums.put(message.sum);
                rebroadcast(&peers, None, &message).await;
            }
        }
    }
    info!("cluster hub dispatcher exiting, command channel closed");
}

/// Forward `message` to every peer except `origin`, consulting each
/// peer's own sum-cache and dropping the send after
/// [`BROADCAST_ADMISSION_TIMEOUT`] rather than blocking the
/// dispatcher on a stalled client (`SPEC_FULL.md` §5.5/§6).
async fn rebroadcast(peers: &DashMap<Uid, PeerHandle>, origin: Option<Uid>, message: &Message) {
    for entry in peers.iter() {
        let node_uid = *entry.key();
        if Some(node_uid) == origin {
            continue;
        }
        if !entry.value().sums.put(message.sum) {
            continue;
        }
        let outbound = entry.value().outbound.clone();
        let payload = message.clone();
        if timeout(BROADCAST_ADMISSION_TIMEOUT, outbound.send(payload))
            .await
            .is_err()
        {
            warn!(%node_uid, "broadcast admission timed out, peer is slow");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fish_traits::model::Location;

    #[tokio::test]
    async fn broadcast_local_reaches_registered_peer_once() {
        let storage = Arc::new(Storage::memory());
        let engine = Arc::new(
            fish_engine::lifecycle::EngineBuilder::new()
                .with_storage(storage.clone())
                .with_local_node(Uid::new())
                .build()
                .unwrap(),
        );
        let hub = Hub::spawn(storage, engine, Uid::new(), Uid::new(), HubConfig::default());

        let (tx, mut rx) = mpsc::channel(8);
        hub.register(Uid::new(), "us-east".into(), tx).await;

        let location = Location {
            uid: Uid::new(),
            tag: "us-east".into(),
            description: None,
            created_at: fish_base::time::now(),
            updated_at: fish_base::time::now(),
        };
        hub.broadcast_upsert(
            crate::message::kind::LOCATION,
            serde_json::to_value(&location).unwrap(),
        )
        .await;

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("message delivered")
            .expect("channel open");
        assert_eq!(received.kind, crate::message::kind::LOCATION);
    }

    #[tokio::test]
    async fn removed_peer_receives_nothing_further() {
        let storage = Arc::new(Storage::memory());
        let engine = Arc::new(
            fish_engine::lifecycle::EngineBuilder::new()
                .with_storage(storage.clone())
                .with_local_node(Uid::new())
                .build()
                .unwrap(),
        );
        let hub = Hub::spawn(storage, engine, Uid::new(), Uid::new(), HubConfig::default());

        let peer_id = Uid::new();
        let (tx, mut rx) = mpsc::channel(8);
        hub.register(peer_id, "us-east".into(), tx).await;
        hub.remove(peer_id).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        hub.broadcast_upsert(crate::message::kind::LOCATION, serde_json::json!({}))
            .await;
        assert!(tokio::time::timeout(Duration::from_millis(150), rx.recv())
            .await
            .is_err());
    }
}
