//! Outbound peer connections. New relative to the teacher (the
//! teacher is server-only); grounded on `tokio-tungstenite`'s standard
//! `connect_async` client idiom. Dials a seed URL, runs the handshake
//! from [`crate::handshake`], then pumps frames through the
//! [`Hub`](crate::hub::Hub) until the socket errors, at which point an
//! auto-reconnect loop (1 Hz, `SPEC_FULL.md` §5.5) redials.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use fish_base::cancel::CancellationToken;
use fish_base::uid::Uid;
use fish_engine::lifecycle::Engine;
use fish_storage::storage::Storage;
use fish_traits::model::Node;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::error::{ClusterError, ClusterResult};
use crate::handshake::{self, SyncProgress, PING_INTERVAL, PONG_DEADLINE, WRITE_DEADLINE};
use crate::hub::Hub;
use crate::message::Message;
use crate::replicate::apply_message;

/// Spawn the reconnect-forever loop for one seed peer address. Runs
/// until `shutdown` is cancelled.
pub fn spawn_dialer(
    seed_addr: String,
    storage: Arc<Storage>,
    engine: Arc<Engine>,
    hub: Hub,
    local_node: Node,
    directory: PathBuf,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            if shutdown.is_cancelled().await {
                break;
            }
            match connect_once(&seed_addr, &storage, &engine, &hub, &local_node, &directory, &shutdown).await {
                Ok(()) => debug!(addr = %seed_addr, "peer connection ended cleanly"),
                Err(e) => warn!(addr = %seed_addr, error = %e, "peer connection failed"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(handshake::RECONNECT_INTERVAL) => {}
            }
        }
        info!(addr = %seed_addr, "dialer exiting");
    });
}

async fn connect_once(
    seed_addr: &str,
    storage: &Arc<Storage>,
    engine: &Arc<Engine>,
    hub: &Hub,
    local_node: &Node,
    directory: &Path,
    shutdown: &CancellationToken,
) -> ClusterResult<()> {
    let url = format!(
        "{}?uid={}",
        seed_addr.trim_end_matches('/'),
        hub.cluster_uid
    );
    let (stream, _response) = tokio_tungstenite::connect_async(&url)
        .await
        .map_err(|e| ClusterError::Transport(e.to_string()))?;
    info!(addr = %seed_addr, "dialed peer");

    let (mut write, mut read) = stream.split();

    // The sync watermark (`SPEC_FULL.md` §4 "Cluster ... `updated_at`
    // is the last replication watermark persisted to disk"), not the
    // timestamp of whatever Applications happen to be known locally.
    let cluster = fish_storage::cluster::load_or_create(directory)?;
    let last_sync = cluster.updated_at;

    for frame in handshake::initial_frames(local_node, last_sync) {
        send_frame(&mut write, &frame).await?;
    }

    // Keyed by a fresh id rather than `local_node.uid`: the hub's peer
    // map needs one distinct key per outbound connection, and the
    // responder's own `Node.uid` isn't known until its row arrives in
    // the bulk-sync `Node` collection (the protocol never sends it as
    // an explicit handshake reply, per `SPEC_FULL.md` §5.5).
    let connection_id = Uid::new();
    let (tx, mut rx) = mpsc::channel::<Message>(256);
    let sums = hub.register(connection_id, local_node.location.clone(), tx).await;
    let mut progress = SyncProgress::new();
    let mut ping_ticker = interval(PING_INTERVAL);
    let mut last_pong = tokio::time::Instant::now();
    let mut watermark_saved = false;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                hub.remove(connection_id).await;
                let _ = write.send(WsMessage::Close(None)).await;
                return Ok(());
            }
            _ = ping_ticker.tick() => {
                if last_pong.elapsed() > PONG_DEADLINE {
                    hub.remove(connection_id).await;
                    return Err(ClusterError::Transport("pong deadline exceeded".into()));
                }
                if timeout(WRITE_DEADLINE, write.send(WsMessage::Ping(Vec::new()))).await.is_err() {
                    hub.remove(connection_id).await;
                    return Err(ClusterError::Transport("ping write deadline exceeded".into()));
                }
            }
            outgoing = rx.recv() => {
                match outgoing {
                    Some(message) => {
                        if send_frame(&mut write, &message).await.is_err() {
                            hub.remove(connection_id).await;
                            return Err(ClusterError::Transport("write failed".into()));
                        }
                    }
                    None => {
                        hub.remove(connection_id).await;
                        return Ok(());
                    }
                }
            }
            incoming = read.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle_incoming_text(&text, storage, engine, hub, &sums, &mut progress, connection_id).await;
                        if !watermark_saved && progress.is_done() {
                            watermark_saved = true;
                            let advanced = fish_traits::model::Cluster {
                                uid: cluster.uid,
                                updated_at: fish_base::time::now(),
                            };
                            if let Err(e) = fish_storage::cluster::save(directory, &advanced) {
                                warn!(error = %e, "failed to persist sync watermark");
                            }
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => {
                        last_pong = tokio::time::Instant::now();
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        let _ = write.send(WsMessage::Pong(payload)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        hub.remove(connection_id).await;
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        hub.remove(connection_id).await;
                        return Err(ClusterError::Transport(e.to_string()));
                    }
                }
            }
        }
    }
}

async fn handle_incoming_text(
    text: &str,
    storage: &Arc<Storage>,
    engine: &Arc<Engine>,
    hub: &Hub,
    sums: &Arc<crate::sumcache::SumCache>,
    progress: &mut SyncProgress,
    connection_id: Uid,
) {
    let message = match Message::decode(text) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "dropping malformed frame");
            return;
        }
    };
    sums.put(message.sum);
    match message.kind.as_str() {
        crate::message::kind::COMPLETED => {
            if let Some(count) = message.data.get("count").and_then(|v| v.as_u64()) {
                progress.note_completed(count as usize);
            }
        }
        _ if message.resp.as_deref() == Some(crate::message::RESP_SYNC) => {
            progress.note_sync_message();
            if let Err(e) = apply_message(storage, engine, &message).await {
                warn!(error = %e, "failed to apply bulk sync collection");
            }
        }
        _ => {
            // `connection_id` (not the remote's real `Node.uid`, which
            // this side learns only from the bulk-sync `Node`
            // collection) is enough to let the hub skip echoing a
            // rebroadcast back down this same connection.
            hub.handle_inbound(connection_id, message).await;
        }
    }
}

async fn send_frame(
    write: &mut (impl SinkExt<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    message: &Message,
) -> ClusterResult<()> {
    let encoded = message.encode()?;
    timeout(WRITE_DEADLINE, write.send(WsMessage::Text(encoded)))
        .await
        .map_err(|_| ClusterError::Transport("write deadline exceeded".into()))?
        .map_err(|e| ClusterError::Transport(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{Hub, HubConfig};
    use fish_traits::model::Location;

    struct Fixture {
        storage: Arc<Storage>,
        engine: Arc<Engine>,
        hub: Hub,
        sums: Arc<crate::sumcache::SumCache>,
    }

    async fn fixture() -> Fixture {
        let storage = Arc::new(Storage::memory());
        let engine = Arc::new(
            fish_engine::lifecycle::EngineBuilder::new()
                .with_storage(storage.clone())
                .with_local_node(Uid::new())
                .build()
                .unwrap(),
        );
        let hub = Hub::spawn(
            storage.clone(),
            engine.clone(),
            Uid::new(),
            Uid::new(),
            HubConfig::default(),
        );
        let (tx, _rx) = mpsc::channel(1);
        let sums = hub.register(Uid::new(), "us-east".into(), tx).await;
        Fixture {
            storage,
            engine,
            hub,
            sums,
        }
    }

    fn location_message() -> Message {
        let location = Location {
            uid: Uid::new(),
            tag: "us-east".into(),
            description: None,
            created_at: fish_base::time::now(),
            updated_at: fish_base::time::now(),
        };
        Message::sync_collection(crate::message::kind::LOCATION, serde_json::to_value(vec![location]).unwrap())
    }

    #[tokio::test]
    async fn resp_sync_frame_advances_progress_and_applies_the_object() {
        let f = fixture().await;
        let mut progress = SyncProgress::new();

        let encoded = location_message().encode().unwrap();
        handle_incoming_text(&encoded, &f.storage, &f.engine, &f.hub, &f.sums, &mut progress, Uid::new()).await;

        assert!(!progress.is_done());
        assert_eq!(f.storage.locations.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn completed_with_wrong_count_does_not_report_done() {
        let f = fixture().await;
        let mut progress = SyncProgress::new();

        let sync_msg = location_message().encode().unwrap();
        handle_incoming_text(&sync_msg, &f.storage, &f.engine, &f.hub, &f.sums, &mut progress, Uid::new()).await;

        // Responder claims two sync messages were sent, but only one
        // arrived: progress must not report done.
        let completed = Message::completed(2).encode().unwrap();
        handle_incoming_text(&completed, &f.storage, &f.engine, &f.hub, &f.sums, &mut progress, Uid::new()).await;
        assert!(!progress.is_done());
    }

    #[tokio::test]
    async fn completed_with_matching_count_reports_done() {
        let f = fixture().await;
        let mut progress = SyncProgress::new();

        let sync_msg = location_message().encode().unwrap();
        handle_incoming_text(&sync_msg, &f.storage, &f.engine, &f.hub, &f.sums, &mut progress, Uid::new()).await;
        let completed = Message::completed(1).encode().unwrap();
        handle_incoming_text(&completed, &f.storage, &f.engine, &f.hub, &f.sums, &mut progress, Uid::new()).await;

        assert!(progress.is_done());
    }
}
