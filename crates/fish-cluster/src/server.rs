//! Inbound mesh connections. Grounded on
//! `convex_server::websocket::{ws_handler, handle_socket}`'s
//! upgrade-then-split-then-select! shape, generalized from one-way
//! broadcast fan-out to full mesh participation: a peer that connects
//! here goes through the same handshake (`SPEC_FULL.md` §5.5) as one
//! dialed by [`crate::client`], just from the acceptor's side.
//!
//! Transport security is out of scope here (`SPEC_FULL.md` §5.5 Non-
//! goals): this module accepts plain `ws://` upgrades. The
//! fingerprint-registration and reused-fingerprint-rejection logic
//! against the presented `Node.pubkey` is still enforced, since that
//! check is independent of whether the transport itself is encrypted.
//!
//! TODO: substitute a `rustls`-backed TLS acceptor ahead of the axum
//! router once mTLS is in scope, and verify the peer certificate's CN
//! against `Node.name` here rather than trusting the handshake frame.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use fish_base::uid::Uid;
use fish_engine::lifecycle::Engine;
use fish_storage::storage::Storage;
use fish_traits::model::Node;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tracing::{info, warn};

use crate::handshake::{PING_INTERVAL, PONG_DEADLINE, WRITE_DEADLINE};
use crate::hub::Hub;
use crate::message::{kind, Message};

/// Shared state handed to the accept route via axum's `State` extractor.
#[derive(Clone)]
pub struct ClusterServerState {
    pub storage: Arc<Storage>,
    pub engine: Arc<Engine>,
    pub hub: Hub,
}

/// Mount the single `/cluster/v1/connect` accept route onto a router.
pub fn router(state: ClusterServerState) -> Router {
    Router::new()
        .route("/cluster/v1/connect", get(accept))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    uid: Option<String>,
}

async fn accept(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<ClusterServerState>,
) -> impl IntoResponse {
    let expected = state.hub.cluster_uid.to_string();
    if params.uid.as_deref() != Some(expected.as_str()) {
        warn!(presented = ?params.uid, expected, "rejecting connect with mismatched cluster uid");
        return axum::http::StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: ClusterServerState) {
    let (mut sender, mut receiver) = socket.split();

    let peer_node = match read_handshake_node(&mut receiver).await {
        Ok(node) => node,
        Err(e) => {
            warn!(error = %e, "peer did not present a valid Node handshake frame, closing");
            let _ = sender.send(WsMessage::Close(None)).await;
            return;
        }
    };

    if let Err(e) = register_peer_node(&state.storage, &peer_node) {
        warn!(error = %e, pubkey = %peer_node.pubkey, "rejecting peer, fingerprint conflict");
        let _ = sender.send(WsMessage::Close(None)).await;
        return;
    }

    info!(node = %peer_node.uid, name = %peer_node.name, "peer connected inbound");

    if let Err(e) = send_bulk_sync(&mut sender, &state.storage).await {
        warn!(error = %e, "failed to send bulk sync, dropping connection");
        return;
    }

    let (tx, mut rx) = mpsc::channel::<Message>(256);
    let sums = state.hub.register(peer_node.uid, peer_node.location.clone(), tx).await;
    let mut ping_ticker = interval(PING_INTERVAL);
    let mut last_pong = tokio::time::Instant::now();

    loop {
        tokio::select! {
            _ = ping_ticker.tick() => {
                if last_pong.elapsed() > PONG_DEADLINE {
                    break;
                }
                if timeout(WRITE_DEADLINE, sender.send(WsMessage::Ping(Vec::new()))).await.is_err() {
                    break;
                }
            }
            outgoing = rx.recv() => {
                match outgoing {
                    Some(message) => {
                        if send_frame(&mut sender, &message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle_incoming_text(&text, &state, peer_node.uid, &sums).await;
                    }
                    Some(Ok(WsMessage::Pong(_))) => {
                        last_pong = tokio::time::Instant::now();
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        let _ = sender.send(WsMessage::Pong(payload)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket read error");
                        break;
                    }
                }
            }
        }
    }

    state.hub.remove(peer_node.uid).await;
    info!(node = %peer_node.uid, "peer connection closed");
}

async fn read_handshake_node(
    receiver: &mut (impl StreamExt<Item = Result<WsMessage, axum::Error>> + Unpin),
) -> Result<Node, String> {
    match receiver.next().await {
        Some(Ok(WsMessage::Text(text))) => {
            let message = Message::decode(&text).map_err(|e| e.to_string())?;
            if message.kind != kind::NODE {
                return Err(format!("expected Node handshake frame, got {}", message.kind));
            }
            serde_json::from_value(message.data).map_err(|e| e.to_string())
        }
        Some(Ok(_)) => Err("expected text frame for handshake".into()),
        Some(Err(e)) => Err(e.to_string()),
        None => Err("connection closed before handshake".into()),
    }
}

/// Reject a peer whose `pubkey` is already registered under a
/// different node name (`SPEC_FULL.md` §4/§5.5 fingerprint reuse
/// rejection); otherwise record/refresh the peer's `Node` row.
fn register_peer_node(storage: &Storage, peer_node: &Node) -> Result<(), crate::error::ClusterError> {
    for existing in storage.nodes.list()? {
        if existing.pubkey == peer_node.pubkey && existing.uid != peer_node.uid {
            return Err(crate::error::ClusterError::FingerprintReused {
                pubkey: peer_node.pubkey.clone(),
            });
        }
    }
    storage.nodes.put(peer_node.uid, peer_node.clone())?;
    Ok(())
}

async fn send_bulk_sync(
    sender: &mut (impl SinkExt<WsMessage, Error = axum::Error> + Unpin),
    storage: &Storage,
) -> Result<(), crate::error::ClusterError> {
    let collections = crate::replicate::collect_all(storage)?;
    let count = collections.len();
    for (kind_name, rows) in collections {
        send_frame(sender, &Message::sync_collection(kind_name, rows)).await?;
    }
    send_frame(sender, &Message::completed(count)).await
}

async fn handle_incoming_text(
    text: &str,
    state: &ClusterServerState,
    from: Uid,
    sums: &Arc<crate::sumcache::SumCache>,
) {
    let message = match Message::decode(text) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "dropping malformed frame");
            return;
        }
    };
    sums.put(message.sum);
    if message.kind == kind::SYNC {
        return;
    }
    // Applying happens once, inside the hub dispatcher's `Inbound`
    // handler (mirrors `client::handle_incoming_text`'s non-sync
    // path) — applying here too would process every steady-state
    // frame twice.
    state.hub.handle_inbound(from, message).await;
}

async fn send_frame(
    sender: &mut (impl SinkExt<WsMessage, Error = axum::Error> + Unpin),
    message: &Message,
) -> Result<(), crate::error::ClusterError> {
    let encoded = message.encode()?;
    timeout(WRITE_DEADLINE, sender.send(WsMessage::Text(encoded)))
        .await
        .map_err(|_| crate::error::ClusterError::Transport("write deadline exceeded".into()))?
        .map_err(|e| crate::error::ClusterError::Transport(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_node(pubkey: &str) -> Node {
        Node {
            uid: Uid::new(),
            name: "peer".into(),
            pubkey: pubkey.into(),
            address: "10.0.0.3:8080".into(),
            location: "us-east".into(),
            last_ping: fish_base::time::now(),
            multitenancy: false,
            maintenance: false,
            created_at: fish_base::time::now(),
            updated_at: fish_base::time::now(),
        }
    }

    #[test]
    fn register_peer_node_accepts_first_presentation() {
        let storage = Storage::memory();
        let node = sample_node("fp-1");
        assert!(register_peer_node(&storage, &node).is_ok());
    }

    #[test]
    fn register_peer_node_rejects_reused_fingerprint() {
        let storage = Storage::memory();
        let first = sample_node("fp-shared");
        register_peer_node(&storage, &first).unwrap();

        let mut second = sample_node("fp-shared");
        second.uid = Uid::new();
        let err = register_peer_node(&storage, &second).unwrap_err();
        assert!(matches!(
            err,
            crate::error::ClusterError::FingerprintReused { .. }
        ));
    }

    #[test]
    fn register_peer_node_allows_same_node_to_refresh() {
        let storage = Storage::memory();
        let mut node = sample_node("fp-1");
        register_peer_node(&storage, &node).unwrap();
        node.last_ping = fish_base::time::now();
        assert!(register_peer_node(&storage, &node).is_ok());
    }
}
