//! The cluster wire format (`SPEC_FULL.md` §5.5 / spec.md §6):
//! `Message{Type, Resp, Data, Sum}`, JSON-encoded, `Sum` a CRC32-IEEE
//! of the serialized `Data` that doubles as the sum-cache dedup key.
//! Grounded on `convex_server::websocket`'s `#[serde(tag = "type")]`
//! `ClientMessage`/`ServerMessage` shape, generalized here to one flat
//! envelope struct since the mesh carries a fixed `Data` payload type
//! (`serde_json::Value`) rather than per-variant fields.

use fish_base::uid::Uid;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ClusterError, ClusterResult};

/// The nine domain types the mesh replicates, plus the three
/// protocol-level message kinds (`cluster`, `sync`, `completed`).
/// Kept as plain string constants rather than an enum so a peer
/// running a newer/older build can round-trip an unrecognized `Type`
/// without failing to deserialize the envelope.
pub mod kind {
    pub const CLUSTER: &str = "cluster";
    pub const SYNC: &str = "sync";
    pub const COMPLETED: &str = "completed";
    pub const NODE: &str = "Node";
    pub const LABEL: &str = "Label";
    pub const APPLICATION: &str = "Application";
    pub const APPLICATION_STATE: &str = "ApplicationState";
    pub const APPLICATION_TASK: &str = "ApplicationTask";
    pub const SERVICE_MAPPING: &str = "ServiceMapping";
    pub const VOTE: &str = "Vote";
    pub const LOCATION: &str = "Location";
    pub const RESOURCE: &str = "Resource";

    /// Every domain type replicated over the mesh, in the fixed order
    /// a bulk sync streams them (`SPEC_FULL.md` §5.5 handshake step 3).
    pub const SYNCABLE: &[&str] = &[
        NODE,
        LABEL,
        APPLICATION,
        APPLICATION_STATE,
        APPLICATION_TASK,
        SERVICE_MAPPING,
        VOTE,
        LOCATION,
        RESOURCE,
    ];
}

/// `Resp=sync` marker used on every bulk-sync collection message.
pub const RESP_SYNC: &str = "sync";

/// `Resp=delete` marker distinguishing a steady-state deletion from
/// the default upsert (`SPEC_FULL.md` §9/`DESIGN.md` Open Question 1:
/// deletes replicate as an ordinary message over the same pipeline,
/// carrying just the deleted row's uid rather than a tombstone
/// record).
pub const RESP_DELETE: &str = "delete";

/// One mesh envelope. `sum` is computed from `data` at construction
/// time via [`Message::new`] and re-verified on decode so a corrupted
/// frame is rejected before it reaches dedup/apply logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "Resp", default, skip_serializing_if = "Option::is_none")]
    pub resp: Option<String>,
    #[serde(rename = "Data")]
    pub data: Value,
    #[serde(rename = "Sum")]
    pub sum: u32,
}

impl Message {
    /// Build a new envelope, computing `sum` from `data`.
    pub fn new(kind: impl Into<String>, resp: Option<String>, data: Value) -> Self {
        let sum = checksum(&data);
        Self {
            kind: kind.into(),
            resp,
            data,
            sum,
        }
    }

    /// The `sync {From: ...}` request sent right after the handshake's
    /// initial `Node` message (`SPEC_FULL.md` §5.5 step 2).
    pub fn sync_request(since: chrono::DateTime<chrono::Utc>) -> Self {
        Self::new(kind::SYNC, None, serde_json::json!({ "From": since }))
    }

    /// One non-empty collection streamed during bulk sync, tagged
    /// `Resp=sync` (step 3).
    pub fn sync_collection(collection_kind: &str, objects: Value) -> Self {
        Self::new(collection_kind, Some(RESP_SYNC.to_string()), objects)
    }

    /// A steady-state create/update of a single object of
    /// `collection_kind` (`SPEC_FULL.md` §5.5: "the engine emits
    /// `Type=<TypeName>` with the updated object").
    pub fn object_upsert(collection_kind: impl Into<String>, object: Value) -> Self {
        Self::new(collection_kind, None, object)
    }

    /// A steady-state delete of the object identified by `uid`.
    pub fn object_delete(collection_kind: impl Into<String>, uid: Uid) -> Self {
        Self::new(
            collection_kind,
            Some(RESP_DELETE.to_string()),
            serde_json::json!(uid),
        )
    }

    /// The final message of a bulk sync, carrying the total count of
    /// `Resp=sync` messages sent, so the receiver knows when its
    /// WaitGroup-equivalent counter is done (step 4).
    pub fn completed(sync_message_count: usize) -> Self {
        Self::new(
            kind::COMPLETED,
            None,
            serde_json::json!({ "count": sync_message_count }),
        )
    }

    /// Serialize to the newline-terminated JSON frame used on the wire
    /// (`SPEC_FULL.md` §6: "newline-separated when batched on one
    /// frame, re-parsed by a streaming decoder").
    pub fn encode(&self) -> ClusterResult<String> {
        let mut line =
            serde_json::to_string(self).map_err(|e| ClusterError::Malformed(e.to_string()))?;
        line.push('\n');
        Ok(line)
    }

    /// Parse one frame and verify its checksum.
    pub fn decode(line: &str) -> ClusterResult<Self> {
        let msg: Message = serde_json::from_str(line.trim_end())
            .map_err(|e| ClusterError::Malformed(e.to_string()))?;
        let expected = checksum(&msg.data);
        if expected != msg.sum {
            return Err(ClusterError::ChecksumMismatch {
                expected,
                actual: msg.sum,
            });
        }
        Ok(msg)
    }
}

/// CRC32-IEEE of `data`'s canonical JSON serialization. Canonical here
/// just means "whatever `serde_json::to_vec` produces" — both sides
/// of the mesh run the same serializer, so this is stable in
/// practice even though JSON key order is not formally specified.
pub fn checksum(data: &Value) -> u32 {
    let bytes = serde_json::to_vec(data).unwrap_or_default();
    crc32fast::hash(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_preserves_fields() {
        let msg = Message::new(kind::NODE, None, serde_json::json!({"name": "a"}));
        let encoded = msg.encode().unwrap();
        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(decoded.kind, msg.kind);
        assert_eq!(decoded.resp, msg.resp);
        assert_eq!(decoded.data, msg.data);
        assert_eq!(decoded.sum, msg.sum);
    }

    #[test]
    fn sum_of_encode_decode_round_trip_matches() {
        let msg = Message::new(
            kind::APPLICATION_STATE,
            Some(RESP_SYNC.to_string()),
            serde_json::json!([{"status": "NEW"}]),
        );
        let round_tripped = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(checksum(&round_tripped.data), msg.sum);
    }

    #[test]
    fn tampered_checksum_is_rejected() {
        let mut msg = Message::new(kind::NODE, None, serde_json::json!({"name": "a"}));
        msg.sum ^= 0xFFFF_FFFF;
        let encoded = serde_json::to_string(&msg).unwrap();
        assert!(matches!(
            Message::decode(&encoded),
            Err(ClusterError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn completed_message_carries_count() {
        let msg = Message::completed(7);
        assert_eq!(msg.kind, kind::COMPLETED);
        assert_eq!(msg.data["count"], 7);
    }
}
