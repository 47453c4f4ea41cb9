use chrono::{DateTime, Utc};
use fish_base::uid::Uid;
use serde::{Deserialize, Serialize};

/// A peer in the cluster.
///
/// `name` and `pubkey` are each unique across the cluster; Storage
/// enforces this as a `Conflict` error on write. A node is considered
/// active iff `last_ping` is within 2x the configured ping delay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Identifier of this record.
    pub uid: Uid,
    /// Unique human-readable name, also used as the mTLS certificate CN.
    pub name: String,
    /// Unique public-key fingerprint presented during the mesh handshake.
    pub pubkey: String,
    /// Externally reachable address for inbound mesh connections.
    pub address: String,
    /// Location tag used by `node_filter` matching and mesh spread.
    pub location: String,
    /// Last time this node was observed alive, either locally (self)
    /// or via a received heartbeat/message (peer).
    pub last_ping: DateTime<Utc>,
    /// Whether this node currently accepts overbooked CPU/RAM.
    pub multitenancy: bool,
    /// Whether maintenance mode is active (stop accepting new votes).
    pub maintenance: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// Whether this node is active given a ping delay, per
    /// `SPEC_FULL.md` §4's `(name)`/`(pubkey)` uniqueness and liveness
    /// invariant.
    pub fn is_active(&self, ping_delay_secs: i64, now: DateTime<Utc>) -> bool {
        (now - self.last_ping).num_seconds() <= ping_delay_secs * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample(last_ping: DateTime<Utc>) -> Node {
        Node {
            uid: Uid::new(),
            name: "node-a".into(),
            pubkey: "fingerprint".into(),
            address: "10.0.0.1:8080".into(),
            location: "us-east".into(),
            last_ping,
            multitenancy: false,
            maintenance: false,
            created_at: fish_base::time::now(),
            updated_at: fish_base::time::now(),
        }
    }

    #[test]
    fn active_within_2x_ping_delay() {
        let now = fish_base::time::now();
        let node = sample(now - Duration::seconds(19));
        assert!(node.is_active(10, now));
    }

    #[test]
    fn inactive_beyond_2x_ping_delay() {
        let now = fish_base::time::now();
        let node = sample(now - Duration::seconds(21));
        assert!(!node.is_active(10, now));
    }
}
