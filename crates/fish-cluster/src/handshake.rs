//! Transport-agnostic handshake and liveness constants shared by the
//! outbound dialer ([`crate::client`]) and the inbound acceptor
//! ([`crate::server`]), so the wire-level handshake sequence
//! (`SPEC_FULL.md` §5.5) is defined exactly once regardless of which
//! side of the connection is running it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use fish_traits::model::Node;

use crate::message::Message;

/// Write deadline for a single frame (spec.md §4.5 "Liveness").
pub const WRITE_DEADLINE: Duration = Duration::from_secs(10);
/// How long without a pong before the connection is considered dead.
pub const PONG_DEADLINE: Duration = Duration::from_secs(60);
/// Ping cadence, 9/10 of the pong deadline.
pub const PING_INTERVAL: Duration = Duration::from_secs(54);
/// Reconnect poll cadence for the outbound dialer.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// The two frames an initiator sends immediately after the transport
/// connects: its own `Node` record, then a `sync` request for
/// everything since `last_sync`.
pub fn initial_frames(local_node: &Node, last_sync: DateTime<Utc>) -> Vec<Message> {
    vec![
        Message::new(
            crate::message::kind::NODE,
            None,
            serde_json::to_value(local_node).unwrap_or(serde_json::Value::Null),
        ),
        Message::sync_request(last_sync),
    ]
}

/// Tracks a receiver's progress through a bulk sync: increments per
/// `Resp=sync` message, and is satisfied once a `completed` message's
/// count has been reached (`SPEC_FULL.md` §5.5 step 4, a WaitGroup in
/// the source).
#[derive(Debug, Default)]
pub struct SyncProgress {
    received: usize,
    expected: Option<usize>,
}

impl SyncProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one `Resp=sync` collection message.
    pub fn note_sync_message(&mut self) {
        self.received += 1;
    }

    /// Record the terminal `completed` message's count.
    pub fn note_completed(&mut self, count: usize) {
        self.expected = Some(count);
    }

    /// Whether every expected `Resp=sync` message has now arrived.
    pub fn is_done(&self) -> bool {
        matches!(self.expected, Some(expected) if self.received >= expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_progress_is_done_once_count_reached() {
        let mut progress = SyncProgress::new();
        assert!(!progress.is_done());
        progress.note_sync_message();
        progress.note_sync_message();
        progress.note_completed(2);
        assert!(progress.is_done());
    }

    #[test]
    fn sync_progress_not_done_if_completed_arrives_early() {
        let mut progress = SyncProgress::new();
        progress.note_completed(3);
        progress.note_sync_message();
        assert!(!progress.is_done());
    }
}
