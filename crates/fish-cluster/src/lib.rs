//! WebSocket mesh replication.
//!
//! Grounded on `convex_server::websocket`'s broadcast-hub shape,
//! generalized from one-way client broadcast to a full mesh: every
//! node both accepts inbound connections ([`server`]) and dials its
//! configured seed peers ([`client`]), with a single dispatcher task
//! ([`hub::Hub`]) owning the peer set and a TTL dedup cache
//! ([`sumcache`]) preventing replay storms across the mesh
//! (`SPEC_FULL.md` §5.5).

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod client;
pub mod error;
pub mod handshake;
pub mod hub;
pub mod message;
pub mod replicate;
pub mod server;
pub mod sumcache;

pub mod prelude {
    //! Convenience re-exports for downstream crates.
    pub use crate::error::{ClusterError, ClusterResult};
    pub use crate::hub::{Hub, HubConfig};
    pub use crate::message::{kind, Message};
    pub use crate::replicate::spawn_local_bridge;
    pub use crate::server::{router, ClusterServerState};
}
