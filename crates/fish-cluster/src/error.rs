//! Grounded on `convex_traits::coordination::RegistryError`: a
//! `thiserror` enum covering the mesh's own failure causes, distinct
//! from [`fish_engine::error::EngineError`] which the hub also
//! surfaces when applying a replicated object fails.

use fish_base::error::{ErrorKind, HasErrorKind};
use thiserror::Error;

/// Result alias used throughout this crate.
pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("peer presented cluster uid {theirs} but ours is {ours}")]
    ClusterMismatch { ours: String, theirs: String },

    #[error("peer pubkey {pubkey} already registered under a different node name")]
    FingerprintReused { pubkey: String },

    #[error("websocket transport error: {0}")]
    Transport(String),

    #[error("peer connection not found: {0}")]
    UnknownPeer(String),

    #[error(transparent)]
    Storage(#[from] fish_storage::error::StorageError),

    #[error(transparent)]
    Engine(#[from] fish_engine::error::EngineError),
}

impl HasErrorKind for ClusterError {
    fn kind(&self) -> ErrorKind {
        match self {
            ClusterError::Malformed(_) | ClusterError::ChecksumMismatch { .. } => {
                ErrorKind::Validation
            }
            ClusterError::ClusterMismatch { .. } | ClusterError::FingerprintReused { .. } => {
                ErrorKind::Invariant
            }
            ClusterError::Transport(_) => ErrorKind::Transient,
            ClusterError::UnknownPeer(_) => ErrorKind::NotFound,
            ClusterError::Storage(e) => e.kind(),
            ClusterError::Engine(e) => e.kind(),
        }
    }
}
