//! Grounded on the same `thiserror`-enum-with-`kind()` shape as every
//! other crate's error module; this one only adds the node binary's
//! own causes (config/CLI) on top of the lower layers' errors.

use fish_base::error::{ErrorKind, HasErrorKind};
use thiserror::Error;

/// Result alias used throughout this crate.
pub type NodeResult<T> = Result<T, NodeError>;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] fish_storage::error::StorageError),

    #[error(transparent)]
    Engine(#[from] fish_engine::error::EngineError),

    #[error("no driver registered for config entry named {0}")]
    UnknownDriverKind(String),
}

impl HasErrorKind for NodeError {
    fn kind(&self) -> ErrorKind {
        match self {
            NodeError::Configuration(_) | NodeError::UnknownDriverKind(_) => ErrorKind::Validation,
            NodeError::Io(_) => ErrorKind::Transient,
            NodeError::Storage(e) => e.kind(),
            NodeError::Engine(e) => e.kind(),
        }
    }
}
