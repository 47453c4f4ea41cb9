//! Grounded on `convex_engine::error::EngineError`: one enum per
//! failure cause the engine itself can produce, distinct from
//! [`fish_traits::driver::DriverError`] which belongs to drivers.

use fish_base::error::{ErrorKind, HasErrorKind};
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] fish_storage::error::StorageError),

    #[error("driver error: {0}")]
    Driver(#[from] fish_traits::driver::DriverError),

    #[error("no driver registered with name {0}")]
    UnknownDriver(String),

    #[error("label {0} has no usable definition on this node")]
    NoUsableDefinition(fish_base::uid::Uid),

    #[error("application {0} not found")]
    ApplicationNotFound(fish_base::uid::Uid),

    #[error("local node {0} has not registered itself in storage")]
    UnknownNode(fish_base::uid::Uid),

    #[error("engine is shutting down")]
    Shutdown,

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl HasErrorKind for EngineError {
    fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Storage(e) => e.kind(),
            EngineError::Driver(e) => e.kind(),
            EngineError::UnknownDriver(_) | EngineError::Configuration(_) => ErrorKind::Validation,
            EngineError::NoUsableDefinition(_)
            | EngineError::ApplicationNotFound(_)
            | EngineError::UnknownNode(_) => ErrorKind::NotFound,
            EngineError::Shutdown => ErrorKind::Fatal,
        }
    }
}
