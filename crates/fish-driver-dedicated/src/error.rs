//! Grounded on `convex_traits::coordination::RegistryError`'s
//! transient-vs-permanent split, adapted here to a cloud provider's
//! own failure taxonomy.

use fish_base::error::{ErrorKind, HasErrorKind};
use thiserror::Error;

/// Result alias used throughout this crate.
pub type PoolResult<T> = Result<T, PoolError>;

/// A provider SDK call's outcome, distinguishing retryable failures
/// from ones that should be surfaced immediately.
#[derive(Debug, Error, Clone)]
pub enum ProviderError {
    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("permanent provider error: {0}")]
    Permanent(String),
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("no host available in pool and no zone had capacity to allocate one")]
    PoolExhausted,

    #[error("unknown host {0}")]
    UnknownHost(String),

    #[error(transparent)]
    Storage(#[from] fish_storage::error::StorageError),
}

impl HasErrorKind for PoolError {
    fn kind(&self) -> ErrorKind {
        match self {
            PoolError::Provider(ProviderError::Transient(_)) => ErrorKind::Transient,
            PoolError::Provider(ProviderError::Permanent(_)) => ErrorKind::Provider,
            PoolError::PoolExhausted => ErrorKind::Provider,
            PoolError::UnknownHost(_) => ErrorKind::NotFound,
            PoolError::Storage(e) => e.kind(),
        }
    }
}
