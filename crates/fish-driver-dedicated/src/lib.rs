//! A dedicated-host pool driver: leases whole hosts from a cloud
//! provider, subdivides each into instance-sized slots, and returns
//! them to the provider once idle past a release delay. Modeled on
//! the node-local driver's trait implementation, but fronted by a
//! background [`pool::PoolWorker`] loop instead of a fixed local
//! capacity figure (`SPEC_FULL.md` §5.6).

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod error;
pub mod pool;
pub mod provider;

/// Common imports for constructing a [`pool::DedicatedDriver`].
pub mod prelude {
    pub use crate::error::{PoolError, PoolResult, ProviderError};
    pub use crate::pool::{DedicatedDriver, HostState, PoolConfig, PoolWorker};
    pub use crate::provider::{MockProviderApi, ProviderApi, ProviderHost};
}
