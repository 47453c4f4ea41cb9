//! The capability interface drivers implement to plug into the
//! lifecycle engine. Grounded on `convex-traits::coordination`'s
//! async-trait, object-safe registry traits, generalized here from a
//! cluster-coordination concern to a provider-driver one.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::model::{ApplicationResource, LabelDefinition};

/// Failure returned by a [`Driver`] or [`Task`] call.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("invalid driver configuration: {0}")]
    InvalidConfig(String),
    #[error("label definition rejected: {0}")]
    InvalidDefinition(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("operation was cancelled")]
    Cancelled,
    #[error("operation not supported by this driver")]
    Unsupported,
}

impl fish_base::error::HasErrorKind for DriverError {
    fn kind(&self) -> fish_base::error::ErrorKind {
        use fish_base::error::ErrorKind;
        match self {
            DriverError::InvalidConfig(_) | DriverError::InvalidDefinition(_) => {
                ErrorKind::Validation
            }
            DriverError::Provider(_) => ErrorKind::Provider,
            DriverError::Cancelled => ErrorKind::Transient,
            DriverError::Unsupported => ErrorKind::Invariant,
        }
    }
}

/// Live consumption on this node, used by [`Driver::available_capacity`]
/// to compute remaining slots (`SPEC_FULL.md` §5.4).
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeUsage {
    pub cpu: u32,
    /// RAM in megabytes.
    pub ram: u32,
    /// Disk space in gigabytes already handed out.
    pub disk: u32,
    /// Whether this node currently accepts overbooked tenants at all;
    /// combined with the definition's own `multitenancy` flag.
    pub multitenancy: bool,
}

/// Result of a `Status` query against an allocated resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceStatus {
    Allocated,
    None,
}

/// The small capability interface every provider driver implements.
/// Mirrors `SPEC_FULL.md` §7's external Driver interface one-to-one.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Stable driver name as referenced by `LabelDefinition::driver_name`.
    fn name(&self) -> &str;

    /// Whether this driver's capacity accounting is remote (its
    /// `available_capacity` result must be cached for >= 30s per
    /// `SPEC_FULL.md` §5.4) as opposed to a node-local driver computed
    /// from configured totals.
    fn is_remote(&self) -> bool;

    /// Parse and validate this driver's opaque configuration. Called
    /// once at driver construction.
    fn prepare(&mut self, cfg: &Value) -> Result<(), DriverError>;

    /// Whether this driver can satisfy the given definition at all
    /// (independent of current capacity).
    fn validate_definition(&self, def: &LabelDefinition) -> Result<(), DriverError>;

    /// Remaining slots for `def` given current usage. Returns `-1` on
    /// unrecoverable error, `0` if unable to serve, otherwise a
    /// positive count.
    async fn available_capacity(&self, usage: NodeUsage, def: &LabelDefinition) -> i64;

    /// Provision a resource for `def`, with `metadata` already merged
    /// (Application wins conflicts) per `SPEC_FULL.md` §4.3.
    async fn allocate(
        &self,
        def: &LabelDefinition,
        metadata: Value,
    ) -> Result<ApplicationResource, DriverError>;

    /// Query whether a previously allocated resource is still live.
    async fn status(&self, res: &ApplicationResource) -> Result<ResourceStatus, DriverError>;

    /// Release a previously allocated resource. Must be idempotent:
    /// calling it twice on an already-released resource succeeds
    /// as a no-op (`SPEC_FULL.md` §8).
    async fn deallocate(&self, res: &ApplicationResource) -> Result<(), DriverError>;

    /// Construct a [`Task`] by name with the given opaque options, or
    /// `None` if this driver offers no such task.
    fn get_task(&self, name: &str, options: Value) -> Option<Box<dyn Task>>;
}

/// Side-work executed by the lifecycle engine at `when=Allocated` or
/// `when=Deallocate` (`SPEC_FULL.md` §7).
#[async_trait]
pub trait Task: Send + Sync {
    /// Stable task name, matching `ApplicationTask::name`.
    fn name(&self) -> &str;

    /// Attach the Application-specific context this invocation needs.
    fn set_info(&mut self, def: LabelDefinition, res: ApplicationResource);

    /// Run the task, returning an opaque result blob stored back onto
    /// the `ApplicationTask` record. Failures are logged by the engine
    /// but never move Application state.
    async fn execute(&self) -> Result<Vec<u8>, DriverError>;
}
