//! The driver's own abstraction over whatever cloud SDK a real
//! deployment plugs in. Grounded on the `convex-ext-redb`/
//! `convex-ext-file` pattern of an extension crate implementing a
//! trait owned by the traits layer — here the trait and its one
//! in-tree implementation ([`MockProviderApi`]) live together since
//! this crate *is* the exemplar driver (`SPEC_FULL.md` §5.6).

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::ProviderError;
use crate::pool::HostState;

/// One host as reported by the provider's own host-listing API.
/// Never carries [`HostState::Reserved`] — that overlay state exists
/// only inside [`crate::pool::PoolWorker`].
#[derive(Debug, Clone)]
pub struct ProviderHost {
    pub host_id: String,
    pub zone: String,
    pub state: HostState,
}

/// Abstraction over a cloud provider's dedicated-host API.
#[async_trait]
pub trait ProviderApi: Send + Sync {
    /// List hosts in `pool_tag`/`zone` matching `instance_type`.
    async fn list_hosts(
        &self,
        pool_tag: &str,
        zone: &str,
        instance_type: &str,
    ) -> Result<Vec<ProviderHost>, ProviderError>;

    /// Request `qty` fresh hosts of `instance_type` in `zone`. Returns
    /// the host ids actually allocated (may be fewer than `qty`).
    async fn allocate_hosts(
        &self,
        zone: &str,
        instance_type: &str,
        qty: u32,
    ) -> Result<Vec<String>, ProviderError>;

    /// Launch a throwaway instance on `host_id`, for Mac-only
    /// scrubbing (`SPEC_FULL.md` §5.6).
    async fn allocate_instance(&self, host_id: &str) -> Result<String, ProviderError>;

    /// Terminate a previously launched instance.
    async fn terminate_instance(
        &self,
        host_id: &str,
        instance_id: &str,
    ) -> Result<(), ProviderError>;

    /// Release a host back to the provider.
    async fn release_host(&self, host_id: &str) -> Result<(), ProviderError>;
}

/// An in-memory stand-in for a real provider SDK, exercised by this
/// crate's own tests. Hosts are seeded via
/// [`MockProviderApi::seed_host`]; `allocate_hosts` mints fresh ones on
/// demand up to `max_allocatable`.
pub struct MockProviderApi {
    hosts: DashMap<String, ProviderHost>,
    next_id: AtomicU64,
    max_allocatable: u64,
}

impl MockProviderApi {
    /// Construct an empty mock provider willing to allocate up to
    /// `max_allocatable` fresh hosts across its lifetime.
    pub fn new(max_allocatable: u64) -> Self {
        Self {
            hosts: DashMap::new(),
            next_id: AtomicU64::new(0),
            max_allocatable,
        }
    }

    /// Seed a pre-existing host, as if discovered on the first
    /// `list_hosts` refresh.
    pub fn seed_host(&self, zone: &str, state: HostState) -> String {
        let id = self.mint_id();
        self.hosts.insert(
            id.clone(),
            ProviderHost {
                host_id: id.clone(),
                zone: zone.to_string(),
                state,
            },
        );
        id
    }

    /// Force a host's reported state, simulating a provider-side
    /// transition (e.g. pending -> available).
    pub fn set_state(&self, host_id: &str, state: HostState) {
        if let Some(mut entry) = self.hosts.get_mut(host_id) {
            entry.state = state;
        }
    }

    fn mint_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        format!("mock-host-{n}")
    }
}

#[async_trait]
impl ProviderApi for MockProviderApi {
    async fn list_hosts(
        &self,
        _pool_tag: &str,
        zone: &str,
        _instance_type: &str,
    ) -> Result<Vec<ProviderHost>, ProviderError> {
        Ok(self
            .hosts
            .iter()
            .filter(|e| e.zone == zone)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn allocate_hosts(
        &self,
        zone: &str,
        _instance_type: &str,
        qty: u32,
    ) -> Result<Vec<String>, ProviderError> {
        let mut allocated = Vec::new();
        for _ in 0..qty {
            if self.hosts.len() as u64 >= self.max_allocatable {
                break;
            }
            let id = self.seed_host(zone, HostState::Pending);
            allocated.push(id);
        }
        if allocated.is_empty() {
            return Err(ProviderError::Transient(
                "no capacity to allocate fresh hosts".into(),
            ));
        }
        Ok(allocated)
    }

    async fn allocate_instance(&self, host_id: &str) -> Result<String, ProviderError> {
        if !self.hosts.contains_key(host_id) {
            return Err(ProviderError::Permanent(format!("unknown host {host_id}")));
        }
        Ok(format!("{host_id}-scrub-instance"))
    }

    async fn terminate_instance(
        &self,
        _host_id: &str,
        _instance_id: &str,
    ) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn release_host(&self, host_id: &str) -> Result<(), ProviderError> {
        self.hosts
            .remove(host_id)
            .map(|_| ())
            .ok_or_else(|| ProviderError::Permanent(format!("unknown host {host_id}")))
    }
}
