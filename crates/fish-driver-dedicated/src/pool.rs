//! The pool worker itself: tracks dedicated hosts across zones,
//! answers capacity questions, reserves/allocates on demand, and runs
//! a background refresh/scrub/release loop. Its shape — a `DashMap` of
//! live state plus a `tokio::select!` ticker loop spawned alongside a
//! shutdown signal — is grounded on
//! `convex_engine::scheduler::IntervalScheduler`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fish_base::cancel::CancellationToken;
use fish_base::uid::Uid;
use fish_storage::storage::Storage;
use fish_traits::driver::{Driver, DriverError, NodeUsage, ResourceStatus, Task};
use fish_traits::model::{ApplicationResource, LabelDefinition, Resource};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::error::{PoolError, PoolResult};
use crate::provider::ProviderApi;

/// A host's state as tracked by the pool. [`HostState::Reserved`] is
/// an overlay this worker applies itself between a reservation and
/// the next provider refresh; no [`ProviderApi`] implementation ever
/// reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    Available,
    Pending,
    UnderAssessment,
    PermanentFailure,
    Reserved,
}

/// The worker's own bookkeeping for one tracked host, independent of
/// whatever the provider's API happens to return on a given refresh.
#[derive(Debug, Clone)]
struct HostRecord {
    host_id: String,
    zone: String,
    state: HostState,
    in_use: u32,
    allocated_at: DateTime<Utc>,
    pending_since: Option<DateTime<Utc>>,
    scrub_started_at: Option<DateTime<Utc>>,
}

impl HostRecord {
    fn capacity(&self, instances_per_host: u32) -> u32 {
        instances_per_host.saturating_sub(self.in_use)
    }
}

/// Static configuration for one dedicated-host pool. One
/// [`PoolWorker`] manages exactly one `(pool_tag, instance_type)` pair
/// spread across `zones`.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub pool_tag: String,
    pub zones: Vec<String>,
    pub instance_type: String,
    /// vCPUs of the host type this pool leases. Forced to
    /// `instance_type_vcpus` (1:1) by [`PoolConfig::new`] when
    /// `is_mac_like` is set, matching `.metal` hosts which never
    /// subdivide.
    pub host_type_vcpus: u32,
    pub instance_type_vcpus: u32,
    pub max_hosts: u32,
    pub release_delay: Duration,
    pub scrubbing_delay: Duration,
    pub pending_to_available_delay: Duration,
    /// Whether hosts in this pool require allocate-then-terminate
    /// scrubbing before being released back to the provider (true for
    /// Apple silicon / Mac hosts; SPEC_FULL.md §5.6).
    pub is_mac_like: bool,
}

impl PoolConfig {
    /// `instances_per_host`, derived once from the vCPU ratio. Forced
    /// to 1 for `is_mac_like` pools regardless of the configured host
    /// vCPU count.
    pub fn instances_per_host(&self) -> u32 {
        if self.is_mac_like {
            1
        } else {
            (self.host_type_vcpus / self.instance_type_vcpus.max(1)).max(1)
        }
    }

    fn refresh_interval(&self) -> Duration {
        Duration::from_secs(300).min(self.scrubbing_delay / 2)
    }
}

/// Tracks and leases a pool of dedicated hosts for one instance type
/// across one or more zones.
pub struct PoolWorker {
    config: PoolConfig,
    provider: Arc<dyn ProviderApi>,
    storage: Option<Arc<Storage>>,
    hosts: DashMap<String, HostRecord>,
    shutdown: CancellationToken,
}

impl PoolWorker {
    /// Construct a worker. Does not start its background loop; call
    /// [`PoolWorker::spawn`] for that once wrapped in an `Arc`.
    pub fn new(
        config: PoolConfig,
        provider: Arc<dyn ProviderApi>,
        storage: Option<Arc<Storage>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            provider,
            storage,
            hosts: DashMap::new(),
            shutdown,
        }
    }

    fn instances_per_host(&self) -> u32 {
        self.config.instances_per_host()
    }

    /// Total free slots across tracked hosts plus headroom to allocate
    /// fresh hosts up to `max_hosts` (`SPEC_FULL.md` §5.6).
    pub fn available_capacity(&self) -> i64 {
        let per_host = self.instances_per_host();
        let tracked_free: i64 = self
            .hosts
            .iter()
            .filter(|h| h.state != HostState::PermanentFailure)
            .map(|h| h.capacity(per_host) as i64)
            .sum();
        let tracked_count = self.hosts.len() as u32;
        let headroom = self.config.max_hosts.saturating_sub(tracked_count) as i64 * per_host as i64;
        tracked_free + headroom
    }

    /// Reserve a slot on an existing host, or provision a fresh one if
    /// none has room. Returns the chosen host's id and zone.
    pub async fn reserve_allocate_host(&self) -> PoolResult<(String, String)> {
        if let Some((host_id, zone)) = self.reserve_existing_host() {
            return Ok((host_id, zone));
        }
        self.allocate_fresh_host().await
    }

    fn reserve_existing_host(&self) -> Option<(String, String)> {
        let per_host = self.instances_per_host();
        let mut candidates: Vec<String> = self
            .hosts
            .iter()
            .filter(|h| h.state == HostState::Available && h.capacity(per_host) > 0)
            .map(|h| h.host_id.clone())
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        let host_id = candidates.into_iter().next()?;
        let mut entry = self.hosts.get_mut(&host_id)?;
        entry.in_use += 1;
        if entry.capacity(per_host) == 0 {
            entry.state = HostState::Reserved;
        }
        Some((entry.host_id.clone(), entry.zone.clone()))
    }

    async fn allocate_fresh_host(&self) -> PoolResult<(String, String)> {
        for zone in &self.config.zones {
            match self
                .provider
                .allocate_hosts(zone, &self.config.instance_type, 1)
                .await
            {
                Ok(ids) => {
                    if let Some(host_id) = ids.into_iter().next() {
                        let now = fish_base::time::now();
                        self.hosts.insert(
                            host_id.clone(),
                            HostRecord {
                                host_id: host_id.clone(),
                                zone: zone.clone(),
                                state: HostState::Reserved,
                                in_use: 1,
                                allocated_at: now,
                                pending_since: None,
                                scrub_started_at: None,
                            },
                        );
                        self.persist_host(&host_id).await;
                        return Ok((host_id, zone.clone()));
                    }
                }
                Err(e) => {
                    debug!(zone, error = %e, "zone could not allocate a fresh host, trying next");
                }
            }
        }
        Err(PoolError::PoolExhausted)
    }

    /// Release one in-use slot on `host_id`. Does not immediately
    /// return the host to the provider — that happens on the next
    /// [`PoolWorker::release_sweep`] once the host's release rules are
    /// satisfied.
    pub fn release_slot(&self, host_id: &str) -> PoolResult<()> {
        let mut entry = self
            .hosts
            .get_mut(host_id)
            .ok_or_else(|| PoolError::UnknownHost(host_id.to_string()))?;
        entry.in_use = entry.in_use.saturating_sub(1);
        if entry.state == HostState::Reserved && entry.capacity(self.instances_per_host()) > 0 {
            entry.state = HostState::Available;
        }
        Ok(())
    }

    /// Pull the latest host listing from the provider across every
    /// configured zone and merge it into local state.
    pub async fn refresh(&self) -> PoolResult<()> {
        for zone in &self.config.zones {
            let reported = self
                .provider
                .list_hosts(&self.config.pool_tag, zone, &self.config.instance_type)
                .await?;
            for host in reported {
                self.merge_reported_host(host.host_id, host.zone, host.state);
            }
        }
        Ok(())
    }

    fn merge_reported_host(&self, host_id: String, zone: String, reported: HostState) {
        let now = fish_base::time::now();
        let mut entry = self.hosts.entry(host_id.clone()).or_insert_with(|| HostRecord {
            host_id: host_id.clone(),
            zone,
            state: reported,
            in_use: 0,
            allocated_at: now,
            pending_since: None,
            scrub_started_at: None,
        });

        // A Reserved overlay is this worker's own bookkeeping; only a
        // provider-confirmed permanent failure overrides it.
        if entry.state == HostState::Reserved {
            if reported == HostState::PermanentFailure {
                entry.state = HostState::PermanentFailure;
            }
            return;
        }

        match (entry.state, reported) {
            (HostState::Pending, HostState::Available) => {
                let delay = self.config.pending_to_available_delay;
                if delay.is_zero() {
                    entry.state = HostState::Available;
                    entry.pending_since = None;
                } else {
                    let since = *entry.pending_since.get_or_insert(now);
                    if now.signed_duration_since(since).to_std().unwrap_or_default() >= delay {
                        entry.state = HostState::Available;
                        entry.pending_since = None;
                    }
                }
            }
            (_, other) => {
                entry.state = other;
                if other != HostState::Pending {
                    entry.pending_since = None;
                }
            }
        }
    }

    /// Mac-only: walk idle hosts and kick off the allocate-then-terminate
    /// scrub cycle for any that have sat idle past `scrubbing_delay`.
    pub async fn scrub_sweep(&self) {
        if !self.config.is_mac_like {
            return;
        }
        let now = fish_base::time::now();
        let candidates: Vec<String> = self
            .hosts
            .iter()
            .filter(|h| {
                h.in_use == 0
                    && h.state == HostState::Available
                    && h.scrub_started_at.is_none()
                    && now.signed_duration_since(h.allocated_at).to_std().unwrap_or_default()
                        >= self.config.scrubbing_delay
            })
            .map(|h| h.host_id.clone())
            .collect();

        for host_id in candidates {
            match self.provider.allocate_instance(&host_id).await {
                Ok(instance_id) => {
                    if let Err(e) = self.provider.terminate_instance(&host_id, &instance_id).await
                    {
                        warn!(host_id, error = %e, "scrub terminate failed");
                        continue;
                    }
                    if let Some(mut entry) = self.hosts.get_mut(&host_id) {
                        entry.state = HostState::Pending;
                        entry.scrub_started_at = Some(now);
                    }
                }
                Err(e) => warn!(host_id, error = %e, "scrub allocate failed"),
            }
        }
    }

    /// Release hosts whose release rules are satisfied: permanent
    /// failures release immediately; ordinary hosts release once idle
    /// for `release_delay`; Mac hosts additionally require having
    /// completed a scrub cycle.
    pub async fn release_sweep(&self) {
        let now = fish_base::time::now();
        let mut to_release = Vec::new();
        for entry in self.hosts.iter() {
            if entry.state == HostState::PermanentFailure {
                to_release.push(entry.host_id.clone());
                continue;
            }
            if entry.in_use > 0 || entry.state == HostState::Reserved {
                continue;
            }
            let age = now
                .signed_duration_since(entry.allocated_at)
                .to_std()
                .unwrap_or_default();
            if age < self.config.release_delay {
                continue;
            }
            if self.config.is_mac_like && entry.scrub_started_at.is_none() {
                continue;
            }
            to_release.push(entry.host_id.clone());
        }

        for host_id in to_release {
            match self.provider.release_host(&host_id).await {
                Ok(()) => {
                    self.hosts.remove(&host_id);
                    self.remove_persisted_host(&host_id).await;
                    info!(host_id, "released dedicated host back to provider");
                }
                Err(e) => warn!(host_id, error = %e, "failed to release host"),
            }
        }
    }

    async fn persist_host(&self, host_id: &str) {
        let Some(storage) = &self.storage else {
            return;
        };
        let Some(record) = self.hosts.get(host_id) else {
            return;
        };
        let now = fish_base::time::now();
        let resource = Resource {
            uid: Uid::new(),
            driver_name: self.config.pool_tag.clone(),
            identifier: record.host_id.clone(),
            zone: record.zone.clone(),
            metadata: serde_json::json!({"state": format!("{:?}", record.state)}),
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = storage.resources.put(resource.uid, resource) {
            warn!(host_id, error = %e, "failed to persist dedicated host record");
        }
    }

    async fn remove_persisted_host(&self, host_id: &str) {
        let Some(storage) = &self.storage else {
            return;
        };
        let Ok(rows) = storage.resources.list() else {
            return;
        };
        for row in rows {
            if row.identifier == host_id {
                let _ = storage.resources.delete(row.uid);
            }
        }
    }

    /// Run one full maintenance cycle: refresh from the provider, then
    /// scrub and release.
    pub async fn tick(&self) {
        if let Err(e) = self.refresh().await {
            warn!(error = %e, "pool refresh failed");
        }
        self.scrub_sweep().await;
        self.release_sweep().await;
    }

    /// Spawn the background maintenance loop. Runs until `shutdown` is
    /// signalled.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval_duration = self.config.refresh_interval();
        tokio::spawn(async move {
            let mut ticker = interval(interval_duration);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                    _ = self.shutdown.cancelled() => {
                        info!(pool_tag = %self.config.pool_tag, "pool worker shutting down");
                        break;
                    }
                }
            }
        })
    }
}

/// A [`Driver`] implementation backed by a [`PoolWorker`]. Configured
/// lazily via [`Driver::prepare`], since the pool's background loop
/// needs an `Arc<PoolWorker>` that can only be constructed once
/// configuration is known.
pub struct DedicatedDriver {
    name: String,
    provider: Arc<dyn ProviderApi>,
    storage: Option<Arc<Storage>>,
    shutdown: CancellationToken,
    pool: Mutex<Option<Arc<PoolWorker>>>,
}

#[derive(Debug, Deserialize)]
struct DedicatedDriverConfig {
    pool_tag: String,
    zones: Vec<String>,
    instance_type: String,
    host_type_vcpus: u32,
    instance_type_vcpus: u32,
    max_hosts: u32,
    #[serde(default = "default_release_delay_secs")]
    release_delay_secs: u64,
    #[serde(default = "default_scrubbing_delay_secs")]
    scrubbing_delay_secs: u64,
    #[serde(default)]
    pending_to_available_delay_secs: u64,
    #[serde(default)]
    is_mac_like: bool,
}

fn default_release_delay_secs() -> u64 {
    3600
}

fn default_scrubbing_delay_secs() -> u64 {
    24 * 3600
}

impl DedicatedDriver {
    /// Construct an unconfigured driver under `name`, backed by
    /// `provider`. Call [`Driver::prepare`] before use.
    pub fn new(
        name: impl Into<String>,
        provider: Arc<dyn ProviderApi>,
        storage: Option<Arc<Storage>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            provider,
            storage,
            shutdown,
            pool: Mutex::new(None),
        }
    }

    fn pool(&self) -> Result<Arc<PoolWorker>, DriverError> {
        self.pool
            .lock()
            .clone()
            .ok_or_else(|| DriverError::InvalidConfig("driver not prepared".into()))
    }
}

#[async_trait]
impl Driver for DedicatedDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_remote(&self) -> bool {
        true
    }

    fn prepare(&mut self, cfg: &Value) -> Result<(), DriverError> {
        let parsed: DedicatedDriverConfig =
            serde_json::from_value(cfg.clone()).map_err(|e| DriverError::InvalidConfig(e.to_string()))?;
        let config = PoolConfig {
            pool_tag: parsed.pool_tag,
            zones: parsed.zones,
            instance_type: parsed.instance_type,
            host_type_vcpus: parsed.host_type_vcpus,
            instance_type_vcpus: parsed.instance_type_vcpus,
            max_hosts: parsed.max_hosts,
            release_delay: Duration::from_secs(parsed.release_delay_secs),
            scrubbing_delay: Duration::from_secs(parsed.scrubbing_delay_secs),
            pending_to_available_delay: Duration::from_secs(parsed.pending_to_available_delay_secs),
            is_mac_like: parsed.is_mac_like,
        };
        let worker = Arc::new(PoolWorker::new(
            config,
            self.provider.clone(),
            self.storage.clone(),
            self.shutdown.clone(),
        ));
        worker.clone().spawn();
        *self.pool.lock() = Some(worker);
        Ok(())
    }

    fn validate_definition(&self, def: &LabelDefinition) -> Result<(), DriverError> {
        if def.driver_name != self.name {
            return Err(DriverError::InvalidDefinition(format!(
                "definition targets driver {} but this is {}",
                def.driver_name, self.name
            )));
        }
        Ok(())
    }

    async fn available_capacity(&self, _usage: NodeUsage, _def: &LabelDefinition) -> i64 {
        match self.pool() {
            Ok(pool) => pool.available_capacity(),
            Err(_) => 0,
        }
    }

    async fn allocate(
        &self,
        def: &LabelDefinition,
        metadata: Value,
    ) -> Result<ApplicationResource, DriverError> {
        let pool = self.pool()?;
        let (host_id, zone) = pool
            .reserve_allocate_host()
            .await
            .map_err(|e| DriverError::Provider(e.to_string()))?;
        debug!(host_id, zone, "allocated dedicated host slot");
        Ok(ApplicationResource {
            uid: Uid::new(),
            application_uid: Uid::nil(),
            identifier: host_id,
            ip_addr: None,
            hw_addr: None,
            authentication: def.resources.authentication.clone(),
            timeout: None,
            metadata,
            created_at: fish_base::time::now(),
            updated_at: fish_base::time::now(),
        })
    }

    async fn status(&self, _res: &ApplicationResource) -> Result<ResourceStatus, DriverError> {
        Ok(ResourceStatus::Allocated)
    }

    async fn deallocate(&self, res: &ApplicationResource) -> Result<(), DriverError> {
        let pool = self.pool()?;
        pool.release_slot(&res.identifier)
            .map_err(|e| DriverError::Provider(e.to_string()))
    }

    fn get_task(&self, _name: &str, _options: Value) -> Option<Box<dyn Task>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockProviderApi;

    fn config(max_hosts: u32) -> PoolConfig {
        PoolConfig {
            pool_tag: "macs".into(),
            zones: vec!["us-east".into()],
            instance_type: "mac2.metal".into(),
            host_type_vcpus: 8,
            instance_type_vcpus: 8,
            max_hosts,
            release_delay: Duration::from_secs(3600),
            scrubbing_delay: Duration::from_secs(86400),
            pending_to_available_delay: Duration::from_secs(0),
            is_mac_like: true,
        }
    }

    #[test]
    fn instances_per_host_is_forced_to_one_for_mac_like_pools() {
        let cfg = config(5);
        assert_eq!(cfg.instances_per_host(), 1);
    }

    #[test]
    fn instances_per_host_uses_vcpu_ratio_otherwise() {
        let mut cfg = config(5);
        cfg.is_mac_like = false;
        cfg.host_type_vcpus = 32;
        cfg.instance_type_vcpus = 8;
        assert_eq!(cfg.instances_per_host(), 4);
    }

    #[tokio::test]
    async fn reserve_allocate_host_provisions_fresh_host_when_pool_empty() {
        let provider = Arc::new(MockProviderApi::new(10));
        let worker = PoolWorker::new(config(5), provider, None, CancellationToken::new());
        let (host_id, zone) = worker.reserve_allocate_host().await.unwrap();
        assert_eq!(zone, "us-east");
        assert!(worker.hosts.contains_key(&host_id));
    }

    #[tokio::test]
    async fn reserve_allocate_host_reuses_available_host_before_allocating() {
        let provider = Arc::new(MockProviderApi::new(10));
        let worker = PoolWorker::new(config(5), provider.clone(), None, CancellationToken::new());
        let id = provider.seed_host("us-east", HostState::Available);
        worker.refresh().await.unwrap();
        let (host_id, _) = worker.reserve_allocate_host().await.unwrap();
        assert_eq!(host_id, id);
        assert!(provider
            .list_hosts("macs", "us-east", "mac2.metal")
            .await
            .unwrap()
            .iter()
            .all(|h| h.host_id == id));
    }

    #[tokio::test]
    async fn pool_exhausted_when_no_zone_has_capacity() {
        let provider = Arc::new(MockProviderApi::new(0));
        let worker = PoolWorker::new(config(0), provider, None, CancellationToken::new());
        let err = worker.reserve_allocate_host().await.unwrap_err();
        assert!(matches!(err, PoolError::PoolExhausted));
    }

    #[tokio::test]
    async fn release_sweep_releases_permanent_failures_immediately() {
        let provider = Arc::new(MockProviderApi::new(10));
        let id = provider.seed_host("us-east", HostState::PermanentFailure);
        let worker = PoolWorker::new(config(5), provider.clone(), None, CancellationToken::new());
        worker.refresh().await.unwrap();
        worker.release_sweep().await;
        assert!(provider
            .list_hosts("macs", "us-east", "mac2.metal")
            .await
            .unwrap()
            .is_empty());
        assert!(!worker.hosts.contains_key(&id));
    }

    #[tokio::test]
    async fn release_sweep_leaves_in_use_hosts_alone() {
        let provider = Arc::new(MockProviderApi::new(10));
        let worker = PoolWorker::new(config(5), provider.clone(), None, CancellationToken::new());
        let (host_id, _) = worker.reserve_allocate_host().await.unwrap();
        worker.refresh().await.unwrap();
        worker.release_sweep().await;
        assert!(worker.hosts.contains_key(&host_id));
    }

    #[tokio::test]
    async fn mac_like_hosts_require_scrub_before_release() {
        let provider = Arc::new(MockProviderApi::new(10));
        let id = provider.seed_host("us-east", HostState::Available);
        let mut cfg = config(5);
        cfg.release_delay = Duration::from_secs(0);
        let worker = PoolWorker::new(cfg, provider.clone(), None, CancellationToken::new());
        worker.refresh().await.unwrap();
        worker.release_sweep().await;
        assert!(worker.hosts.contains_key(&id), "never-scrubbed mac host must not release");
    }
}
