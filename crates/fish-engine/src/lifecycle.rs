//! Application Lifecycle Engine (C3). One spawned task per
//! in-flight Application, grounded on
//! `convex_engine::scheduler::IntervalScheduler`'s per-entity
//! spawned-task-plus-broadcast-shutdown idiom. The `Engine` struct
//! itself follows `convex_engine::builder::PricingEngineBuilder` for
//! construction.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use fish_base::cancel::CancellationToken;
use fish_base::uid::Uid;
use fish_storage::storage::Storage;
use fish_traits::driver::{Driver, NodeUsage};
use fish_traits::model::{
    Application, ApplicationResource, ApplicationState, ApplicationTask, Label, Status, TaskWhen,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::election::{Election, ElectionConfig, ElectionOutcome};
use crate::error::{EngineError, EngineResult};

/// How long an Application's ELECTED-owned-by-self recovery window is
/// trusted before a peer is considered dead for re-election purposes,
/// expressed as a multiple of the configured ping delay
/// (`SPEC_FULL.md` §5.3: "inactive > 3x ping delay").
pub const OWNER_INACTIVITY_MULTIPLE: i64 = 3;

/// Deferred-state TTL: how long an out-of-order `ApplicationState`
/// waits in `Engine::deferred` for its Application to arrive before
/// being discarded (`SPEC_FULL.md` §6).
pub const DEFERRED_STATE_TTL: Duration = Duration::from_secs(60);

/// Holds `ApplicationState` records whose `Application` has not yet
/// arrived in `Storage` — the out-of-order-arrival case `SPEC_FULL.md`
/// §6 calls out ("if ELECTED arrives before the Application, queue the
/// state and apply on Application arrival, within a bounded TTL, else
/// discard and log"). `fish-cluster`'s replication apply path and
/// `Engine::ingest_application_state` both funnel through this instead
/// of writing straight to `Storage`.
#[derive(Default)]
pub struct DeferredApplicationStates {
    pending: DashMap<Uid, Vec<(ApplicationState, Instant)>>,
}

impl DeferredApplicationStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `state` until its Application arrives.
    pub fn defer(&self, state: ApplicationState) {
        self.pending
            .entry(state.application_uid)
            .or_default()
            .push((state, Instant::now()));
    }

    /// Remove and return every still-fresh entry queued for
    /// `application_uid`, dropping any that have exceeded
    /// [`DEFERRED_STATE_TTL`].
    pub fn take(&self, application_uid: &Uid) -> Vec<ApplicationState> {
        let Some((_, entries)) = self.pending.remove(application_uid) else {
            return Vec::new();
        };
        entries
            .into_iter()
            .filter(|(_, queued_at)| queued_at.elapsed() < DEFERRED_STATE_TTL)
            .map(|(state, _)| state)
            .collect()
    }

    /// Drop every entry past its TTL across all Applications. Returns
    /// the number of entries dropped, for the caller to log.
    pub fn sweep_expired(&self) -> usize {
        let mut dropped = 0;
        self.pending.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|(_, queued_at)| queued_at.elapsed() < DEFERRED_STATE_TTL);
            dropped += before - entries.len();
            !entries.is_empty()
        });
        dropped
    }
}

/// Tunables threaded through every Application worker.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub election: ElectionConfig,
    pub ping_delay: Duration,
    pub node_shutdown_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            election: ElectionConfig::default(),
            ping_delay: Duration::from_secs(5),
            node_shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Builder for [`Engine`], mirroring `PricingEngineBuilder`'s
/// chainable `with_*` + validating `build()` shape.
#[derive(Default)]
pub struct EngineBuilder {
    storage: Option<Arc<Storage>>,
    local_node: Option<Uid>,
    config: EngineConfig,
    drivers: Vec<(String, Arc<dyn Driver>)>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_storage(mut self, storage: Arc<Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_local_node(mut self, node: Uid) -> Self {
        self.local_node = Some(node);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_driver(mut self, name: impl Into<String>, driver: Arc<dyn Driver>) -> Self {
        self.drivers.push((name.into(), driver));
        self
    }

    pub fn build(self) -> EngineResult<Engine> {
        let storage = self
            .storage
            .ok_or_else(|| EngineError::Configuration("storage is required".into()))?;
        let local_node = self
            .local_node
            .ok_or_else(|| EngineError::Configuration("local_node is required".into()))?;

        let drivers = DashMap::new();
        for (name, driver) in self.drivers {
            drivers.insert(name, driver);
        }

        Ok(Engine {
            storage,
            local_node,
            config: self.config,
            drivers,
            cancellations: DashMap::new(),
            deallocate_signals: DashMap::new(),
            deferred: DeferredApplicationStates::new(),
            reservations: DashMap::new(),
        })
    }
}

/// Coordinates every in-flight Application on this node.
pub struct Engine {
    storage: Arc<Storage>,
    local_node: Uid,
    config: EngineConfig,
    drivers: DashMap<String, Arc<dyn Driver>>,
    cancellations: DashMap<Uid, CancellationToken>,
    deallocate_signals: DashMap<Uid, mpsc::Sender<()>>,
    deferred: DeferredApplicationStates,
    /// Resource footprint reserved for each Application between
    /// NEW->ELECTED and DEALLOCATED/ERROR, keyed by ApplicationUID
    /// (`SPEC_FULL.md` §5.4: "Capacity is reserved at NEW->ELECTED
    /// time ... and released on DEALLOCATED or ERROR"). Consulted by
    /// [`Engine::choose_definition`] so concurrent elections on this
    /// node don't all see the same unreserved capacity.
    reservations: DashMap<Uid, (u32, u32, u32)>,
}

impl Engine {
    /// Start tracking `application`: spawns its worker task, unless one
    /// is already running for it. Called both for freshly observed
    /// Applications and for ones recovered at startup that need to
    /// resume from ELECTED/ALLOCATED.
    pub fn spawn(self: &Arc<Self>, application: Application) {
        if self.cancellations.contains_key(&application.uid) {
            return;
        }
        let engine = self.clone();
        let token = CancellationToken::new();
        self.cancellations.insert(application.uid, token.clone());
        let (tx, rx) = mpsc::channel(1);
        self.deallocate_signals.insert(application.uid, tx);
        tokio::spawn(async move {
            engine.run_application(application, token, rx).await;
        });
    }

    /// Entry point for a freshly observed `Application` record,
    /// whether created locally or arriving over the mesh: persists it,
    /// replays any `ApplicationState`s that had arrived out of order
    /// and were waiting in [`DeferredApplicationStates`], then spawns
    /// its worker.
    pub fn ingest_application(self: &Arc<Self>, application: Application) -> EngineResult<()> {
        self.storage.applications.put(application.uid, application.clone())?;
        for state in self.deferred.take(&application.uid) {
            self.storage.application_states.put(state.uid, state)?;
        }
        self.spawn(application);
        Ok(())
    }

    /// Entry point for a freshly observed `ApplicationState`, whether
    /// written locally or replicated from a peer: applies it
    /// immediately if its Application is already known, otherwise
    /// defers it (`SPEC_FULL.md` §6 "out-of-order arrival").
    pub fn ingest_application_state(&self, state: ApplicationState) -> EngineResult<()> {
        if self.storage.applications.get(&state.application_uid)?.is_some() {
            self.storage.application_states.put(state.uid, state)?;
        } else {
            debug!(application = %state.application_uid, "deferring state, application not yet known");
            self.deferred.defer(state);
        }
        Ok(())
    }

    /// Periodically drop deferred states that outlived
    /// [`DEFERRED_STATE_TTL`] without their Application ever arriving.
    /// Spawned once at node start.
    pub fn spawn_deferred_sweep(self: &Arc<Self>) {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DEFERRED_STATE_TTL / 2);
            loop {
                ticker.tick().await;
                let dropped = engine.deferred.sweep_expired();
                if dropped > 0 {
                    warn!(dropped, "discarded deferred application states past their TTL");
                }
            }
        });
    }

    /// Request deallocation of a running Application (the "explicit
    /// deallocate call" trigger in `SPEC_FULL.md` §4.3).
    pub fn request_deallocate(&self, application_uid: Uid) {
        if let Some(tx) = self.deallocate_signals.get(&application_uid) {
            let _ = tx.try_send(());
        }
    }

    /// Cancel every Application's context, per `SPEC_FULL.md` §5's
    /// node-shutdown rule: cancel, wait up to `node_shutdown_grace`,
    /// then force-close regardless of driver response.
    pub async fn shutdown(&self) {
        for entry in self.cancellations.iter() {
            entry.value().cancel();
        }
        tokio::time::sleep(self.config.node_shutdown_grace).await;
    }

    fn driver(&self, name: &str) -> EngineResult<Arc<dyn Driver>> {
        self.drivers
            .get(name)
            .map(|d| d.clone())
            .ok_or_else(|| EngineError::UnknownDriver(name.to_string()))
    }

    /// Whether any `LabelDefinition` merely validates against a
    /// registered driver on this node, ignoring capacity. Backs
    /// election voting (`SPEC_FULL.md` §4.2: a node "can host it" iff
    /// a definition passes `ValidateDefinition` and the `node_filter`
    /// matches — capacity is deliberately not part of the vote).
    fn validates_any_definition(&self, label: &Label) -> Option<usize> {
        label
            .definitions
            .iter()
            .position(|def| match self.driver(&def.driver_name) {
                Ok(driver) => driver.validate_definition(def).is_ok(),
                Err(_) => false,
            })
    }

    fn is_capable(&self, label: &Label, node_name: &str, node_location: &str) -> bool {
        self.validates_any_definition(label)
            .map(|idx| node_filter_matches(&label.definitions[idx].node_filter, node_name, node_location))
            .unwrap_or(false)
    }

    /// Choose the first `LabelDefinition` that both validates against a
    /// registered driver and has spare capacity on this node given
    /// `usage`, ties broken by definition order (`SPEC_FULL.md` §4.3
    /// NEW->ELECTED: "first that ValidateDefinition and
    /// AvailableCapacity>0"). Only the ELECTED-selection call site uses
    /// this; election voting uses [`Engine::validates_any_definition`]
    /// instead, per the spec's capacity-free voting definition.
    async fn choose_definition(&self, label: &Label, usage: NodeUsage) -> Option<usize> {
        for (idx, def) in label.definitions.iter().enumerate() {
            let Ok(driver) = self.driver(&def.driver_name) else {
                continue;
            };
            if driver.validate_definition(def).is_err() {
                continue;
            }
            if driver.available_capacity(usage, def).await > 0 {
                return Some(idx);
            }
        }
        None
    }

    /// This node's currently reserved footprint across every in-flight
    /// Application past election, combined with whether the node
    /// itself accepts overbooked tenants.
    fn current_usage(&self, multitenancy: bool) -> NodeUsage {
        let (cpu, ram, disk) = self
            .reservations
            .iter()
            .fold((0u32, 0u32, 0u32), |(cpu, ram, disk), entry| {
                let (c, r, d) = *entry.value();
                (cpu + c, ram + r, disk + d)
            });
        NodeUsage {
            cpu,
            ram,
            disk,
            multitenancy,
        }
    }

    /// Reserve `def`'s footprint for `application_uid`, called once at
    /// NEW->ELECTED. Released by [`Engine::release_capacity`] on
    /// DEALLOCATED or ERROR.
    fn reserve_capacity(&self, application_uid: Uid, def: &fish_traits::model::LabelDefinition) {
        let disk: u32 = def.resources.disks.values().map(|d| d.size).sum();
        self.reservations
            .insert(application_uid, (def.resources.cpu, def.resources.ram, disk));
    }

    /// Release `application_uid`'s reserved footprint, if any. A no-op
    /// if nothing was reserved (e.g. election was lost or no usable
    /// definition existed), so it is safe to call unconditionally at
    /// every terminal transition.
    fn release_capacity(&self, application_uid: &Uid) {
        self.reservations.remove(application_uid);
    }

    /// This node's own `Node` record, needed to evaluate `node_filter`
    /// against our `name`/`location` (`SPEC_FULL.md` §4.2). Absent only
    /// before the node has registered itself at startup, which is a
    /// configuration error by the time any Application is being driven.
    fn local_node_info(&self) -> EngineResult<fish_traits::model::Node> {
        self.storage
            .nodes
            .get(&self.local_node)?
            .ok_or(EngineError::UnknownNode(self.local_node))
    }

    async fn write_state(
        &self,
        application_uid: Uid,
        status: Status,
        description: Option<String>,
    ) -> EngineResult<()> {
        let state = ApplicationState {
            uid: Uid::new(),
            application_uid,
            status,
            description,
            node_uid: self.local_node,
            created_at: fish_base::time::now(),
        };
        self.storage.application_states.put(state.uid, state)?;
        Ok(())
    }

    fn latest_state(&self, application_uid: Uid) -> EngineResult<Option<ApplicationState>> {
        let mut states: Vec<_> = self
            .storage
            .application_states
            .list()?
            .into_iter()
            .filter(|s| s.application_uid == application_uid)
            .collect();
        states.sort_by(|a, b| (a.created_at, a.node_uid).cmp(&(b.created_at, b.node_uid)));
        Ok(states.pop())
    }

    async fn run_application(
        self: Arc<Self>,
        application: Application,
        token: CancellationToken,
        mut deallocate_rx: mpsc::Receiver<()>,
    ) {
        let result = self
            .drive_to_completion(&application, &token, &mut deallocate_rx)
            .await;
        if let Err(e) = result {
            error!(application = %application.uid, error = %e, "application worker exited with error");
            let _ = self
                .write_state(application.uid, Status::Error, Some(e.to_string()))
                .await;
        }
        self.release_capacity(&application.uid);
        self.cancellations.remove(&application.uid);
        self.deallocate_signals.remove(&application.uid);
    }

    async fn drive_to_completion(
        &self,
        application: &Application,
        token: &CancellationToken,
        deallocate_rx: &mut mpsc::Receiver<()>,
    ) -> EngineResult<()> {
        let label = self
            .storage
            .labels
            .get(&application.label_uid)?
            .ok_or(EngineError::NoUsableDefinition(application.label_uid))?;

        // NEW -> ELECTED (or stop if another node wins).
        let local_node = self.local_node_info()?;
        let capable = self.is_capable(&label, &local_node.name, &local_node.location);
        let winner = self.run_election(application, capable).await?;
        let usage = self.current_usage(local_node.multitenancy);
        let def_index = match winner {
            ElectionOutcome::Won(_) => match self.choose_definition(&label, usage).await {
                Some(idx) => idx,
                None => {
                    self.write_state(
                        application.uid,
                        Status::Error,
                        Some("no usable definition at election time".into()),
                    )
                    .await?;
                    return Ok(());
                }
            },
            ElectionOutcome::Lost(_) => {
                debug!(application = %application.uid, "lost election, no longer tracking");
                return Ok(());
            }
            ElectionOutcome::Exhausted => {
                self.write_state(
                    application.uid,
                    Status::Error,
                    Some("no capable node after max election rounds".into()),
                )
                .await?;
                return Ok(());
            }
        };
        self.write_state(application.uid, Status::Elected, None).await?;

        let def = &label.definitions[def_index];
        self.reserve_capacity(application.uid, def);
        let driver = self.driver(&def.driver_name)?;

        // ELECTED -> ALLOCATED
        let metadata = merge_metadata(&label.metadata, &application.metadata);
        let resource = match driver.allocate(def, metadata).await {
            Ok(mut resource) => {
                resource.application_uid = application.uid;
                self.storage.put_application_resource(resource.clone())?;
                self.write_state(application.uid, Status::Allocated, None).await?;
                resource
            }
            Err(e) => {
                self.write_state(application.uid, Status::Error, Some(e.to_string()))
                    .await?;
                self.release_capacity(&application.uid);
                return Ok(());
            }
        };

        // ALLOCATED: run when=Allocated tasks, failures logged only.
        self.run_tasks(application.uid, def, &resource, &driver, TaskWhen::Allocated)
            .await;

        // Wait for deallocate trigger: explicit request, timeout, or
        // node shutdown cancellation.
        let timeout_sleep = match resource.timeout {
            Some(t) => {
                let now = fish_base::time::now();
                let dur = (t - now).to_std().unwrap_or(Duration::from_secs(0));
                Some(tokio::time::sleep(dur))
            }
            None => None,
        };
        tokio::select! {
            _ = token.cancelled() => {
                self.write_state(application.uid, Status::Error, Some("cancelled".into())).await?;
                self.release_capacity(&application.uid);
                return Ok(());
            }
            _ = deallocate_rx.recv() => {}
            _ = async {
                match timeout_sleep {
                    Some(sleep) => sleep.await,
                    None => std::future::pending().await,
                }
            } => {}
        }

        self.write_state(application.uid, Status::Deallocate, None).await?;

        // DEALLOCATE: when=Deallocate tasks run before driver.Deallocate.
        self.run_tasks(application.uid, def, &resource, &driver, TaskWhen::Deallocate)
            .await;

        match driver.deallocate(&resource).await {
            Ok(()) => {
                self.write_state(application.uid, Status::Deallocated, None).await?;
            }
            Err(e) => {
                warn!(application = %application.uid, error = %e, "deallocate failed, resource may linger");
                self.write_state(application.uid, Status::Error, Some(e.to_string()))
                    .await?;
            }
        }
        self.release_capacity(&application.uid);
        Ok(())
    }

    async fn run_election(
        &self,
        application: &Application,
        capable: bool,
    ) -> EngineResult<ElectionOutcome> {
        let election = Election::new(self.storage.clone(), self.local_node);
        election.elect(application, capable, self.config.election).await
    }

    async fn run_tasks(
        &self,
        application_uid: Uid,
        def: &fish_traits::model::LabelDefinition,
        resource: &ApplicationResource,
        driver: &Arc<dyn Driver>,
        when: TaskWhen,
    ) {
        let tasks: Vec<ApplicationTask> = match self.storage.application_tasks.list() {
            Ok(tasks) => tasks
                .into_iter()
                .filter(|t| t.application_uid == application_uid && t.when == when)
                .collect(),
            Err(e) => {
                warn!(application = %application_uid, error = %e, "failed to list tasks");
                return;
            }
        };
        for mut task in tasks {
            let Some(mut runnable) = driver.get_task(&task.name, task.options.clone()) else {
                warn!(application = %application_uid, task = %task.name, "driver has no such task");
                continue;
            };
            runnable.set_info(def.clone(), resource.clone());
            match runnable.execute().await {
                Ok(result) => {
                    task.result = Some(result);
                    task.updated_at = fish_base::time::now();
                    if let Err(e) = self.storage.application_tasks.put(task.uid, task) {
                        warn!(error = %e, "failed to persist task result");
                    }
                }
                Err(e) => {
                    warn!(application = %application_uid, task = %task.name, error = %e, "task failed, state unaffected");
                }
            }
        }
    }

    /// Startup recovery pass (`SPEC_FULL.md` §4.3/§5.3): any
    /// Application whose latest state is `Elected` and whose elected
    /// node is this node becomes `Recovered`. Any Application whose
    /// owner node has been inactive for more than
    /// `OWNER_INACTIVITY_MULTIPLE * ping_delay` and has no
    /// `ApplicationResource` returns to `New` for re-election.
    pub async fn recover(&self) -> EngineResult<()> {
        let applications = self.storage.applications.list()?;
        for application in applications {
            let Some(latest) = self.latest_state(application.uid)? else {
                continue;
            };
            if latest.status.is_terminal() {
                continue;
            }
            match latest.status {
                Status::Elected if latest.node_uid == self.local_node => {
                    info!(application = %application.uid, "recovered: was elected by this node before restart");
                    self.write_state(application.uid, Status::Recovered, None)
                        .await?;
                }
                Status::Allocated if latest.node_uid == self.local_node => {
                    let has_resource = self
                        .storage
                        .application_resources
                        .list()?
                        .into_iter()
                        .any(|r| r.application_uid == application.uid);
                    if has_resource {
                        info!(application = %application.uid, "recovered: allocated resource exists from before restart");
                        self.write_state(application.uid, Status::Recovered, None)
                            .await?;
                    }
                }
                _ => {
                    let owner = self.storage.nodes.get(&latest.node_uid)?;
                    let inactive = owner
                        .map(|n| {
                            !n.is_active(
                                self.config.ping_delay.as_secs() as i64 * OWNER_INACTIVITY_MULTIPLE / 2,
                                fish_base::time::now(),
                            )
                        })
                        .unwrap_or(true);
                    let has_resource = self
                        .storage
                        .application_resources
                        .list()?
                        .into_iter()
                        .any(|r| r.application_uid == application.uid);
                    if inactive && !has_resource {
                        info!(application = %application.uid, "owner inactive, returning to NEW for re-election");
                        self.write_state(application.uid, Status::New, None).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Spawn a worker for every Application that has no tracked state
    /// yet or whose latest state is `New` — the startup counterpart to
    /// [`Engine::recover`], which only handles Applications already
    /// past election. Called once at node start, after `recover`.
    pub async fn resume_untracked(self: &Arc<Self>) -> EngineResult<()> {
        let applications = self.storage.applications.list()?;
        for application in applications {
            let needs_spawn = match self.latest_state(application.uid)? {
                None => true,
                Some(state) => state.status == Status::New,
            };
            if needs_spawn {
                self.spawn(application);
            }
        }
        Ok(())
    }
}

fn node_filter_matches(filter: &[String], node_name: &str, node_location: &str) -> bool {
    filter.is_empty()
        || filter.iter().any(|f| f == node_name || f == node_location)
}

fn merge_metadata(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut merged = base_map.clone();
            for (k, v) in overlay_map {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        _ => overlay.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fish_traits::driver::{DriverError, ResourceStatus, Task};
    use fish_traits::model::{ApplicationResource, LabelDefinition, Resources};
    use std::collections::HashMap;

    /// A driver whose `available_capacity` is a simple linear budget,
    /// so tests can assert that [`Engine::choose_definition`] actually
    /// threads live reservations into the call rather than only
    /// validating.
    struct BudgetDriver {
        name: String,
        cpu_limit: u32,
    }

    #[async_trait]
    impl Driver for BudgetDriver {
        fn name(&self) -> &str {
            &self.name
        }

        fn is_remote(&self) -> bool {
            false
        }

        fn prepare(&mut self, _cfg: &Value) -> Result<(), DriverError> {
            Ok(())
        }

        fn validate_definition(&self, _def: &LabelDefinition) -> Result<(), DriverError> {
            Ok(())
        }

        async fn available_capacity(&self, usage: NodeUsage, def: &LabelDefinition) -> i64 {
            if usage.cpu + def.resources.cpu <= self.cpu_limit {
                1
            } else {
                0
            }
        }

        async fn allocate(
            &self,
            _def: &LabelDefinition,
            _metadata: Value,
        ) -> Result<ApplicationResource, DriverError> {
            unreachable!("not exercised by these tests")
        }

        async fn status(&self, _res: &ApplicationResource) -> Result<ResourceStatus, DriverError> {
            unreachable!("not exercised by these tests")
        }

        async fn deallocate(&self, _res: &ApplicationResource) -> Result<(), DriverError> {
            unreachable!("not exercised by these tests")
        }

        fn get_task(&self, _name: &str, _options: Value) -> Option<Box<dyn Task>> {
            None
        }
    }

    fn definition(driver_name: &str, cpu: u32) -> LabelDefinition {
        LabelDefinition {
            driver_name: driver_name.into(),
            options: Value::Null,
            resources: Resources {
                cpu,
                ram: 1024,
                disks: HashMap::new(),
                network: None,
                authentication: None,
                multitenancy: false,
                cpu_overbook: false,
                ram_overbook: false,
            },
            node_filter: Vec::new(),
        }
    }

    fn label_with(def: LabelDefinition) -> Label {
        Label {
            uid: Uid::new(),
            name: "test".into(),
            version: 1,
            metadata: serde_json::json!({}),
            definitions: vec![def],
            created_at: fish_base::time::now(),
            updated_at: fish_base::time::now(),
        }
    }

    fn engine_with_budget_driver(cpu_limit: u32) -> Engine {
        EngineBuilder::new()
            .with_storage(Arc::new(Storage::memory()))
            .with_local_node(Uid::new())
            .with_driver(
                "budget",
                Arc::new(BudgetDriver {
                    name: "budget".into(),
                    cpu_limit,
                }),
            )
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn choose_definition_honors_capacity_not_just_validation() {
        let engine = engine_with_budget_driver(4);
        let label = label_with(definition("budget", 2));

        // No reservations yet: 0 + 2 <= 4, the definition is usable.
        let idx = engine.choose_definition(&label, engine.current_usage(false)).await;
        assert_eq!(idx, Some(0));
    }

    #[tokio::test]
    async fn choose_definition_rejects_when_reserved_usage_exhausts_capacity() {
        let engine = engine_with_budget_driver(4);
        let label = label_with(definition("budget", 2));

        // Another in-flight Application already reserved 3 cpu on this
        // node; 3 + 2 > 4, so the definition must no longer be chosen
        // even though `validate_definition` still accepts it.
        let other = definition("budget", 3);
        engine.reserve_capacity(Uid::new(), &other);

        let usage = engine.current_usage(false);
        assert_eq!(usage.cpu, 3);
        let idx = engine.choose_definition(&label, usage).await;
        assert_eq!(idx, None);
    }

    #[tokio::test]
    async fn release_capacity_frees_a_prior_reservation() {
        let engine = engine_with_budget_driver(4);
        let application_uid = Uid::new();
        engine.reserve_capacity(application_uid, &definition("budget", 3));
        assert_eq!(engine.current_usage(false).cpu, 3);

        engine.release_capacity(&application_uid);
        assert_eq!(engine.current_usage(false).cpu, 0);

        let label = label_with(definition("budget", 2));
        let idx = engine.choose_definition(&label, engine.current_usage(false)).await;
        assert_eq!(idx, Some(0));
    }

    #[test]
    fn is_capable_ignores_capacity_per_voting_definition() {
        // `validate_definition` always Ok here regardless of capacity,
        // and is_capable never consults available_capacity at all —
        // it only checks validation + node_filter, per SPEC_FULL.md
        // §5.2's capacity-free voting rule.
        let engine = engine_with_budget_driver(0);
        let label = label_with(definition("budget", 100));
        assert!(engine.is_capable(&label, "any-node", "anywhere"));
    }

    #[test]
    fn node_filter_empty_matches_everything() {
        assert!(node_filter_matches(&[], "any", "anywhere"));
    }

    #[test]
    fn node_filter_matches_name_or_location() {
        let filter = vec!["us-east".to_string()];
        assert!(node_filter_matches(&filter, "node-a", "us-east"));
        assert!(!node_filter_matches(&filter, "node-a", "us-west"));
    }

    #[test]
    fn application_metadata_wins_conflicts() {
        let base = serde_json::json!({"a": 1, "b": 2});
        let overlay = serde_json::json!({"b": 3, "c": 4});
        let merged = merge_metadata(&base, &overlay);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 3);
        assert_eq!(merged["c"], 4);
    }
}
