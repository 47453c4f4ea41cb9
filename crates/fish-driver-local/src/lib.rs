//! A minimal node-local provider driver.
//!
//! Grounded on `convex-traits::coordination`'s no-op/in-memory trait
//! implementations (the pattern of keeping the simplest possible
//! conforming implementation as the default/test double): this driver
//! provisions nothing external — `allocate` just fabricates an
//! identifier and records it — but otherwise implements the full
//! [`Driver`] contract, including node-local capacity accounting via
//! [`fish_engine::capacity::node_local_slots`], so the lifecycle engine
//! is exercisable end-to-end without a cloud account
//! (`SPEC_FULL.md` §3).

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

use async_trait::async_trait;
use fish_base::uid::Uid;
use fish_engine::capacity::{node_local_slots, NodeCapacityConfig};
use fish_traits::driver::{Driver, DriverError, NodeUsage as TraitNodeUsage, ResourceStatus, Task};
use fish_traits::model::{ApplicationResource, LabelDefinition};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

/// Opaque JSON configuration this driver accepts via [`Driver::prepare`].
#[derive(Debug, Clone, Default, Deserialize)]
struct LocalDriverConfig {
    #[serde(default)]
    total_cpu: i64,
    #[serde(default)]
    total_ram: i64,
    #[serde(default)]
    cpu_alter: i64,
    #[serde(default)]
    ram_alter: i64,
    #[serde(default)]
    cpu_overbook: i64,
    #[serde(default)]
    ram_overbook: i64,
    #[serde(default)]
    total_disk: i64,
    #[serde(default)]
    network_tags: Vec<String>,
}

impl From<&LocalDriverConfig> for NodeCapacityConfig {
    fn from(cfg: &LocalDriverConfig) -> Self {
        NodeCapacityConfig {
            total_cpu: cfg.total_cpu,
            total_ram: cfg.total_ram,
            cpu_alter: cfg.cpu_alter,
            ram_alter: cfg.ram_alter,
            cpu_overbook: cfg.cpu_overbook,
            ram_overbook: cfg.ram_overbook,
            total_disk: cfg.total_disk,
            network_tags: cfg.network_tags.clone(),
        }
    }
}

/// The node-local driver. One instance per node; configured totals are
/// fixed at `prepare` time, live usage is supplied per-call by the
/// caller (the lifecycle engine tracks it, not the driver itself).
pub struct LocalDriver {
    name: String,
    config: LocalDriverConfig,
}

impl LocalDriver {
    /// Construct an unconfigured driver under `name`. Call
    /// [`Driver::prepare`] before use.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: LocalDriverConfig::default(),
        }
    }
}

#[async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_remote(&self) -> bool {
        false
    }

    fn prepare(&mut self, cfg: &Value) -> Result<(), DriverError> {
        self.config = serde_json::from_value(cfg.clone())
            .map_err(|e| DriverError::InvalidConfig(e.to_string()))?;
        Ok(())
    }

    fn validate_definition(&self, def: &LabelDefinition) -> Result<(), DriverError> {
        if def.driver_name != self.name {
            return Err(DriverError::InvalidDefinition(format!(
                "definition targets driver {} but this is {}",
                def.driver_name, self.name
            )));
        }
        let baseline = fish_engine::capacity::NodeUsage::default();
        if node_local_slots(&(&self.config).into(), baseline, &def.resources) <= 0 {
            return Err(DriverError::InvalidDefinition(
                "definition's resources exceed this node's configured totals".into(),
            ));
        }
        Ok(())
    }

    async fn available_capacity(&self, usage: TraitNodeUsage, def: &LabelDefinition) -> i64 {
        let engine_usage = fish_engine::capacity::NodeUsage {
            cpu: usage.cpu as i64,
            ram: usage.ram as i64,
            disk: usage.disk as i64,
            multitenancy: usage.multitenancy,
        };
        node_local_slots(&(&self.config).into(), engine_usage, &def.resources)
    }

    async fn allocate(
        &self,
        def: &LabelDefinition,
        metadata: Value,
    ) -> Result<ApplicationResource, DriverError> {
        let identifier = format!("local-{}", Uid::new());
        debug!(identifier, "allocating local no-op resource");
        Ok(ApplicationResource {
            uid: Uid::new(),
            application_uid: Uid::nil(),
            identifier,
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
        debug!(identifier = %res.identifier, "deallocating local no-op resource");
        Ok(())
    }

    fn get_task(&self, name: &str, options: Value) -> Option<Box<dyn Task>> {
        if name == NoopTask::NAME {
            Some(Box::new(NoopTask::new(options)))
        } else {
            None
        }
    }
}

/// The only task this driver offers: does nothing and returns an
/// empty result blob. Exists so Applications referencing a
/// `when=ALLOCATED`/`when=DEALLOCATE` task against this driver have
/// something to execute end-to-end in tests.
struct NoopTask {
    options: Value,
    def: Option<LabelDefinition>,
    res: Option<ApplicationResource>,
}

impl NoopTask {
    const NAME: &'static str = "noop";

    fn new(options: Value) -> Self {
        Self {
            options,
            def: None,
            res: None,
        }
    }
}

#[async_trait]
impl Task for NoopTask {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn set_info(&mut self, def: LabelDefinition, res: ApplicationResource) {
        self.def = Some(def);
        self.res = Some(res);
    }

    async fn execute(&self) -> Result<Vec<u8>, DriverError> {
        let _ = &self.options;
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fish_traits::model::Resources;
    use std::collections::HashMap;

    fn def(cpu: u32, ram: u32) -> LabelDefinition {
        LabelDefinition {
            driver_name: "local".into(),
            options: Value::Null,
            resources: Resources {
                cpu,
                ram,
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

    #[test]
    fn prepare_parses_config() {
        let mut driver = LocalDriver::new("local");
        driver
            .prepare(&serde_json::json!({"total_cpu": 8, "total_ram": 16384}))
            .unwrap();
        assert_eq!(driver.config.total_cpu, 8);
    }

    #[test]
    fn validate_definition_rejects_wrong_driver_name() {
        let mut driver = LocalDriver::new("local");
        driver
            .prepare(&serde_json::json!({"total_cpu": 8, "total_ram": 16384}))
            .unwrap();
        let mut other = def(1, 1024);
        other.driver_name = "dedicated".into();
        assert!(driver.validate_definition(&other).is_err());
    }

    #[test]
    fn validate_definition_rejects_oversized_request() {
        let mut driver = LocalDriver::new("local");
        driver
            .prepare(&serde_json::json!({"total_cpu": 2, "total_ram": 2048}))
            .unwrap();
        assert!(driver.validate_definition(&def(4, 1024)).is_err());
    }

    #[tokio::test]
    async fn allocate_then_deallocate_is_idempotent() {
        let mut driver = LocalDriver::new("local");
        driver
            .prepare(&serde_json::json!({"total_cpu": 8, "total_ram": 16384}))
            .unwrap();
        let definition = def(1, 1024);
        let resource = driver
            .allocate(&definition, serde_json::json!({}))
            .await
            .unwrap();
        assert!(resource.identifier.starts_with("local-"));
        driver.deallocate(&resource).await.unwrap();
        driver.deallocate(&resource).await.unwrap();
    }

    #[tokio::test]
    async fn available_capacity_uses_node_local_formula() {
        let mut driver = LocalDriver::new("local");
        driver
            .prepare(&serde_json::json!({"total_cpu": 4, "total_ram": 4096}))
            .unwrap();
        let usage = TraitNodeUsage::default();
        let slots = driver.available_capacity(usage, &def(1, 1024)).await;
        assert_eq!(slots, 4);
    }

    #[test]
    fn get_task_returns_noop_by_name_only() {
        let driver = LocalDriver::new("local");
        assert!(driver.get_task("noop", Value::Null).is_some());
        assert!(driver.get_task("snapshot", Value::Null).is_none());
    }
}
