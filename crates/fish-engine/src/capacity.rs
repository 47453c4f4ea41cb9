//! Capacity Accounting (C4). Formulas from `SPEC_FULL.md` §5.4,
//! plus a TTL cache for remote-driver lookups grounded on
//! `convex_engine::cache`'s `Instant`-keyed expiry idiom.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use fish_traits::model::Resources;

/// Minimum cache lifetime for a remote driver's `available_capacity`
/// result, per `SPEC_FULL.md` §5.4 ("must cache ... for >= 30s").
pub const REMOTE_CAPACITY_CACHE_TTL: Duration = Duration::from_secs(30);

/// Node-wide configured totals and overbook allowances used by the
/// node-local capacity formula.
#[derive(Debug, Clone)]
pub struct NodeCapacityConfig {
    pub total_cpu: i64,
    /// RAM in megabytes.
    pub total_ram: i64,
    /// Negative to reserve headroom, positive to grant extra.
    pub cpu_alter: i64,
    pub ram_alter: i64,
    pub cpu_overbook: i64,
    pub ram_overbook: i64,
    /// Disk space in gigabytes this node can hand out; disk never
    /// participates in overbook (`SPEC_FULL.md` §5.4 only names
    /// cpu/ram overbook).
    pub total_disk: i64,
    /// Network tags this node can satisfy. Empty means unrestricted;
    /// a non-empty list rejects any request naming a tag outside it.
    pub network_tags: Vec<String>,
}

/// Live per-node consumption, mirroring
/// [`fish_traits::driver::NodeUsage`] but tracked by the engine rather
/// than passed in by a caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeUsage {
    pub cpu: i64,
    pub ram: i64,
    /// Disk space in gigabytes already handed out.
    pub disk: i64,
    pub multitenancy: bool,
}

/// Compute the node-local slot count for `resources` given `cfg` and
/// the node's current `usage`. Returns `0` if the node simply cannot
/// serve this shape of request (e.g. cpu/ram requirement is zero or
/// negative availability), never a negative count — node-local drivers
/// never hit the provider-side `-1` "unrecoverable error" case.
pub fn node_local_slots(cfg: &NodeCapacityConfig, usage: NodeUsage, resources: &Resources) -> i64 {
    if let Some(tag) = &resources.network {
        if !cfg.network_tags.is_empty() && !cfg.network_tags.contains(tag) {
            return 0;
        }
    }

    let mut avail_cpu = cfg.total_cpu + cfg.cpu_alter;
    let mut avail_ram = cfg.total_ram + cfg.ram_alter;

    let overbook_applies = usage.multitenancy
        && resources.multitenancy
        && resources.cpu_overbook
        && resources.ram_overbook;
    if overbook_applies {
        avail_cpu += cfg.cpu_overbook;
        avail_ram += cfg.ram_overbook;
    } else {
        // Per `SPEC_FULL.md` §8's boundary property: overbook is
        // applied wholesale or not at all, never per-resource, but the
        // cpu/ram overbook flags on `resources` are independent knobs
        // the caller may also set individually; honor whichever are
        // true without the multitenancy gate having to match both.
        if usage.multitenancy && resources.multitenancy && resources.cpu_overbook {
            avail_cpu += cfg.cpu_overbook;
        }
        if usage.multitenancy && resources.multitenancy && resources.ram_overbook {
            avail_ram += cfg.ram_overbook;
        }
    }

    if resources.cpu as i64 > avail_cpu - usage.cpu {
        return 0;
    }
    if resources.ram as i64 > avail_ram - usage.ram {
        return 0;
    }

    let by_cpu = (avail_cpu - usage.cpu) / resources.cpu.max(1) as i64;
    let by_ram = (avail_ram - usage.ram) / resources.ram.max(1) as i64;
    let mut slots = by_cpu.min(by_ram).max(0);

    let disk_per_instance: i64 = resources.disks.values().map(|d| d.size as i64).sum();
    if disk_per_instance > 0 {
        let avail_disk = cfg.total_disk - usage.disk;
        if disk_per_instance > avail_disk {
            return 0;
        }
        slots = slots.min(avail_disk / disk_per_instance);
    }

    slots
}

/// TTL cache for a remote driver's `available_capacity` result, keyed
/// by whatever the driver considers an "instance type" string.
/// Invalidated explicitly on local allocate/deallocate, per
/// `SPEC_FULL.md` §5.4.
#[derive(Default)]
pub struct RemoteCapacityCache {
    entries: DashMap<String, (i64, Instant)>,
}

impl RemoteCapacityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cached value for `key`, if still within its TTL.
    pub fn get(&self, key: &str) -> Option<i64> {
        let entry = self.entries.get(key)?;
        let (value, stored_at) = *entry;
        if stored_at.elapsed() < REMOTE_CAPACITY_CACHE_TTL {
            Some(value)
        } else {
            None
        }
    }

    /// Record a freshly fetched value for `key`.
    pub fn put(&self, key: impl Into<String>, value: i64) {
        self.entries.insert(key.into(), (value, Instant::now()));
    }

    /// Drop the cached value for `key`, forcing the next lookup to hit
    /// the provider. Called after a local allocate/deallocate against
    /// that instance type.
    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resources(cpu: u32, ram: u32, multitenancy: bool, cpu_ob: bool, ram_ob: bool) -> Resources {
        Resources {
            cpu,
            ram,
            disks: HashMap::new(),
            network: None,
            authentication: None,
            multitenancy,
            cpu_overbook: cpu_ob,
            ram_overbook: ram_ob,
        }
    }

    fn base_cfg() -> NodeCapacityConfig {
        NodeCapacityConfig {
            total_cpu: 4,
            total_ram: 8192,
            cpu_alter: 0,
            ram_alter: 0,
            cpu_overbook: 0,
            ram_overbook: 0,
            total_disk: 0,
            network_tags: Vec::new(),
        }
    }

    #[test]
    fn zero_when_cpu_exceeds_availability_regardless_of_ram() {
        let cfg = NodeCapacityConfig {
            total_ram: 8192,
            ..base_cfg()
        };
        let usage = NodeUsage::default();
        let res = resources(8, 1, false, false, false);
        assert_eq!(node_local_slots(&cfg, usage, &res), 0);
    }

    #[test]
    fn zero_when_ram_exceeds_availability_regardless_of_cpu() {
        let cfg = NodeCapacityConfig {
            total_cpu: 32,
            total_ram: 1024,
            ..base_cfg()
        };
        let usage = NodeUsage::default();
        let res = resources(1, 4096, false, false, false);
        assert_eq!(node_local_slots(&cfg, usage, &res), 0);
    }

    #[test]
    fn overbook_never_applies_if_either_side_lacks_multitenancy() {
        let cfg = NodeCapacityConfig {
            total_cpu: 4,
            total_ram: 4096,
            cpu_overbook: 100,
            ram_overbook: 100_000,
            ..base_cfg()
        };
        let usage_no_mt = NodeUsage {
            cpu: 0,
            ram: 0,
            disk: 0,
            multitenancy: false,
        };
        let res = resources(1, 1024, true, true, true);
        // node usage says no multitenancy, so overbook must not apply:
        // slots should be bound by the un-overbooked totals (4 cpu / 1
        // cpu each = 4, 4096 ram / 1024 each = 4).
        assert_eq!(node_local_slots(&cfg, usage_no_mt, &res), 4);
    }

    #[test]
    fn overbook_applies_when_both_sides_opt_in() {
        let cfg = NodeCapacityConfig {
            total_cpu: 4,
            total_ram: 4096,
            cpu_overbook: 4,
            ram_overbook: 4096,
            ..base_cfg()
        };
        let usage = NodeUsage {
            cpu: 0,
            ram: 0,
            disk: 0,
            multitenancy: true,
        };
        let res = resources(1, 1024, true, true, true);
        // (4+4)/1 = 8, (4096+4096)/1024 = 8
        assert_eq!(node_local_slots(&cfg, usage, &res), 8);
    }

    #[test]
    fn disk_requirement_clamps_slot_count_below_cpu_ram_bound() {
        let cfg = NodeCapacityConfig {
            total_cpu: 16,
            total_ram: 65536,
            total_disk: 100,
            ..base_cfg()
        };
        let usage = NodeUsage::default();
        let mut res = resources(1, 1024, false, false, false);
        res.disks.insert(
            "root".into(),
            fish_traits::model::Disk {
                size: 30,
                disk_type: "ssd".into(),
                label: None,
                clone: None,
                reuse: false,
            },
        );
        // cpu/ram bound would allow 16 slots, but 100/30 = 3.
        assert_eq!(node_local_slots(&cfg, usage, &res), 3);
    }

    #[test]
    fn zero_when_single_instance_disk_exceeds_total() {
        let cfg = NodeCapacityConfig {
            total_cpu: 16,
            total_ram: 65536,
            total_disk: 10,
            ..base_cfg()
        };
        let usage = NodeUsage::default();
        let mut res = resources(1, 1024, false, false, false);
        res.disks.insert(
            "root".into(),
            fish_traits::model::Disk {
                size: 20,
                disk_type: "ssd".into(),
                label: None,
                clone: None,
                reuse: false,
            },
        );
        assert_eq!(node_local_slots(&cfg, usage, &res), 0);
    }

    #[test]
    fn zero_when_network_tag_not_in_allowed_list() {
        let cfg = NodeCapacityConfig {
            network_tags: vec!["public".into()],
            ..base_cfg()
        };
        let usage = NodeUsage::default();
        let mut res = resources(1, 1024, false, false, false);
        res.network = Some("private".into());
        assert_eq!(node_local_slots(&cfg, usage, &res), 0);
    }

    #[test]
    fn network_tag_allowed_when_in_list() {
        let cfg = NodeCapacityConfig {
            network_tags: vec!["public".into()],
            ..base_cfg()
        };
        let usage = NodeUsage::default();
        let mut res = resources(1, 1024, false, false, false);
        res.network = Some("public".into());
        assert_eq!(node_local_slots(&cfg, usage, &res), 4);
    }

    #[test]
    fn remote_cache_respects_ttl_and_invalidation() {
        let cache = RemoteCapacityCache::new();
        assert_eq!(cache.get("m5.large"), None);
        cache.put("m5.large", 3);
        assert_eq!(cache.get("m5.large"), Some(3));
        cache.invalidate("m5.large");
        assert_eq!(cache.get("m5.large"), None);
    }
}
