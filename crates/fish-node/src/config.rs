//! Node configuration: file + environment + CLI layering, per
//! `SPEC_FULL.md` §7. Grounded directly on
//! `convex_server::config::ServerConfig` (`from_file`, `from_env`,
//! `apply_env_overrides`, `env_var_names`), generalized from a single
//! HTTP server's settings to this node's full external surface
//! (spec.md §6).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{NodeError, NodeResult};

/// One driver's configuration entry: a name used as its factory-registry
/// key, plus opaque JSON handed to `Driver::prepare` (spec.md §6, §9
/// "factory registry maps driver-name to constructor at init").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    pub name: String,
    #[serde(default)]
    pub cfg: serde_json::Value,
}

/// Full node configuration, loaded from a TOML file then overridden by
/// environment variables then by explicit CLI flags (file < env < CLI).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_name")]
    pub node_name: String,
    #[serde(default = "default_node_address")]
    pub node_address: String,
    #[serde(default = "default_node_location")]
    pub node_location: String,
    #[serde(default = "default_directory")]
    pub directory: PathBuf,

    #[serde(default = "default_api_address")]
    pub api_address: String,
    pub proxy_socks_address: Option<String>,
    pub proxy_ssh_address: Option<String>,

    #[serde(default)]
    pub cluster_join: Vec<String>,
    #[serde(default)]
    pub cluster_auto: bool,

    /// Paths resolved against `directory` if relative. TLS/mTLS
    /// bootstrap itself is an external collaborator (spec.md §1
    /// Non-goals); these fields are carried structurally so a future
    /// TLS acceptor has somewhere to read from, per the TODO in
    /// `fish_cluster::server`.
    pub tls_ca_crt: Option<PathBuf>,
    pub tls_crt: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub node_ssh_key: Option<PathBuf>,

    pub cpu_limit: Option<u16>,
    /// Human-readable size (e.g. `"2Gi"`), matched against the
    /// process's own memory use to trigger stricter GC/limits on
    /// breach. Parsing/enforcement is left to a later memory-watchdog
    /// task; unset means no target.
    pub mem_target: Option<String>,

    #[serde(default)]
    pub maintenance: bool,

    #[serde(default)]
    pub drivers: Vec<DriverConfig>,
}

fn default_node_name() -> String {
    "fish-node".to_string()
}

fn default_node_address() -> String {
    "0.0.0.0:8001".to_string()
}

fn default_node_location() -> String {
    "local".to_string()
}

fn default_directory() -> PathBuf {
    PathBuf::from("./data")
}

fn default_api_address() -> String {
    "0.0.0.0:8000".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            node_address: default_node_address(),
            node_location: default_node_location(),
            directory: default_directory(),
            api_address: default_api_address(),
            proxy_socks_address: None,
            proxy_ssh_address: None,
            cluster_join: Vec::new(),
            cluster_auto: false,
            tls_ca_crt: None,
            tls_crt: None,
            tls_key: None,
            node_ssh_key: None,
            cpu_limit: None,
            mem_target: None,
            maintenance: false,
            drivers: Vec::new(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a TOML file, then apply environment
    /// overrides.
    pub fn from_file(path: &str) -> NodeResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Self =
            toml::from_str(&content).map_err(|e| NodeError::Configuration(e.to_string()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults with environment variable overrides, used when no
    /// config file is given.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply `FISH_*` environment variable overrides. Environment
    /// variables take precedence over file-based configuration, but
    /// are themselves overridden by explicit CLI flags
    /// ([`crate::cli::NodeArgs::apply_to`]).
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("FISH_NODE_NAME") {
            self.node_name = v;
        }
        if let Ok(v) = std::env::var("FISH_NODE_ADDRESS") {
            self.node_address = v;
        }
        if let Ok(v) = std::env::var("FISH_NODE_LOCATION") {
            self.node_location = v;
        }
        if let Ok(v) = std::env::var("FISH_DIRECTORY") {
            self.directory = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("FISH_API_ADDRESS") {
            self.api_address = v;
        }
        if let Ok(v) = std::env::var("FISH_CLUSTER_JOIN") {
            self.cluster_join = v.split(',').map(str::to_string).filter(|s| !s.is_empty()).collect();
        }
        if let Ok(v) = std::env::var("FISH_CLUSTER_AUTO") {
            self.cluster_auto = v.to_lowercase() == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("FISH_CPU_LIMIT") {
            if let Ok(p) = v.parse::<u16>() {
                self.cpu_limit = Some(p);
            }
        }
        if let Ok(v) = std::env::var("FISH_MEM_TARGET") {
            self.mem_target = Some(v);
        }
        if let Ok(v) = std::env::var("FISH_MAINTENANCE") {
            self.maintenance = v.to_lowercase() == "true" || v == "1";
        }
    }

    /// All configured environment variable names, for `--help` output
    /// and documentation.
    pub fn env_var_names() -> &'static [&'static str] {
        &[
            "FISH_NODE_NAME",
            "FISH_NODE_ADDRESS",
            "FISH_NODE_LOCATION",
            "FISH_DIRECTORY",
            "FISH_API_ADDRESS",
            "FISH_CLUSTER_JOIN",
            "FISH_CLUSTER_AUTO",
            "FISH_CPU_LIMIT",
            "FISH_MEM_TARGET",
            "FISH_MAINTENANCE",
        ]
    }

    /// This node's own data directory, `<directory>/<node_name>/`
    /// (`SPEC_FULL.md` §7).
    pub fn node_directory(&self) -> PathBuf {
        self.directory.join(&self.node_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_TEST_MUTEX: Mutex<()> = Mutex::new(());

    fn with_env_vars<F: FnOnce() -> T, T>(vars: &[(&str, &str)], f: F) -> T {
        let _guard = ENV_TEST_MUTEX.lock().unwrap();
        for name in NodeConfig::env_var_names() {
            std::env::remove_var(name);
        }
        for (k, v) in vars {
            std::env::set_var(k, v);
        }
        let result = f();
        for (k, _) in vars {
            std::env::remove_var(k);
        }
        result
    }

    #[test]
    fn default_config_has_sane_values() {
        let config = NodeConfig::default();
        assert_eq!(config.node_name, "fish-node");
        assert!(!config.maintenance);
        assert!(config.cluster_join.is_empty());
    }

    #[test]
    fn node_directory_nests_under_name() {
        let mut config = NodeConfig::default();
        config.directory = PathBuf::from("/var/fish");
        config.node_name = "node-a".into();
        assert_eq!(config.node_directory(), PathBuf::from("/var/fish/node-a"));
    }

    #[test]
    fn env_override_cluster_join_splits_on_comma() {
        with_env_vars(&[("FISH_CLUSTER_JOIN", "a:1,b:2")], || {
            let config = NodeConfig::from_env();
            assert_eq!(config.cluster_join, vec!["a:1".to_string(), "b:2".to_string()]);
        });
    }

    #[test]
    fn env_override_maintenance_accepts_truthy_values() {
        with_env_vars(&[("FISH_MAINTENANCE", "1")], || {
            assert!(NodeConfig::from_env().maintenance);
        });
    }

    #[test]
    fn env_var_names_matches_handled_variables() {
        assert_eq!(NodeConfig::env_var_names().len(), 10);
    }
}
