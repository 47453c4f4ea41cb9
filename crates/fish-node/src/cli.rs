//! CLI surface: `spec.md` §6's flag set, layered on top of
//! [`crate::config::NodeConfig`] (file < env < CLI, per that module's
//! own doc comment). Grounded on `convex_server`'s ad hoc `main.rs`
//! argument handling, upgraded to `clap::Parser` per `SPEC_FULL.md`
//! §2's ambient-stack decision to use the same derive-based CLI crate
//! the rest of the example pack reaches for.

use std::path::PathBuf;

use clap::Parser;

use crate::config::NodeConfig;

/// Aquarium Fish node: distributed resource manager peer.
#[derive(Debug, Parser)]
#[command(name = "fish-node", version, about)]
pub struct NodeArgs {
    /// Path to a TOML configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// This node's API listen address.
    #[arg(short = 'a', long = "api")]
    pub api_address: Option<String>,

    /// This node's unique name.
    #[arg(short = 'n', long = "node")]
    pub node_name: Option<String>,

    /// Data root directory.
    #[arg(short = 'D', long = "dir")]
    pub directory: Option<PathBuf>,

    /// Seed peer address(es) to join on start; may be repeated.
    #[arg(short = 'j', long = "join")]
    pub join: Vec<String>,

    /// CPU core limit hint, triggers stricter accounting on breach.
    #[arg(long = "cpu")]
    pub cpu_limit: Option<u16>,

    /// Memory target (human size, e.g. "2Gi").
    #[arg(long = "mem")]
    pub mem_target: Option<String>,

    /// Stop accepting new Applications; existing ones still drain.
    #[arg(long = "maintenance")]
    pub maintenance: bool,

    /// Log verbosity: one of error, warn, info, debug, trace.
    #[arg(short = 'v', long = "verbosity", default_value = "info")]
    pub verbosity: String,

    /// Prefix log lines with a timestamp.
    #[arg(long = "timestamp")]
    pub timestamp: bool,
}

impl NodeArgs {
    /// Apply explicit flags onto `config`, the last and highest-priority
    /// layer (`SPEC_FULL.md` §7: file < env < CLI).
    pub fn apply_to(&self, config: &mut NodeConfig) {
        if let Some(v) = &self.api_address {
            config.api_address = v.clone();
        }
        if let Some(v) = &self.node_name {
            config.node_name = v.clone();
        }
        if let Some(v) = &self.directory {
            config.directory = v.clone();
        }
        if !self.join.is_empty() {
            config.cluster_join = self.join.clone();
        }
        if let Some(v) = self.cpu_limit {
            config.cpu_limit = Some(v);
        }
        if let Some(v) = &self.mem_target {
            config.mem_target = Some(v.clone());
        }
        if self.maintenance {
            config.maintenance = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_to_only_overrides_present_flags() {
        let mut config = NodeConfig::default();
        config.node_name = "from-file".into();
        let args = NodeArgs::parse_from(["fish-node", "-a", "0.0.0.0:9000"]);
        args.apply_to(&mut config);
        assert_eq!(config.api_address, "0.0.0.0:9000");
        assert_eq!(config.node_name, "from-file");
    }

    #[test]
    fn apply_to_overrides_node_name_when_given() {
        let mut config = NodeConfig::default();
        let args = NodeArgs::parse_from(["fish-node", "-n", "node-b"]);
        args.apply_to(&mut config);
        assert_eq!(config.node_name, "node-b");
    }
}
