// ABOUTME: Security profile builder mapping agent types to sandbox configurations
// ABOUTME: Merges a static per-type policy table over hardened global defaults

use crate::types::AgentType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Label marking every engine-side object this crate owns. Used for orphan
/// reclamation.
pub const LABEL_MANAGED: &str = "swarm.sandbox.managed";
/// Label carrying the owning instance id on containers, networks and volumes.
pub const LABEL_OWNER: &str = "swarm.sandbox.owner";
/// Label carrying the agent type on containers.
pub const LABEL_AGENT_TYPE: &str = "swarm.sandbox.agent-type";

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("failed to parse profile table: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, ProfileError>;

/// One bind or volume mount inside a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountSpec {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Concrete sandbox configuration. Derived once per instance at creation
/// time and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub name: String,
    pub image: String,
    pub memory_mb: u64,
    pub cpus: f64,
    pub pids_limit: u32,
    pub nofile_limit: u32,
    pub read_only_root: bool,
    pub drop_all_capabilities: bool,
    pub no_new_privileges: bool,
    pub user: String,
    pub working_dir: String,
    pub env: HashMap<String, String>,
    pub mounts: Vec<MountSpec>,
    pub security_flags: Vec<String>,
    pub labels: HashMap<String, String>,
    /// Isolated network attached at creation; set by the executor.
    pub network: Option<String>,
    /// Command keeping a warm container alive between checkouts.
    pub keep_alive_command: Vec<String>,
    /// Ceiling any single exec deadline is clamped to.
    pub max_execution_secs: u64,
}

impl SandboxConfig {
    /// Attach the instance's isolation resources: the network it joins and
    /// the volume mounted as its writable workspace.
    pub fn with_isolation(mut self, network_id: &str, volume_id: &str) -> Self {
        self.network = Some(network_id.to_string());
        self.mounts.push(MountSpec {
            source: volume_id.to_string(),
            target: self.working_dir.clone(),
            read_only: false,
        });
        self
    }
}

/// Fully-specified baseline policy applied to every agent type.
#[derive(Debug, Clone, Deserialize)]
struct BasePolicy {
    image: String,
    memory_mb: u64,
    cpus: f64,
    pids_limit: u32,
    nofile_limit: u32,
    max_execution_secs: u64,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    mounts: Vec<MountSpec>,
    #[serde(default)]
    security_flags: Vec<String>,
}

/// Per-type overrides layered on top of the baseline. Scalar fields replace
/// the default; env, mounts and security flags are additive.
#[derive(Debug, Clone, Default, Deserialize)]
struct TypePolicy {
    image: Option<String>,
    memory_mb: Option<u64>,
    cpus: Option<f64>,
    pids_limit: Option<u32>,
    max_execution_secs: Option<u64>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    mounts: Vec<MountSpec>,
    #[serde(default)]
    security_flags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ProfileTable {
    #[allow(dead_code)]
    version: String,
    defaults: BasePolicy,
    #[serde(default)]
    profiles: HashMap<String, TypePolicy>,
}

/// Builds immutable sandbox configurations from the static policy table.
///
/// The table is read once at startup; unknown agent types get the global
/// defaults only, so `build_config` cannot fail.
#[derive(Debug, Clone)]
pub struct ProfileBuilder {
    defaults: BasePolicy,
    profiles: HashMap<String, TypePolicy>,
}

impl ProfileBuilder {
    /// Load the policy table embedded at build time.
    pub fn embedded() -> Result<Self> {
        Self::from_json(include_str!("../config/profiles.json"))
    }

    /// Load a policy table from a JSON document.
    pub fn from_json(raw: &str) -> Result<Self> {
        let table: ProfileTable =
            serde_json::from_str(raw).map_err(|e| ProfileError::Parse(e.to_string()))?;
        Ok(Self {
            defaults: table.defaults,
            profiles: table.profiles,
        })
    }

    /// Derive the concrete configuration for one sandbox instance.
    pub fn build_config(&self, agent_type: AgentType, instance_id: &str) -> SandboxConfig {
        let overrides = self
            .profiles
            .get(agent_type.as_str())
            .cloned()
            .unwrap_or_default();

        let mut env = self.defaults.env.clone();
        env.extend(overrides.env);

        let mut mounts = self.defaults.mounts.clone();
        mounts.extend(overrides.mounts);

        let mut security_flags = self.defaults.security_flags.clone();
        security_flags.extend(overrides.security_flags);

        let mut labels = HashMap::new();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_OWNER.to_string(), instance_id.to_string());
        labels.insert(LABEL_AGENT_TYPE.to_string(), agent_type.to_string());

        SandboxConfig {
            name: format!("sbx-{}-{}", agent_type, instance_id),
            image: overrides.image.unwrap_or_else(|| self.defaults.image.clone()),
            memory_mb: overrides.memory_mb.unwrap_or(self.defaults.memory_mb),
            cpus: overrides.cpus.unwrap_or(self.defaults.cpus),
            pids_limit: overrides.pids_limit.unwrap_or(self.defaults.pids_limit),
            nofile_limit: self.defaults.nofile_limit,
            read_only_root: true,
            drop_all_capabilities: true,
            no_new_privileges: true,
            user: "1000:1000".to_string(),
            working_dir: "/workspace".to_string(),
            env,
            mounts,
            security_flags,
            labels,
            network: None,
            keep_alive_command: vec!["sleep".to_string(), "infinity".to_string()],
            max_execution_secs: overrides
                .max_execution_secs
                .unwrap_or(self.defaults.max_execution_secs),
        }
    }

    /// Exec deadline ceiling for the given agent type.
    pub fn max_execution(&self, agent_type: AgentType) -> Duration {
        let secs = self
            .profiles
            .get(agent_type.as_str())
            .and_then(|p| p.max_execution_secs)
            .unwrap_or(self.defaults.max_execution_secs);
        Duration::from_secs(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_table_loads() {
        let builder = ProfileBuilder::embedded().unwrap();
        let config = builder.build_config(AgentType::Coder, "i-1");
        assert!(config.memory_mb > 0);
        assert!(config.cpus > 0.0);
    }

    #[test]
    fn test_hardening_defaults_always_applied() {
        let builder = ProfileBuilder::embedded().unwrap();
        for ty in AgentType::ALL {
            let config = builder.build_config(ty, "i-2");
            assert!(config.read_only_root);
            assert!(config.drop_all_capabilities);
            assert!(config.no_new_privileges);
            assert_ne!(config.user, "root");
            assert_ne!(config.user, "0:0");
            assert!(config.pids_limit > 0);
        }
    }

    #[test]
    fn test_generic_type_uses_defaults_only() {
        let builder = ProfileBuilder::embedded().unwrap();
        let generic = builder.build_config(AgentType::Generic, "i-3");
        let coder = builder.build_config(AgentType::Coder, "i-3");
        // Coder carries a larger ceiling than the baseline in the shipped table.
        assert!(coder.memory_mb >= generic.memory_mb);
    }

    #[test]
    fn test_type_overrides_replace_scalars_and_extend_env() {
        let raw = r#"{
            "version": "1",
            "defaults": {
                "image": "base:1", "memory_mb": 256, "cpus": 0.5,
                "pids_limit": 64, "nofile_limit": 512, "max_execution_secs": 60,
                "env": {"SHARED": "yes"}
            },
            "profiles": {
                "coder": {"memory_mb": 2048, "env": {"ROLE": "coder"}}
            }
        }"#;
        let builder = ProfileBuilder::from_json(raw).unwrap();
        let config = builder.build_config(AgentType::Coder, "i-4");
        assert_eq!(config.memory_mb, 2048);
        assert_eq!(config.cpus, 0.5);
        assert_eq!(config.env.get("SHARED").map(String::as_str), Some("yes"));
        assert_eq!(config.env.get("ROLE").map(String::as_str), Some("coder"));
    }

    #[test]
    fn test_with_isolation_attaches_network_and_workspace() {
        let builder = ProfileBuilder::embedded().unwrap();
        let config = builder
            .build_config(AgentType::Tester, "i-5")
            .with_isolation("net-1", "vol-1");
        assert_eq!(config.network.as_deref(), Some("net-1"));
        let workspace = config
            .mounts
            .iter()
            .find(|m| m.source == "vol-1")
            .expect("workspace mount present");
        assert_eq!(workspace.target, config.working_dir);
        assert!(!workspace.read_only);
    }

    #[test]
    fn test_labels_identify_owner() {
        let builder = ProfileBuilder::embedded().unwrap();
        let config = builder.build_config(AgentType::Planner, "i-6");
        assert_eq!(config.labels.get(LABEL_MANAGED).map(String::as_str), Some("true"));
        assert_eq!(config.labels.get(LABEL_OWNER).map(String::as_str), Some("i-6"));
    }
}
