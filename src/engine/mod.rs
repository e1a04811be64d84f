// ABOUTME: Engine trait and error types for the sandbox runtime control plane
// ABOUTME: Defines the abstract surface for container lifecycle and exec calls

use crate::profile::SandboxConfig;
use crate::types::ResourceUsage;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

pub mod docker;

pub use docker::DockerCli;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine command exited with code {exit_code}: {stderr}")]
    Runtime { exit_code: i64, stderr: String },

    #[error("engine command timed out after {0:?} and was killed")]
    Timeout(Duration),

    #[error("failed to spawn engine command: {0}")]
    Spawn(String),

    #[error("engine not available: {0}")]
    NotAvailable(String),

    #[error("unexpected engine output: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Captured output of one control-plane command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Engine-reported lifecycle state of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxStatus {
    Created,
    Running,
    Paused,
    Exited,
    Dead,
    Unknown(String),
}

impl SandboxStatus {
    pub fn from_engine(state: &str) -> Self {
        match state.trim().to_lowercase().as_str() {
            "created" => SandboxStatus::Created,
            "running" | "restarting" => SandboxStatus::Running,
            "paused" => SandboxStatus::Paused,
            "exited" | "removing" => SandboxStatus::Exited,
            "dead" => SandboxStatus::Dead,
            other => SandboxStatus::Unknown(other.to_string()),
        }
    }
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxStatus::Created => f.write_str("created"),
            SandboxStatus::Running => f.write_str("running"),
            SandboxStatus::Paused => f.write_str("paused"),
            SandboxStatus::Exited => f.write_str("exited"),
            SandboxStatus::Dead => f.write_str("dead"),
            SandboxStatus::Unknown(state) => f.write_str(state),
        }
    }
}

/// Abstract surface over the sandbox engine's command-line control plane.
///
/// Every call maps to one external process with a hard deadline; no state is
/// shared between calls. Implementations translate non-zero exits and
/// deadline overruns into typed errors, leaving retry policy to the caller.
#[async_trait]
pub trait SandboxEngine: Send + Sync {
    /// Whether the engine daemon is reachable at all.
    async fn is_available(&self) -> bool;

    /// Create a container from the given configuration; returns the engine
    /// container id.
    async fn create(&self, config: &SandboxConfig) -> Result<String>;

    async fn start(&self, container_id: &str) -> Result<()>;

    /// Run a command inside a running container. The returned exit code is
    /// the command's own; a non-zero task exit is not an engine error.
    async fn exec_into(
        &self,
        container_id: &str,
        command: &[String],
        env: Option<HashMap<String, String>>,
        deadline: Duration,
    ) -> Result<CommandOutput>;

    async fn stop(&self, container_id: &str, timeout_secs: u64) -> Result<()>;

    async fn remove(&self, container_id: &str, force: bool) -> Result<()>;

    async fn inspect_status(&self, container_id: &str) -> Result<SandboxStatus>;

    /// One-shot resource usage sample for a running container.
    async fn stats_snapshot(&self, container_id: &str) -> Result<ResourceUsage>;

    /// Create an isolated network; returns its id or name.
    async fn create_network(&self, name: &str, labels: &[(String, String)]) -> Result<String>;

    async fn remove_network(&self, network_id: &str) -> Result<()>;

    /// Create a named volume; returns its id or name.
    async fn create_volume(&self, name: &str, labels: &[(String, String)]) -> Result<String>;

    async fn remove_volume(&self, volume_id: &str) -> Result<()>;

    /// List engine-side containers carrying the given label, running or not.
    async fn list_containers(&self, label: &str) -> Result<Vec<String>>;

    /// List engine-side networks carrying the given label.
    async fn list_networks(&self, label: &str) -> Result<Vec<String>>;

    /// List engine-side volumes carrying the given label.
    async fn list_volumes(&self, label: &str) -> Result<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(SandboxStatus::from_engine("running"), SandboxStatus::Running);
        assert_eq!(SandboxStatus::from_engine("Exited"), SandboxStatus::Exited);
        assert_eq!(
            SandboxStatus::from_engine("restarting"),
            SandboxStatus::Running
        );
        assert_eq!(
            SandboxStatus::from_engine("weird"),
            SandboxStatus::Unknown("weird".to_string())
        );
    }

    #[test]
    fn test_command_output_success() {
        let ok = CommandOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert!(ok.success());

        let failed = CommandOutput {
            exit_code: 125,
            stdout: String::new(),
            stderr: "no such container".to_string(),
        };
        assert!(!failed.success());
    }
}
