// ABOUTME: Single-shot sandbox executor creating, running, and tearing down one sandbox
// ABOUTME: Provision/run/teardown pieces are reused individually by the pool

use crate::engine::{EngineError, SandboxEngine};
use crate::isolation::{IsolationError, IsolationManager, IsolationResources};
use crate::profile::ProfileBuilder;
use crate::types::{AgentState, AgentType, ExecutionResult, TaskDefinition};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

const STOP_TIMEOUT_SECS: u64 = 10;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("isolation error: {0}")]
    Isolation(#[from] IsolationError),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// A created and started sandbox together with its isolation resources.
#[derive(Debug, Clone)]
pub struct ProvisionedSandbox {
    pub instance_id: String,
    pub agent_type: AgentType,
    pub container_id: String,
    pub network_id: String,
    pub volume_id: String,
    pub created_at: DateTime<Utc>,
}

/// Runs one task in one freshly-created sandbox, tearing everything down on
/// every exit path. The pool reuses `provision`, `run_in_sandbox` and
/// `teardown` for its warm instances; `execute_once` is the pool-miss
/// fallback wired end to end.
pub struct SingleShotExecutor {
    engine: Arc<dyn SandboxEngine>,
    isolation: IsolationManager,
    profiles: Arc<ProfileBuilder>,
}

impl SingleShotExecutor {
    pub fn new(engine: Arc<dyn SandboxEngine>, profiles: Arc<ProfileBuilder>) -> Self {
        Self {
            isolation: IsolationManager::new(engine.clone()),
            engine,
            profiles,
        }
    }

    /// Build config, allocate isolation, create and start a sandbox.
    /// Partial work is rolled back before an error is returned.
    pub async fn provision(
        &self,
        agent_type: AgentType,
        instance_id: &str,
    ) -> Result<ProvisionedSandbox> {
        let resources = self.isolation.allocate(instance_id).await?;
        let config = self
            .profiles
            .build_config(agent_type, instance_id)
            .with_isolation(&resources.network_id, &resources.volume_id);

        let container_id = match self.engine.create(&config).await {
            Ok(id) => id,
            Err(e) => {
                self.isolation.release(&resources).await;
                return Err(e.into());
            }
        };

        if let Err(e) = self.engine.start(&container_id).await {
            if let Err(rm) = self.engine.remove(&container_id, true).await {
                warn!(container = %container_id, error = %rm, "failed to remove container after start failure");
            }
            self.isolation.release(&resources).await;
            return Err(e.into());
        }

        debug!(
            instance = instance_id,
            agent_type = %agent_type,
            container = %container_id,
            "provisioned sandbox"
        );

        Ok(ProvisionedSandbox {
            instance_id: instance_id.to_string(),
            agent_type,
            container_id,
            network_id: resources.network_id,
            volume_id: resources.volume_id,
            created_at: Utc::now(),
        })
    }

    /// Run the task's derived command inside an already-running sandbox and
    /// capture output, exit code, duration and a resource usage sample.
    ///
    /// A non-zero task exit yields `success: false`; only spawn and deadline
    /// failures at the engine surface into errors.
    pub async fn run_in_sandbox(
        &self,
        container_id: &str,
        task: &TaskDefinition,
        ceiling: Duration,
    ) -> Result<ExecutionResult> {
        let command = derive_command(task);
        let deadline = exec_deadline(task, ceiling);
        let mut env = HashMap::new();
        env.insert("SWARM_TASK_ID".to_string(), task.id.clone());

        let started = Instant::now();
        let output = self
            .engine
            .exec_into(container_id, &command, Some(env), deadline)
            .await?;
        let duration_ms = started.elapsed().as_millis() as u64;

        // Usage sampling is best-effort; a failed sample never fails the task.
        let resource_usage = match self.engine.stats_snapshot(container_id).await {
            Ok(usage) => Some(usage),
            Err(e) => {
                debug!(container = %container_id, error = %e, "usage snapshot failed");
                None
            }
        };

        let success = output.success();
        let mut metadata = HashMap::new();
        metadata.insert(
            "task_id".to_string(),
            serde_json::Value::String(task.id.clone()),
        );

        Ok(ExecutionResult {
            success,
            output: output.stdout,
            error: if success {
                None
            } else {
                Some(output.stderr.trim().to_string())
            },
            exit_code: output.exit_code,
            duration_ms,
            resource_usage,
            metadata,
        })
    }

    /// Stop and remove a sandbox and release its isolation resources.
    /// Every step is attempted; failures are logged, never propagated.
    pub async fn teardown(&self, sandbox: &ProvisionedSandbox) {
        if let Err(e) = self
            .engine
            .stop(&sandbox.container_id, STOP_TIMEOUT_SECS)
            .await
        {
            warn!(container = %sandbox.container_id, error = %e, "failed to stop sandbox");
        }
        if let Err(e) = self.engine.remove(&sandbox.container_id, true).await {
            warn!(container = %sandbox.container_id, error = %e, "failed to remove sandbox");
        }
        self.isolation
            .release(&IsolationResources {
                network_id: sandbox.network_id.clone(),
                volume_id: sandbox.volume_id.clone(),
            })
            .await;
    }

    /// The full ad hoc path: create one sandbox, run one task, tear down.
    pub async fn execute_once(
        &self,
        task: &TaskDefinition,
        agent: &AgentState,
    ) -> Result<ExecutionResult> {
        let agent_type = AgentType::from_label(&agent.agent_type);
        let instance_id = Uuid::new_v4().to_string();

        info!(
            task = %task.id,
            agent = %agent.id,
            agent_type = %agent_type,
            "executing task in single-shot sandbox"
        );

        let sandbox = self.provision(agent_type, &instance_id).await?;
        let ceiling = self.profiles.max_execution(agent_type);
        let result = self.run_in_sandbox(&sandbox.container_id, task, ceiling).await;
        self.teardown(&sandbox).await;
        result
    }
}

/// Wrap the task payload for the sandbox shell. The scheduler owns the
/// payload; `description` is the documented fallback.
pub fn derive_command(task: &TaskDefinition) -> Vec<String> {
    let payload = task
        .command
        .clone()
        .unwrap_or_else(|| task.description.clone());
    vec!["/bin/sh".to_string(), "-lc".to_string(), payload]
}

/// The tighter of the task's own timeout and the profile ceiling. A zero
/// task timeout means "no preference".
fn exec_deadline(task: &TaskDefinition, ceiling: Duration) -> Duration {
    let requested = Duration::from_secs(task.constraints.timeout_after_secs);
    if requested.is_zero() {
        ceiling
    } else {
        requested.min(ceiling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CommandOutput, Result as EngineResult, SandboxStatus};
    use crate::profile::SandboxConfig;
    use crate::types::{ResourceUsage, TaskConstraints};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedEngine {
        exec_exit_code: i64,
        exec_stderr: String,
        fail_exec: AtomicBool,
        fail_start: AtomicBool,
        removed: Mutex<Vec<String>>,
        released_networks: Mutex<Vec<String>>,
        released_volumes: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SandboxEngine for ScriptedEngine {
        async fn is_available(&self) -> bool {
            true
        }
        async fn create(&self, config: &SandboxConfig) -> EngineResult<String> {
            Ok(format!("ctr-{}", config.name))
        }
        async fn start(&self, _container_id: &str) -> EngineResult<()> {
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(EngineError::Runtime {
                    exit_code: 1,
                    stderr: "cannot start".to_string(),
                });
            }
            Ok(())
        }
        async fn exec_into(
            &self,
            _container_id: &str,
            command: &[String],
            env: Option<HashMap<String, String>>,
            _deadline: Duration,
        ) -> EngineResult<CommandOutput> {
            if self.fail_exec.load(Ordering::SeqCst) {
                return Err(EngineError::Timeout(Duration::from_secs(1)));
            }
            assert_eq!(command[0], "/bin/sh");
            assert!(env.unwrap_or_default().contains_key("SWARM_TASK_ID"));
            Ok(CommandOutput {
                exit_code: self.exec_exit_code,
                stdout: "done".to_string(),
                stderr: self.exec_stderr.clone(),
            })
        }
        async fn stop(&self, _container_id: &str, _timeout_secs: u64) -> EngineResult<()> {
            Ok(())
        }
        async fn remove(&self, container_id: &str, _force: bool) -> EngineResult<()> {
            self.removed.lock().unwrap().push(container_id.to_string());
            Ok(())
        }
        async fn inspect_status(&self, _container_id: &str) -> EngineResult<SandboxStatus> {
            Ok(SandboxStatus::Running)
        }
        async fn stats_snapshot(&self, _container_id: &str) -> EngineResult<ResourceUsage> {
            Ok(ResourceUsage {
                cpu_percent: 1.0,
                memory_mb: 10,
                memory_limit_mb: 512,
            })
        }
        async fn create_network(
            &self,
            name: &str,
            _labels: &[(String, String)],
        ) -> EngineResult<String> {
            Ok(name.to_string())
        }
        async fn remove_network(&self, network_id: &str) -> EngineResult<()> {
            self.released_networks
                .lock()
                .unwrap()
                .push(network_id.to_string());
            Ok(())
        }
        async fn create_volume(
            &self,
            name: &str,
            _labels: &[(String, String)],
        ) -> EngineResult<String> {
            Ok(name.to_string())
        }
        async fn remove_volume(&self, volume_id: &str) -> EngineResult<()> {
            self.released_volumes
                .lock()
                .unwrap()
                .push(volume_id.to_string());
            Ok(())
        }
        async fn list_containers(&self, _label: &str) -> EngineResult<Vec<String>> {
            Ok(vec![])
        }
        async fn list_networks(&self, _label: &str) -> EngineResult<Vec<String>> {
            Ok(vec![])
        }
        async fn list_volumes(&self, _label: &str) -> EngineResult<Vec<String>> {
            Ok(vec![])
        }
    }

    fn task() -> TaskDefinition {
        TaskDefinition {
            id: "t-1".to_string(),
            description: "echo hi".to_string(),
            command: None,
            resource_requirements: Default::default(),
            constraints: Default::default(),
        }
    }

    fn agent() -> AgentState {
        AgentState {
            id: "a-1".to_string(),
            agent_type: "coder".to_string(),
        }
    }

    fn executor(engine: Arc<ScriptedEngine>) -> SingleShotExecutor {
        SingleShotExecutor::new(engine, Arc::new(ProfileBuilder::embedded().unwrap()))
    }

    #[tokio::test]
    async fn test_execute_once_success_and_teardown() {
        let engine = Arc::new(ScriptedEngine::default());
        let result = executor(engine.clone())
            .execute_once(&task(), &agent())
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.output, "done");
        assert!(result.resource_usage.is_some());
        assert_eq!(engine.removed.lock().unwrap().len(), 1);
        assert_eq!(engine.released_networks.lock().unwrap().len(), 1);
        assert_eq!(engine.released_volumes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_task_yields_result_not_error() {
        let engine = Arc::new(ScriptedEngine {
            exec_exit_code: 2,
            exec_stderr: "compile error".to_string(),
            ..Default::default()
        });
        let result = executor(engine)
            .execute_once(&task(), &agent())
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.exit_code, 2);
        assert_eq!(result.error.as_deref(), Some("compile error"));
    }

    #[tokio::test]
    async fn test_teardown_runs_on_exec_failure() {
        let engine = Arc::new(ScriptedEngine::default());
        engine.fail_exec.store(true, Ordering::SeqCst);
        let err = executor(engine.clone())
            .execute_once(&task(), &agent())
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutorError::Engine(EngineError::Timeout(_))));
        // Sandbox and isolation resources were still cleaned up.
        assert_eq!(engine.removed.lock().unwrap().len(), 1);
        assert_eq!(engine.released_networks.lock().unwrap().len(), 1);
        assert_eq!(engine.released_volumes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_start_failure_rolls_back_container_and_isolation() {
        let engine = Arc::new(ScriptedEngine::default());
        engine.fail_start.store(true, Ordering::SeqCst);
        let err = executor(engine.clone())
            .execute_once(&task(), &agent())
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutorError::Engine(EngineError::Runtime { .. })));
        assert_eq!(engine.removed.lock().unwrap().len(), 1);
        assert_eq!(engine.released_networks.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_derive_command_prefers_explicit_payload() {
        let mut t = task();
        assert_eq!(derive_command(&t)[2], "echo hi");
        t.command = Some("cargo test".to_string());
        assert_eq!(derive_command(&t)[2], "cargo test");
    }

    #[test]
    fn test_exec_deadline_clamped_to_ceiling() {
        let mut t = task();
        t.constraints = TaskConstraints {
            timeout_after_secs: 10_000,
            max_retries: 0,
        };
        let ceiling = Duration::from_secs(60);
        assert_eq!(exec_deadline(&t, ceiling), ceiling);

        t.constraints.timeout_after_secs = 5;
        assert_eq!(exec_deadline(&t, ceiling), Duration::from_secs(5));

        t.constraints.timeout_after_secs = 0;
        assert_eq!(exec_deadline(&t, ceiling), ceiling);
    }
}
