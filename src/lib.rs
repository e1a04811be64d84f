// ABOUTME: Pooled OS-sandbox task execution for software agent swarms
// ABOUTME: Exposes the warm pool, single-shot executor, and docker CLI gateway

pub mod engine;
pub mod executor;
pub mod isolation;
pub mod metrics;
pub mod pool;
pub mod profile;
pub mod types;

pub use engine::{DockerCli, EngineError, SandboxEngine, SandboxStatus};
pub use executor::{ExecutorError, ProvisionedSandbox, SingleShotExecutor};
pub use isolation::{IsolationError, IsolationManager, IsolationResources};
pub use metrics::{MetricsRecorder, PoolMetricsSnapshot};
pub use pool::{PoolConfig, PoolError, ReclaimReport, SandboxPool};
pub use profile::{ProfileBuilder, ProfileError, SandboxConfig};
pub use types::{
    AgentState, AgentType, ExecutionResult, ResourceUsage, SandboxInstance, TaskDefinition,
};
