// ABOUTME: Core type definitions for pooled sandbox execution
// ABOUTME: Defines agent/task records, sandbox instances, and execution results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Agent classification driving resource and security profile selection.
///
/// `Generic` is the explicit fallback bucket: agent records carrying a type
/// label we do not recognize are pooled and profiled with global defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Coder,
    Tester,
    Reviewer,
    Researcher,
    Planner,
    Generic,
}

impl AgentType {
    pub const ALL: [AgentType; 6] = [
        AgentType::Coder,
        AgentType::Tester,
        AgentType::Reviewer,
        AgentType::Researcher,
        AgentType::Planner,
        AgentType::Generic,
    ];

    /// Resolve an external type label. Unknown labels map to `Generic`
    /// rather than failing.
    pub fn from_label(label: &str) -> Self {
        match label.to_lowercase().as_str() {
            "coder" => AgentType::Coder,
            "tester" => AgentType::Tester,
            "reviewer" => AgentType::Reviewer,
            "researcher" => AgentType::Researcher,
            "planner" => AgentType::Planner,
            _ => AgentType::Generic,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Coder => "coder",
            AgentType::Tester => "tester",
            AgentType::Reviewer => "reviewer",
            AgentType::Researcher => "researcher",
            AgentType::Planner => "planner",
            AgentType::Generic => "generic",
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource requirements declared by a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub memory_mb: u64,
    pub max_duration_secs: u64,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            max_duration_secs: 300,
        }
    }
}

/// Execution constraints declared by a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConstraints {
    pub timeout_after_secs: u64,
    pub max_retries: u32,
}

impl Default for TaskConstraints {
    fn default() -> Self {
        Self {
            timeout_after_secs: 300,
            max_retries: 0,
        }
    }
}

/// Task record submitted by the swarm scheduler. Owned upstream; only the
/// fields below are read here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: String,
    pub description: String,
    /// Shell payload to run inside the sandbox. Falls back to `description`
    /// when absent; the scheduler owns what goes in it.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub resource_requirements: ResourceRequirements,
    #[serde(default)]
    pub constraints: TaskConstraints,
}

/// Agent record submitted alongside a task. Owned upstream; only id and
/// type are read here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub id: String,
    #[serde(rename = "type")]
    pub agent_type: String,
}

/// One pooled sandbox, exclusively owned by the pool for its lifetime.
///
/// `in_use` is the sole exclusivity guarantee: it is flipped atomically with
/// checkout under the per-type lock. `execution_count` only increases and is
/// reset only by instance replacement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxInstance {
    pub instance_id: String,
    pub agent_type: AgentType,
    /// Engine-side handle for the running container.
    pub container_id: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub execution_count: u64,
    pub healthy: bool,
    pub in_use: bool,
    /// Set when a refresh was requested while the instance was busy; the
    /// replacement is retried at checkin and by the health loop.
    pub refresh_pending: bool,
    pub network_id: String,
    pub volume_id: String,
}

/// Point-in-time resource consumption of one sandbox.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_mb: u64,
    pub memory_limit_mb: u64,
}

/// Outcome of one task execution. `success: false` means the task ran and
/// failed; infrastructure failures surface as errors instead, and callers
/// must distinguish the two.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub exit_code: i64,
    pub duration_ms: u64,
    pub resource_usage: Option<ResourceUsage>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_type_label_roundtrip() {
        for ty in AgentType::ALL {
            assert_eq!(AgentType::from_label(ty.as_str()), ty);
        }
    }

    #[test]
    fn test_unknown_label_falls_back_to_generic() {
        assert_eq!(AgentType::from_label("archaeologist"), AgentType::Generic);
        assert_eq!(AgentType::from_label(""), AgentType::Generic);
    }

    #[test]
    fn test_label_resolution_is_case_insensitive() {
        assert_eq!(AgentType::from_label("Coder"), AgentType::Coder);
        assert_eq!(AgentType::from_label("TESTER"), AgentType::Tester);
    }

    #[test]
    fn test_task_definition_deserializes_with_defaults() {
        let task: TaskDefinition =
            serde_json::from_str(r#"{"id": "t-1", "description": "echo hi"}"#).unwrap();
        assert_eq!(task.constraints.timeout_after_secs, 300);
        assert!(task.command.is_none());
    }
}
