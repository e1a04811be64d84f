// ABOUTME: Docker CLI implementation of the sandbox engine trait
// ABOUTME: Spawns one docker process per call with a hard deadline and kill-on-timeout

use super::{CommandOutput, EngineError, Result, SandboxEngine, SandboxStatus};
use crate::profile::SandboxConfig;
use crate::types::ResourceUsage;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

const DEFAULT_OP_DEADLINE: Duration = Duration::from_secs(30);

/// Sandbox runtime gateway over the `docker` command-line control plane.
///
/// Stateless: every operation spawns one external process, waits under a
/// deadline, and translates the outcome. The binary path is injectable so
/// tests can exercise the spawn/timeout path without a daemon.
pub struct DockerCli {
    binary: String,
    op_deadline: Duration,
}

impl DockerCli {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
            op_deadline: DEFAULT_OP_DEADLINE,
        }
    }

    /// Use a different binary and per-operation deadline. Tests use this to
    /// point at plain system binaries.
    pub fn with_binary(binary: impl Into<String>, op_deadline: Duration) -> Self {
        Self {
            binary: binary.into(),
            op_deadline,
        }
    }

    /// Spawn one control-plane command and wait for it under `deadline`.
    /// On overrun the child is force-killed and reaped before the call
    /// returns a timeout error. Exit-code policy is the caller's.
    pub async fn run_raw(&self, args: Vec<String>, deadline: Duration) -> Result<CommandOutput> {
        debug!(binary = %self.binary, ?args, "running engine command");

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Spawn(e.to_string()))?;

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();

        let wait_and_collect = async {
            let stdout_fut = async {
                let mut buf = String::new();
                if let Some(mut pipe) = stdout_pipe {
                    let _ = pipe.read_to_string(&mut buf).await;
                }
                buf
            };
            let stderr_fut = async {
                let mut buf = String::new();
                if let Some(mut pipe) = stderr_pipe {
                    let _ = pipe.read_to_string(&mut buf).await;
                }
                buf
            };
            let (status, stdout, stderr) = tokio::join!(child.wait(), stdout_fut, stderr_fut);
            (status, stdout, stderr)
        };

        match timeout(deadline, wait_and_collect).await {
            Ok((Ok(status), stdout, stderr)) => Ok(CommandOutput {
                exit_code: status.code().map(i64::from).unwrap_or(-1),
                stdout,
                stderr,
            }),
            Ok((Err(e), _, _)) => Err(EngineError::Spawn(e.to_string())),
            Err(_) => {
                if let Err(e) = child.start_kill() {
                    warn!(error = %e, "failed to kill timed-out engine command");
                }
                let _ = child.wait().await;
                Err(EngineError::Timeout(deadline))
            }
        }
    }

    /// Like `run_raw`, but a non-zero exit is a runtime error carrying the
    /// exit code and stderr.
    pub async fn run(&self, args: Vec<String>, deadline: Duration) -> Result<CommandOutput> {
        let output = self.run_raw(args, deadline).await?;
        if !output.success() {
            return Err(EngineError::Runtime {
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Translate a sandbox configuration into `docker create` arguments.
    fn create_args(config: &SandboxConfig) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            config.name.clone(),
            "--memory".to_string(),
            format!("{}m", config.memory_mb),
            "--cpus".to_string(),
            format!("{}", config.cpus),
            "--pids-limit".to_string(),
            config.pids_limit.to_string(),
            "--ulimit".to_string(),
            format!("nofile={}:{}", config.nofile_limit, config.nofile_limit),
            "--user".to_string(),
            config.user.clone(),
            "--workdir".to_string(),
            config.working_dir.clone(),
        ];

        if config.read_only_root {
            args.push("--read-only".to_string());
            // A writable scratch tmpfs so read-only roots stay usable.
            args.push("--tmpfs".to_string());
            args.push("/tmp:rw,size=64m".to_string());
        }
        if config.drop_all_capabilities {
            args.push("--cap-drop".to_string());
            args.push("ALL".to_string());
        }
        if config.no_new_privileges {
            args.push("--security-opt".to_string());
            args.push("no-new-privileges".to_string());
        }
        for flag in &config.security_flags {
            args.push("--security-opt".to_string());
            args.push(flag.clone());
        }
        if let Some(network) = &config.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        for mount in &config.mounts {
            let mode = if mount.read_only { "ro" } else { "rw" };
            args.push("-v".to_string());
            args.push(format!("{}:{}:{}", mount.source, mount.target, mode));
        }
        for (key, value) in &config.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        for (key, value) in &config.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(config.image.clone());
        args.extend(config.keep_alive_command.iter().cloned());
        args
    }

    async fn list_with(&self, base: Vec<String>, label: &str, format: &str) -> Result<Vec<String>> {
        let mut args = base;
        args.push("--filter".to_string());
        args.push(format!("label={}", label));
        args.push("--format".to_string());
        args.push(format.to_string());

        let output = self.run(args, self.op_deadline).await?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

/// One row of `docker stats --no-stream --format '{{json .}}'`.
#[derive(Debug, Deserialize)]
struct RawStats {
    #[serde(rename = "CPUPerc")]
    cpu_perc: String,
    #[serde(rename = "MemUsage")]
    mem_usage: String,
}

fn parse_percent(raw: &str) -> f64 {
    raw.trim().trim_end_matches('%').parse().unwrap_or(0.0)
}

/// Parse an engine-formatted size ("532KiB", "1.2GiB", "7MB") into megabytes.
fn parse_size_mb(raw: &str) -> u64 {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(raw.len());
    let (num, unit) = raw.split_at(split);
    let value: f64 = num.parse().unwrap_or(0.0);
    let mb = match unit.trim() {
        "B" => value / (1024.0 * 1024.0),
        "KiB" | "KB" | "kB" => value / 1024.0,
        "MiB" | "MB" => value,
        "GiB" | "GB" => value * 1024.0,
        "TiB" | "TB" => value * 1024.0 * 1024.0,
        _ => 0.0,
    };
    mb.round() as u64
}

fn parse_stats(stdout: &str) -> Result<ResourceUsage> {
    let line = stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| EngineError::Malformed("empty stats output".to_string()))?;
    let raw: RawStats =
        serde_json::from_str(line).map_err(|e| EngineError::Malformed(e.to_string()))?;

    let mut parts = raw.mem_usage.split('/');
    let used = parts.next().unwrap_or("0B");
    let limit = parts.next().unwrap_or("0B");

    Ok(ResourceUsage {
        cpu_percent: parse_percent(&raw.cpu_perc),
        memory_mb: parse_size_mb(used),
        memory_limit_mb: parse_size_mb(limit),
    })
}

#[async_trait]
impl SandboxEngine for DockerCli {
    async fn is_available(&self) -> bool {
        self.run(vec!["info".to_string()], self.op_deadline)
            .await
            .is_ok()
    }

    async fn create(&self, config: &SandboxConfig) -> Result<String> {
        let output = self.run(Self::create_args(config), self.op_deadline).await?;
        let id = output.stdout.trim().lines().last().unwrap_or("").to_string();
        if id.is_empty() {
            return Err(EngineError::Malformed(
                "create returned no container id".to_string(),
            ));
        }
        Ok(id)
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        self.run(
            vec!["start".to_string(), container_id.to_string()],
            self.op_deadline,
        )
        .await?;
        Ok(())
    }

    async fn exec_into(
        &self,
        container_id: &str,
        command: &[String],
        env: Option<HashMap<String, String>>,
        deadline: Duration,
    ) -> Result<CommandOutput> {
        let mut args = vec!["exec".to_string()];
        if let Some(env) = env {
            for (key, value) in env {
                args.push("-e".to_string());
                args.push(format!("{}={}", key, value));
            }
        }
        args.push(container_id.to_string());
        args.extend(command.iter().cloned());

        // The exit code belongs to the task, so only spawn/timeout failures
        // are engine errors here.
        self.run_raw(args, deadline).await
    }

    async fn stop(&self, container_id: &str, timeout_secs: u64) -> Result<()> {
        let deadline = self.op_deadline + Duration::from_secs(timeout_secs);
        self.run(
            vec![
                "stop".to_string(),
                "-t".to_string(),
                timeout_secs.to_string(),
                container_id.to_string(),
            ],
            deadline,
        )
        .await?;
        Ok(())
    }

    async fn remove(&self, container_id: &str, force: bool) -> Result<()> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(container_id.to_string());
        self.run(args, self.op_deadline).await?;
        Ok(())
    }

    async fn inspect_status(&self, container_id: &str) -> Result<SandboxStatus> {
        let output = self
            .run(
                vec![
                    "inspect".to_string(),
                    "--format".to_string(),
                    "{{.State.Status}}".to_string(),
                    container_id.to_string(),
                ],
                self.op_deadline,
            )
            .await?;
        Ok(SandboxStatus::from_engine(&output.stdout))
    }

    async fn stats_snapshot(&self, container_id: &str) -> Result<ResourceUsage> {
        let output = self
            .run(
                vec![
                    "stats".to_string(),
                    "--no-stream".to_string(),
                    "--format".to_string(),
                    "{{json .}}".to_string(),
                    container_id.to_string(),
                ],
                self.op_deadline,
            )
            .await?;
        parse_stats(&output.stdout)
    }

    async fn create_network(&self, name: &str, labels: &[(String, String)]) -> Result<String> {
        let mut args = vec![
            "network".to_string(),
            "create".to_string(),
            "--driver".to_string(),
            "bridge".to_string(),
            // No external egress from inside the sandbox.
            "--internal".to_string(),
        ];
        for (key, value) in labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(name.to_string());

        self.run(args, self.op_deadline).await?;
        Ok(name.to_string())
    }

    async fn remove_network(&self, network_id: &str) -> Result<()> {
        self.run(
            vec![
                "network".to_string(),
                "rm".to_string(),
                network_id.to_string(),
            ],
            self.op_deadline,
        )
        .await?;
        Ok(())
    }

    async fn create_volume(&self, name: &str, labels: &[(String, String)]) -> Result<String> {
        let mut args = vec!["volume".to_string(), "create".to_string()];
        for (key, value) in labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(name.to_string());

        let output = self.run(args, self.op_deadline).await?;
        let id = output.stdout.trim().to_string();
        Ok(if id.is_empty() { name.to_string() } else { id })
    }

    async fn remove_volume(&self, volume_id: &str) -> Result<()> {
        self.run(
            vec![
                "volume".to_string(),
                "rm".to_string(),
                volume_id.to_string(),
            ],
            self.op_deadline,
        )
        .await?;
        Ok(())
    }

    async fn list_containers(&self, label: &str) -> Result<Vec<String>> {
        self.list_with(
            vec!["ps".to_string(), "-a".to_string()],
            label,
            "{{.ID}}",
        )
        .await
    }

    async fn list_networks(&self, label: &str) -> Result<Vec<String>> {
        self.list_with(
            vec!["network".to_string(), "ls".to_string()],
            label,
            "{{.Name}}",
        )
        .await
    }

    async fn list_volumes(&self, label: &str) -> Result<Vec<String>> {
        self.list_with(
            vec!["volume".to_string(), "ls".to_string()],
            label,
            "{{.Name}}",
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ProfileBuilder;
    use crate::types::AgentType;

    fn sample_config() -> SandboxConfig {
        ProfileBuilder::embedded()
            .unwrap()
            .build_config(AgentType::Coder, "abc123")
            .with_isolation("sbx-net-abc123", "sbx-vol-abc123")
    }

    #[test]
    fn test_create_args_carry_hardening_flags() {
        let args = DockerCli::create_args(&sample_config());
        let joined = args.join(" ");
        assert!(joined.contains("--read-only"));
        assert!(joined.contains("--cap-drop ALL"));
        assert!(joined.contains("--security-opt no-new-privileges"));
        assert!(joined.contains("--pids-limit"));
        assert!(joined.contains("--network sbx-net-abc123"));
        assert!(joined.contains("sbx-vol-abc123:/workspace:rw"));
        // Keep-alive command comes last, after the image.
        assert_eq!(args.last().map(String::as_str), Some("infinity"));
    }

    #[test]
    fn test_create_args_resource_ceilings() {
        let config = sample_config();
        let args = DockerCli::create_args(&config);
        let joined = args.join(" ");
        assert!(joined.contains(&format!("--memory {}m", config.memory_mb)));
        assert!(joined.contains(&format!("--cpus {}", config.cpus)));
    }

    #[test]
    fn test_parse_size_mb() {
        assert_eq!(parse_size_mb("532KiB"), 1);
        assert_eq!(parse_size_mb("7.5MiB"), 8);
        assert_eq!(parse_size_mb("2GiB"), 2048);
        assert_eq!(parse_size_mb("0B"), 0);
        assert_eq!(parse_size_mb("garbage"), 0);
    }

    #[test]
    fn test_parse_stats_line() {
        let line = r#"{"CPUPerc":"12.34%","MemUsage":"512MiB / 2GiB"}"#;
        let usage = parse_stats(line).unwrap();
        assert!((usage.cpu_percent - 12.34).abs() < f64::EPSILON);
        assert_eq!(usage.memory_mb, 512);
        assert_eq!(usage.memory_limit_mb, 2048);
    }

    #[test]
    fn test_parse_stats_rejects_empty() {
        assert!(matches!(
            parse_stats("\n"),
            Err(EngineError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_run_surfaces_exit_code_and_stderr() {
        let cli = DockerCli::with_binary("/bin/sh", Duration::from_secs(5));
        let err = cli
            .run(
                vec![
                    "-c".to_string(),
                    "echo boom >&2; exit 3".to_string(),
                ],
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        match err {
            EngineError::Runtime { exit_code, stderr } => {
                assert_eq!(exit_code, 3);
                assert!(stderr.contains("boom"));
            }
            other => panic!("expected runtime error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_raw_keeps_nonzero_exit() {
        let cli = DockerCli::with_binary("/bin/sh", Duration::from_secs(5));
        let output = cli
            .run_raw(
                vec!["-c".to_string(), "exit 7".to_string()],
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(output.exit_code, 7);
    }
}
