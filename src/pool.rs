// ABOUTME: Warm sandbox pool with per-type checkout/checkin and background upkeep
// ABOUTME: Runs health and cleanup loops, miss-driven auto-scaling, and graceful shutdown

use crate::engine::{EngineError, SandboxEngine, SandboxStatus};
use crate::executor::{ExecutorError, ProvisionedSandbox, SingleShotExecutor};
use crate::isolation::IsolationError;
use crate::metrics::{MetricsRecorder, PoolMetricsSnapshot};
use crate::profile::{ProfileBuilder, LABEL_MANAGED};
use crate::types::{AgentState, AgentType, ExecutionResult, SandboxInstance, TaskDefinition};
use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("isolation error: {0}")]
    Isolation(#[from] IsolationError),

    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("instance {instance_id} is unhealthy")]
    UnhealthyInstance { instance_id: String },

    #[error("no {agent_type} instance with id {instance_id}")]
    InstanceNotFound {
        agent_type: AgentType,
        instance_id: String,
    },
}

pub type Result<T> = std::result::Result<T, PoolError>;

/// Pool sizing and upkeep knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Instances created per agent type at startup.
    pub warm_per_type: HashMap<AgentType, usize>,
    /// Auto-scaling floor per type.
    pub min_size: usize,
    /// Auto-scaling ceiling per type. On-demand creation may exceed this
    /// transiently; auto-scaling never grows past it.
    pub max_size: usize,
    /// Instances older than this are evicted once idle.
    pub max_age: Duration,
    /// Idle instances unused for this long are evicted.
    pub idle_timeout: Duration,
    pub health_interval: Duration,
    /// Utilization above this grows the type pool by one.
    pub scale_up_threshold: f64,
    /// Utilization below this shrinks the type pool by one.
    pub scale_down_threshold: f64,
    /// Delay between a pool miss and the scaling evaluation it triggers.
    pub scale_cooldown: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let mut warm_per_type = HashMap::new();
        warm_per_type.insert(AgentType::Coder, 2);
        warm_per_type.insert(AgentType::Tester, 2);
        warm_per_type.insert(AgentType::Reviewer, 1);
        warm_per_type.insert(AgentType::Researcher, 1);
        warm_per_type.insert(AgentType::Planner, 1);

        Self {
            warm_per_type,
            min_size: 1,
            max_size: 10,
            max_age: Duration::from_secs(3600),
            idle_timeout: Duration::from_secs(600),
            health_interval: Duration::from_secs(30),
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            scale_cooldown: Duration::from_secs(60),
        }
    }
}

/// Engine-side objects found (and optionally removed) by orphan reclamation.
#[derive(Debug, Default, Clone)]
pub struct ReclaimReport {
    pub containers: Vec<String>,
    pub networks: Vec<String>,
    pub volumes: Vec<String>,
    pub dry_run: bool,
}

impl ReclaimReport {
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty() && self.networks.is_empty() && self.volumes.is_empty()
    }
}

/// Warm instances of a single agent type. Each type has its own lock so
/// checkout traffic for one type never serializes the others.
struct TypePool {
    slots: RwLock<Vec<SandboxInstance>>,
    scale_eval_pending: AtomicBool,
}

impl TypePool {
    fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            scale_eval_pending: AtomicBool::new(false),
        }
    }
}

struct PoolInner {
    engine: Arc<dyn SandboxEngine>,
    executor: SingleShotExecutor,
    profiles: Arc<ProfileBuilder>,
    config: PoolConfig,
    pools: HashMap<AgentType, TypePool>,
    metrics: MetricsRecorder,
    running: AtomicBool,
}

/// Pool of pre-warmed sandboxes keyed by agent type.
///
/// `execute_task` is the hot path: checkout a warm instance (or create one
/// on miss), run the task, check the instance back in. Background loops keep
/// the pool healthy and right-sized; `shutdown` tears everything down.
#[derive(Clone)]
pub struct SandboxPool {
    inner: Arc<PoolInner>,
}

impl SandboxPool {
    pub fn new(
        engine: Arc<dyn SandboxEngine>,
        profiles: Arc<ProfileBuilder>,
        config: PoolConfig,
    ) -> Self {
        let pools = AgentType::ALL
            .into_iter()
            .map(|ty| (ty, TypePool::new()))
            .collect();

        Self {
            inner: Arc::new(PoolInner {
                executor: SingleShotExecutor::new(engine.clone(), profiles.clone()),
                engine,
                profiles,
                config,
                pools,
                metrics: MetricsRecorder::new(),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Warm up the configured instances and start the health and cleanup
    /// loops. Warmup failures are logged and skipped; a partial pool serves
    /// the remaining traffic through on-demand creation.
    pub async fn start(&self) {
        self.inner.running.store(true, Ordering::SeqCst);

        let mut warmups = Vec::new();
        for (&agent_type, &count) in &self.inner.config.warm_per_type {
            for _ in 0..count {
                let inner = self.inner.clone();
                warmups.push(async move {
                    if let Err(e) = inner.create_instance(agent_type, false).await {
                        warn!(agent_type = %agent_type, error = %e, "warmup creation failed");
                    }
                });
            }
        }
        join_all(warmups).await;

        let warmed: usize = {
            let mut total = 0;
            for pool in self.inner.pools.values() {
                total += pool.slots.read().await.len();
            }
            total
        };
        info!(warmed, "sandbox pool started");

        let health = self.inner.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(health.config.health_interval);
            interval.tick().await;
            while health.running.load(Ordering::SeqCst) {
                interval.tick().await;
                health.run_health_checks().await;
                health.retry_pending_refreshes().await;
            }
        });

        let cleanup = self.inner.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup.config.idle_timeout / 2);
            interval.tick().await;
            while cleanup.running.load(Ordering::SeqCst) {
                interval.tick().await;
                cleanup.evict_expired().await;
            }
        });
    }

    /// Run one task in a sandbox of the agent's type.
    ///
    /// `Ok(ExecutionResult { success: false, .. })` means the task ran and
    /// failed; `Err` means the infrastructure could not run it. A failed task
    /// never marks its sandbox unhealthy.
    pub async fn execute_task(
        &self,
        task: &TaskDefinition,
        agent: &AgentState,
    ) -> Result<ExecutionResult> {
        let agent_type = AgentType::from_label(&agent.agent_type);

        let instance = match self.inner.checkout(agent_type).await {
            Some(instance) => {
                self.inner.metrics.record_hit();
                debug!(task = %task.id, instance = %instance.instance_id, "pool hit");
                instance
            }
            None => {
                self.inner.metrics.record_miss();
                self.schedule_scale_eval(agent_type);
                debug!(task = %task.id, agent_type = %agent_type, "pool miss, creating sandbox");
                self.inner.create_instance(agent_type, true).await?
            }
        };

        let ceiling = self.inner.profiles.max_execution(agent_type);
        let result = self
            .inner
            .executor
            .run_in_sandbox(&instance.container_id, task, ceiling)
            .await;

        let duration_ms = result.as_ref().ok().map(|r| r.duration_ms);
        self.inner
            .checkin(agent_type, &instance.instance_id, duration_ms)
            .await;

        Ok(result?)
    }

    /// Grow or shrink one type pool toward `target`.
    ///
    /// Growth failures are logged and skipped. Shrinking removes the
    /// least-recently-used idle instances only; if fewer than requested are
    /// idle the shrink is partial.
    pub async fn scale_pool(&self, agent_type: AgentType, target: usize) {
        self.inner.scale_pool(agent_type, target).await;
    }

    /// Replace one instance with a fresh one of the same type. Busy
    /// instances are marked for deferred refresh instead of being forced.
    pub async fn refresh_sandbox(&self, agent_type: AgentType, instance_id: &str) -> Result<()> {
        self.inner.refresh_sandbox(agent_type, instance_id).await
    }

    /// One health sweep over every instance. Normally driven by the health
    /// loop; exposed so upkeep can also be driven explicitly.
    pub async fn run_health_checks(&self) {
        self.inner.run_health_checks().await;
    }

    /// Replace instances whose refresh was deferred while they were busy.
    pub async fn retry_pending_refreshes(&self) {
        self.inner.retry_pending_refreshes().await;
    }

    /// One cleanup sweep: evict idle instances past max age, past the idle
    /// timeout, or unhealthy. Busy instances are never touched.
    pub async fn evict_expired(&self) {
        self.inner.evict_expired().await;
    }

    /// Remove engine-side containers, networks and volumes that carry this
    /// crate's labels but belong to no live instance, typically left behind
    /// by a crashed predecessor. With `dry_run` the report lists them without
    /// removing anything.
    pub async fn reclaim_orphans(&self, dry_run: bool) -> Result<ReclaimReport> {
        self.inner.reclaim_orphans(dry_run).await
    }

    pub async fn pool_metrics(&self) -> PoolMetricsSnapshot {
        self.inner.pool_metrics().await
    }

    /// Snapshot of one type's instances.
    pub async fn instances(&self, agent_type: AgentType) -> Vec<SandboxInstance> {
        self.inner.pool(agent_type).slots.read().await.clone()
    }

    /// Queue a single scaling evaluation for this type after the cooldown.
    /// Misses arriving while one is queued are collapsed into it.
    fn schedule_scale_eval(&self, agent_type: AgentType) {
        if self
            .inner
            .pool(agent_type)
            .scale_eval_pending
            .swap(true, Ordering::SeqCst)
        {
            return;
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.config.scale_cooldown).await;
            if inner.running.load(Ordering::SeqCst) {
                inner.evaluate_scaling(agent_type).await;
            }
            inner
                .pool(agent_type)
                .scale_eval_pending
                .store(false, Ordering::SeqCst);
        });
    }

    /// Stop the background loops and tear down every instance. Individual
    /// teardown failures are logged; shutdown always completes.
    pub async fn shutdown(&self) {
        self.inner.running.store(false, Ordering::SeqCst);

        let mut drained = Vec::new();
        for pool in self.inner.pools.values() {
            let mut slots = pool.slots.write().await;
            drained.append(&mut *slots);
        }
        info!(count = drained.len(), "shutting down sandbox pool");

        let sandboxes: Vec<ProvisionedSandbox> = drained.iter().map(provisioned).collect();
        let teardowns = sandboxes
            .iter()
            .map(|sandbox| self.inner.executor.teardown(sandbox));
        join_all(teardowns).await;
    }
}

impl PoolInner {
    fn pool(&self, agent_type: AgentType) -> &TypePool {
        // The map is built over every AgentType variant at construction.
        self.pools
            .get(&agent_type)
            .expect("type pool exists for every agent type")
    }

    /// Pick the first healthy idle instance and mark it busy, atomically
    /// under the type's write lock.
    async fn checkout(&self, agent_type: AgentType) -> Option<SandboxInstance> {
        let mut slots = self.pool(agent_type).slots.write().await;
        let slot = slots.iter_mut().find(|s| s.healthy && !s.in_use)?;
        slot.in_use = true;
        Some(slot.clone())
    }

    /// Return an instance to the pool after a checkout, then run any refresh
    /// that was deferred while it was busy.
    async fn checkin(&self, agent_type: AgentType, instance_id: &str, duration_ms: Option<u64>) {
        let needs_refresh = {
            let mut slots = self.pool(agent_type).slots.write().await;
            match slots.iter_mut().find(|s| s.instance_id == instance_id) {
                Some(slot) => {
                    slot.in_use = false;
                    slot.execution_count += 1;
                    slot.last_used_at = Utc::now();
                    slot.refresh_pending
                }
                None => false,
            }
        };

        if let Some(duration_ms) = duration_ms {
            self.metrics.record_duration(agent_type, duration_ms).await;
        }

        if needs_refresh {
            if let Err(e) = self.refresh_sandbox(agent_type, instance_id).await {
                warn!(instance = instance_id, error = %e, "deferred refresh failed");
            }
        }
    }

    /// Provision a new instance and insert it into its type pool. Two
    /// concurrent misses may both create; both instances simply join the
    /// pool, transiently exceeding the configured size.
    async fn create_instance(
        &self,
        agent_type: AgentType,
        checked_out: bool,
    ) -> Result<SandboxInstance> {
        let instance_id = Uuid::new_v4().to_string();
        let sandbox = self.executor.provision(agent_type, &instance_id).await?;

        let instance = SandboxInstance {
            instance_id: sandbox.instance_id,
            agent_type,
            container_id: sandbox.container_id,
            created_at: sandbox.created_at,
            last_used_at: sandbox.created_at,
            execution_count: 0,
            healthy: true,
            in_use: checked_out,
            refresh_pending: false,
            network_id: sandbox.network_id,
            volume_id: sandbox.volume_id,
        };

        let mut slots = self.pool(agent_type).slots.write().await;
        slots.push(instance.clone());
        Ok(instance)
    }

    async fn scale_pool(&self, agent_type: AgentType, target: usize) {
        let current = self.pool(agent_type).slots.read().await.len();

        if target > current {
            for _ in current..target {
                if let Err(e) = self.create_instance(agent_type, false).await {
                    warn!(agent_type = %agent_type, error = %e, "scale-up creation failed");
                }
            }
        } else if target < current {
            let victims = {
                let mut slots = self.pool(agent_type).slots.write().await;
                let mut idle: Vec<(chrono::DateTime<Utc>, String)> = slots
                    .iter()
                    .filter(|s| !s.in_use)
                    .map(|s| (s.last_used_at, s.instance_id.clone()))
                    .collect();
                idle.sort_by_key(|(last_used, _)| *last_used);
                idle.truncate(current - target);

                let mut removed = Vec::new();
                for (_, id) in idle {
                    if let Some(pos) = slots.iter().position(|s| s.instance_id == id) {
                        removed.push(slots.remove(pos));
                    }
                }
                removed
            };

            if !victims.is_empty() {
                debug!(
                    agent_type = %agent_type,
                    removed = victims.len(),
                    "shrinking type pool"
                );
            }
            for victim in &victims {
                self.executor.teardown(&provisioned(victim)).await;
            }
        }
    }

    async fn refresh_sandbox(&self, agent_type: AgentType, instance_id: &str) -> Result<()> {
        let old = {
            let mut slots = self.pool(agent_type).slots.write().await;
            let pos = slots.iter().position(|s| s.instance_id == instance_id);
            match pos {
                Some(pos) => {
                    if slots[pos].in_use {
                        slots[pos].refresh_pending = true;
                        debug!(instance = instance_id, "instance busy, refresh deferred");
                        return Ok(());
                    }
                    slots.remove(pos)
                }
                None => {
                    return Err(PoolError::InstanceNotFound {
                        agent_type,
                        instance_id: instance_id.to_string(),
                    })
                }
            }
        };

        self.executor.teardown(&provisioned(&old)).await;
        let fresh = self.create_instance(agent_type, false).await?;
        info!(
            old = instance_id,
            new = %fresh.instance_id,
            agent_type = %agent_type,
            "refreshed sandbox"
        );
        Ok(())
    }

    async fn retry_pending_refreshes(&self) {
        for &agent_type in &AgentType::ALL {
            let pending: Vec<String> = {
                let slots = self.pool(agent_type).slots.read().await;
                slots
                    .iter()
                    .filter(|s| s.refresh_pending && !s.in_use)
                    .map(|s| s.instance_id.clone())
                    .collect()
            };
            for instance_id in pending {
                if let Err(e) = self.refresh_sandbox(agent_type, &instance_id).await {
                    warn!(instance = %instance_id, error = %e, "pending refresh failed");
                }
            }
        }
    }

    /// Inspect every instance through the gateway; an instance whose
    /// container is no longer running is marked unhealthy with a refresh
    /// scheduled. Per-instance failures are logged and the sweep continues.
    async fn run_health_checks(&self) {
        for &agent_type in &AgentType::ALL {
            let targets: Vec<(String, String)> = {
                let slots = self.pool(agent_type).slots.read().await;
                slots
                    .iter()
                    .map(|s| (s.instance_id.clone(), s.container_id.clone()))
                    .collect()
            };

            for (instance_id, container_id) in targets {
                let alive = match self.engine.inspect_status(&container_id).await {
                    Ok(SandboxStatus::Running) => true,
                    Ok(status) => {
                        warn!(instance = %instance_id, status = %status, "sandbox not running");
                        false
                    }
                    Err(e) => {
                        warn!(instance = %instance_id, error = %e, "health inspection failed");
                        false
                    }
                };
                if !alive {
                    let mut slots = self.pool(agent_type).slots.write().await;
                    if let Some(slot) = slots.iter_mut().find(|s| s.instance_id == instance_id) {
                        slot.healthy = false;
                        slot.refresh_pending = true;
                    }
                }
            }
        }
    }

    async fn evict_expired(&self) {
        let now = Utc::now();
        let max_age = chrono::Duration::from_std(self.config.max_age)
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1000));
        let idle_timeout = chrono::Duration::from_std(self.config.idle_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1000));

        for &agent_type in &AgentType::ALL {
            let evicted = {
                let mut slots = self.pool(agent_type).slots.write().await;
                let mut evicted = Vec::new();
                let mut i = 0;
                while i < slots.len() {
                    let s = &slots[i];
                    let expired = !s.in_use
                        && (!s.healthy
                            || now - s.created_at > max_age
                            || now - s.last_used_at > idle_timeout);
                    if expired {
                        evicted.push(slots.remove(i));
                    } else {
                        i += 1;
                    }
                }
                evicted
            };

            for instance in &evicted {
                debug!(
                    instance = %instance.instance_id,
                    agent_type = %agent_type,
                    healthy = instance.healthy,
                    "evicting expired sandbox"
                );
                self.executor.teardown(&provisioned(instance)).await;
            }
        }
    }

    /// Recompute this type's utilization and move its size one step toward
    /// the configured band.
    async fn evaluate_scaling(&self, agent_type: AgentType) {
        let (total, in_use) = {
            let slots = self.pool(agent_type).slots.read().await;
            (slots.len(), slots.iter().filter(|s| s.in_use).count())
        };
        // An empty pool that just missed counts as fully utilized.
        let utilization = if total == 0 {
            1.0
        } else {
            in_use as f64 / total as f64
        };

        if utilization > self.config.scale_up_threshold && total < self.config.max_size {
            info!(agent_type = %agent_type, utilization, total, "scaling up");
            self.scale_pool(agent_type, total + 1).await;
        } else if utilization < self.config.scale_down_threshold && total > self.config.min_size {
            info!(agent_type = %agent_type, utilization, total, "scaling down");
            self.scale_pool(agent_type, total - 1).await;
        }
    }

    async fn reclaim_orphans(&self, dry_run: bool) -> Result<ReclaimReport> {
        let label = format!("{}=true", LABEL_MANAGED);

        let mut live_containers = Vec::new();
        let mut live_networks = Vec::new();
        let mut live_volumes = Vec::new();
        for pool in self.pools.values() {
            let slots = pool.slots.read().await;
            for s in slots.iter() {
                live_containers.push(s.container_id.clone());
                live_networks.push(s.network_id.clone());
                live_volumes.push(s.volume_id.clone());
            }
        }

        let mut report = ReclaimReport {
            dry_run,
            ..Default::default()
        };
        report.containers = self
            .engine
            .list_containers(&label)
            .await?
            .into_iter()
            .filter(|id| !live_containers.contains(id))
            .collect();
        report.networks = self
            .engine
            .list_networks(&label)
            .await?
            .into_iter()
            .filter(|id| !live_networks.contains(id))
            .collect();
        report.volumes = self
            .engine
            .list_volumes(&label)
            .await?
            .into_iter()
            .filter(|id| !live_volumes.contains(id))
            .collect();

        if report.is_empty() || dry_run {
            return Ok(report);
        }

        // Containers first so networks and volumes are no longer referenced.
        for id in &report.containers {
            if let Err(e) = self.engine.remove(id, true).await {
                warn!(container = %id, error = %e, "orphan container removal failed");
            }
        }
        for id in &report.networks {
            if let Err(e) = self.engine.remove_network(id).await {
                warn!(network = %id, error = %e, "orphan network removal failed");
            }
        }
        for id in &report.volumes {
            if let Err(e) = self.engine.remove_volume(id).await {
                warn!(volume = %id, error = %e, "orphan volume removal failed");
            }
        }
        info!(
            containers = report.containers.len(),
            networks = report.networks.len(),
            volumes = report.volumes.len(),
            "reclaimed orphaned resources"
        );
        Ok(report)
    }

    async fn pool_metrics(&self) -> PoolMetricsSnapshot {
        let mut total = 0;
        let mut active = 0;
        let mut healthy = 0;
        let mut unhealthy = 0;
        let mut by_type = HashMap::new();

        for (&agent_type, pool) in &self.pools {
            let slots = pool.slots.read().await;
            if !slots.is_empty() {
                by_type.insert(agent_type.to_string(), slots.len());
            }
            total += slots.len();
            active += slots.iter().filter(|s| s.in_use).count();
            healthy += slots.iter().filter(|s| s.healthy).count();
            unhealthy += slots.iter().filter(|s| !s.healthy).count();
        }

        PoolMetricsSnapshot {
            total_sandboxes: total,
            active_sandboxes: active,
            idle_sandboxes: total - active,
            healthy_sandboxes: healthy,
            unhealthy_sandboxes: unhealthy,
            sandboxes_by_type: by_type,
            utilization: if total == 0 {
                0.0
            } else {
                active as f64 / total as f64
            },
            hit_rate: self.metrics.hit_rate(),
            avg_execution_ms_by_type: self.metrics.avg_execution_ms().await,
        }
    }
}

fn provisioned(instance: &SandboxInstance) -> ProvisionedSandbox {
    ProvisionedSandbox {
        instance_id: instance.instance_id.clone(),
        agent_type: instance.agent_type,
        container_id: instance.container_id.clone(),
        network_id: instance.network_id.clone(),
        volume_id: instance.volume_id.clone(),
        created_at: instance.created_at,
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            error!("sandbox pool dropped without shutdown; engine-side resources may leak");
        }
    }
}
