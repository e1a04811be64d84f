// ABOUTME: Pool metrics recorder tracking hit rate and rolling execution times
// ABOUTME: Counters are lock-free; the per-type duration windows sit behind a RwLock

use crate::types::AgentType;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Rolling window size for per-type execution times.
const DURATION_WINDOW: usize = 100;

/// Point-in-time view of the pool, safe to serialize into status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetricsSnapshot {
    pub total_sandboxes: usize,
    pub active_sandboxes: usize,
    pub idle_sandboxes: usize,
    pub healthy_sandboxes: usize,
    pub unhealthy_sandboxes: usize,
    pub sandboxes_by_type: HashMap<String, usize>,
    /// active / total, 0.0 when the pool is empty.
    pub utilization: f64,
    /// hits / (hits + misses), 0.0 before the first checkout.
    pub hit_rate: f64,
    pub avg_execution_ms_by_type: HashMap<String, u64>,
}

/// Accumulates checkout and execution statistics for the pool.
///
/// Hits and misses are monotonic counters; durations keep only the most
/// recent [`DURATION_WINDOW`] samples per agent type.
#[derive(Default)]
pub struct MetricsRecorder {
    hits: AtomicU64,
    misses: AtomicU64,
    durations: RwLock<HashMap<AgentType, VecDeque<u64>>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A checkout satisfied by a warm idle sandbox.
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// A checkout that fell through to ad hoc creation.
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn record_duration(&self, agent_type: AgentType, duration_ms: u64) {
        let mut durations = self.durations.write().await;
        let window = durations.entry(agent_type).or_default();
        window.push_back(duration_ms);
        while window.len() > DURATION_WINDOW {
            window.pop_front();
        }
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub async fn avg_execution_ms(&self) -> HashMap<String, u64> {
        let durations = self.durations.read().await;
        durations
            .iter()
            .filter(|(_, window)| !window.is_empty())
            .map(|(ty, window)| {
                let sum: u64 = window.iter().sum();
                (ty.to_string(), sum / window.len() as u64)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate_zero_before_first_checkout() {
        let metrics = MetricsRecorder::new();
        assert_eq!(metrics.hit_rate(), 0.0);
    }

    #[test]
    fn test_hit_rate_arithmetic() {
        let metrics = MetricsRecorder::new();
        metrics.record_hit();
        metrics.record_hit();
        metrics.record_hit();
        metrics.record_miss();
        assert_eq!(metrics.hit_rate(), 0.75);
    }

    #[tokio::test]
    async fn test_duration_window_keeps_latest_samples() {
        let metrics = MetricsRecorder::new();
        // 150 samples of 10ms followed by 100 of 30ms: only the last 100 count.
        for _ in 0..150 {
            metrics.record_duration(AgentType::Coder, 10).await;
        }
        for _ in 0..100 {
            metrics.record_duration(AgentType::Coder, 30).await;
        }
        let avgs = metrics.avg_execution_ms().await;
        assert_eq!(avgs.get("coder").copied(), Some(30));
    }

    #[tokio::test]
    async fn test_averages_tracked_per_type() {
        let metrics = MetricsRecorder::new();
        metrics.record_duration(AgentType::Coder, 100).await;
        metrics.record_duration(AgentType::Coder, 300).await;
        metrics.record_duration(AgentType::Planner, 50).await;
        let avgs = metrics.avg_execution_ms().await;
        assert_eq!(avgs.get("coder").copied(), Some(200));
        assert_eq!(avgs.get("planner").copied(), Some(50));
        assert!(avgs.get("tester").is_none());
    }
}
