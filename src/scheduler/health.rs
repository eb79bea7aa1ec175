//! Health checks for the memory subsystem
//!
//! Features:
//! - Liveness (is the dispatcher alive?)
//! - Readiness (startup complete and memory not under pressure)
//! - Startup (has initialization completed?)

use crate::memory::MemoryStats;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

/// Utilization (percent) above which memory is reported as degraded
pub const DEFAULT_DEGRADED_PERCENT: f64 = 90.0;

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Overall status ("healthy", "degraded", "starting")
    pub status: String,
    pub ready: bool,
    pub alive: bool,
    pub version: String,
    pub uptime_seconds: u64,
    pub memory: MemoryHealth,
}

/// Memory health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryHealth {
    pub status: String,
    /// Pool blocks in use, percent
    pub pool_utilization: f64,
    /// System heap bytes in use, percent
    pub heap_utilization: f64,
    pub live_slots: usize,
    pub pending_reclaim: usize,
}

impl MemoryHealth {
    fn starting() -> Self {
        Self {
            status: "starting".to_string(),
            pool_utilization: 0.0,
            heap_utilization: 0.0,
            live_slots: 0,
            pending_reclaim: 0,
        }
    }
}

fn percent(used: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 * 100.0 / total as f64
    }
}

/// Health check manager
#[derive(Clone)]
pub struct HealthChecker {
    start_time: Arc<RwLock<std::time::Instant>>,
    is_startup_complete: Arc<RwLock<bool>>,
    memory_health: Arc<RwLock<MemoryHealth>>,
    degraded_percent: f64,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_DEGRADED_PERCENT)
    }

    pub fn with_threshold(degraded_percent: f64) -> Self {
        Self {
            start_time: Arc::new(RwLock::new(std::time::Instant::now())),
            is_startup_complete: Arc::new(RwLock::new(false)),
            memory_health: Arc::new(RwLock::new(MemoryHealth::starting())),
            degraded_percent,
        }
    }

    /// Mark startup as complete
    pub async fn set_startup_complete(&self) {
        let mut is_complete = self.is_startup_complete.write().await;
        *is_complete = true;
        info!("Health checker: Startup COMPLETE");
    }

    /// Recompute memory health from a stats snapshot
    pub async fn update_memory(&self, stats: &MemoryStats) -> MemoryHealth {
        let pool_utilization = percent(stats.blocks_in_use, stats.blocks_total);
        let heap_utilization = percent(stats.heap_in_use, stats.heap_capacity);

        let status = if pool_utilization >= self.degraded_percent
            || heap_utilization >= self.degraded_percent
        {
            "degraded"
        } else {
            "healthy"
        };

        let health = MemoryHealth {
            status: status.to_string(),
            pool_utilization,
            heap_utilization,
            live_slots: stats.live_slots,
            pending_reclaim: stats.pending_reclaim,
        };

        let mut current = self.memory_health.write().await;
        if current.status != health.status {
            if health.status == "degraded" {
                warn!(pool_utilization, heap_utilization, "Memory health DEGRADED");
            } else {
                info!(pool_utilization, heap_utilization, "Memory health {}", health.status);
            }
        }
        *current = health.clone();
        health
    }

    async fn get_uptime(&self) -> u64 {
        let start = self.start_time.read().await;
        start.elapsed().as_secs()
    }

    /// Check liveness
    #[instrument(skip(self))]
    pub async fn check_liveness(&self) -> bool {
        // Answering at all means the dispatcher is running
        true
    }

    /// Check readiness (startup done and memory healthy)
    #[instrument(skip(self))]
    pub async fn check_readiness(&self) -> bool {
        let startup = *self.is_startup_complete.read().await;
        let memory = self.memory_health.read().await;
        startup && memory.status == "healthy"
    }

    #[instrument(skip(self))]
    pub async fn check_startup(&self) -> bool {
        *self.is_startup_complete.read().await
    }

    /// Get full health status
    pub async fn get_status(&self) -> HealthStatus {
        let uptime = self.get_uptime().await;
        let memory = self.memory_health.read().await.clone();

        let ready = self.check_readiness().await;
        let alive = self.check_liveness().await;
        let startup = self.check_startup().await;

        let overall_status = if ready {
            "healthy"
        } else if startup {
            "degraded"
        } else {
            "starting"
        };

        HealthStatus {
            status: overall_status.to_string(),
            ready,
            alive,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime,
            memory,
        }
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(blocks_in_use: usize, heap_in_use: usize) -> MemoryStats {
        MemoryStats {
            blocks_total: 100,
            blocks_in_use,
            heap_capacity: 1000,
            heap_in_use,
            ..MemoryStats::default()
        }
    }

    #[tokio::test]
    async fn test_liveness_always_true() {
        let checker = HealthChecker::new();
        assert!(checker.check_liveness().await);
    }

    #[tokio::test]
    async fn test_startup_initially_false() {
        let checker = HealthChecker::new();
        assert!(!checker.check_startup().await);

        checker.set_startup_complete().await;
        assert!(checker.check_startup().await);
    }

    #[tokio::test]
    async fn test_memory_pressure_degrades() {
        let checker = HealthChecker::new();
        checker.set_startup_complete().await;

        let health = checker.update_memory(&stats(10, 100)).await;
        assert_eq!(health.status, "healthy");
        assert!(checker.check_readiness().await);

        let health = checker.update_memory(&stats(95, 100)).await;
        assert_eq!(health.status, "degraded");
        assert!((health.pool_utilization - 95.0).abs() < f64::EPSILON);
        assert!(!checker.check_readiness().await);

        let health = checker.update_memory(&stats(10, 950)).await;
        assert_eq!(health.status, "degraded");
    }

    #[tokio::test]
    async fn test_health_transitions() {
        let checker = HealthChecker::new();

        let status = checker.get_status().await;
        assert_eq!(status.status, "starting");
        assert_eq!(status.version, env!("CARGO_PKG_VERSION"));

        // Startup complete, memory not yet checked
        checker.set_startup_complete().await;
        assert_eq!(checker.get_status().await.status, "degraded");

        checker.update_memory(&stats(1, 1)).await;
        let status = checker.get_status().await;
        assert_eq!(status.status, "healthy");
        assert!(status.ready);
    }

    #[test]
    fn test_percent_of_empty_total() {
        assert_eq!(percent(0, 0), 0.0);
        assert_eq!(percent(5, 10), 50.0);
    }
}
