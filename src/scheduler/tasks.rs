//! Built-in periodic tasks

use super::health::HealthChecker;
use super::watchdog::Watchdog;
use super::PeriodicTask;
use crate::error::Result;
use crate::memory::MemoryManager;
use async_trait::async_trait;
use tracing::debug;

/// Runs the collector sweep
pub struct CollectorTask {
    manager: MemoryManager,
}

impl CollectorTask {
    pub fn new(manager: MemoryManager) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl PeriodicTask for CollectorTask {
    fn name(&self) -> &'static str {
        "collector"
    }

    async fn run(&mut self) -> Result<()> {
        let report = self.manager.run_collector_sweep();
        if report.freed > 0 {
            debug!(freed = report.freed, bytes = report.freed_bytes, "Collector reclaimed memory");
        }
        Ok(())
    }
}

/// Feeds the watchdog
pub struct HeartbeatTask {
    watchdog: Watchdog,
}

impl HeartbeatTask {
    pub fn new(watchdog: Watchdog) -> Self {
        Self { watchdog }
    }
}

#[async_trait]
impl PeriodicTask for HeartbeatTask {
    fn name(&self) -> &'static str {
        "heartbeat"
    }

    async fn run(&mut self) -> Result<()> {
        self.watchdog.feed()
    }
}

/// Refreshes memory health and the occupancy gauges
pub struct HealthTask {
    checker: HealthChecker,
    manager: MemoryManager,
}

impl HealthTask {
    pub fn new(checker: HealthChecker, manager: MemoryManager) -> Self {
        Self { checker, manager }
    }
}

#[async_trait]
impl PeriodicTask for HealthTask {
    fn name(&self) -> &'static str {
        "health"
    }

    async fn run(&mut self) -> Result<()> {
        let stats = self.manager.stats();
        let health = self.checker.update_memory(&stats).await;
        debug!(
            status = %health.status,
            pool_utilization = health.pool_utilization,
            heap_utilization = health.heap_utilization,
            "Health check"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use std::time::Duration;

    #[tokio::test]
    async fn test_collector_task_sweeps() {
        let mm = MemoryManager::new(MemoryConfig::default()).unwrap();
        drop(mm.allocate_handle(32).unwrap());

        let mut task = CollectorTask::new(mm.clone());
        task.run().await.unwrap();
        assert_eq!(mm.stats().pending_reclaim, 0);
        assert_eq!(mm.stats().tracked_allocations, 0);
    }

    #[tokio::test]
    async fn test_heartbeat_task_feeds() {
        let watchdog = Watchdog::new(Duration::from_secs(5));
        let mut task = HeartbeatTask::new(watchdog.clone());
        task.run().await.unwrap();
        assert_eq!(watchdog.feeds(), 1);
    }

    #[tokio::test]
    async fn test_health_task_updates_checker() {
        let mm = MemoryManager::new(MemoryConfig::default()).unwrap();
        let checker = HealthChecker::new();
        checker.set_startup_complete().await;

        let mut task = HealthTask::new(checker.clone(), mm);
        task.run().await.unwrap();
        assert_eq!(checker.get_status().await.status, "healthy");
    }
}
