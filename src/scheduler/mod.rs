//! Cooperative dispatcher
//!
//! One loop on one thread runs a fixed set of periodic tasks. Tasks run to
//! completion in registration order; nothing preempts them. Foreground work
//! (payload staging) shares the thread and must yield so the heartbeat keeps
//! its deadline.
//!
//! ```text
//! ┌──────────── tick ────────────┐
//! │ collector   every 5 s        │
//! │ heartbeat   every 1 s  ──→ Watchdog
//! │ health      every 1 s  ──→ HealthChecker
//! └──────────────────────────────┘
//! ```

pub mod health;
pub mod tasks;
pub mod watchdog;

pub use health::{HealthChecker, HealthStatus, MemoryHealth};
pub use tasks::{CollectorTask, HealthTask, HeartbeatTask};
pub use watchdog::Watchdog;

use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::memory::MemoryManager;
use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// A unit of periodic work
#[async_trait]
pub trait PeriodicTask: Send {
    fn name(&self) -> &'static str;

    async fn run(&mut self) -> Result<()>;
}

struct ScheduledTask {
    task: Box<dyn PeriodicTask>,
    period: Duration,
    next_due: Instant,
    runs: u64,
    failures: u64,
}

/// Per-task counters
#[derive(Debug, Clone, Serialize)]
pub struct TaskStats {
    pub name: &'static str,
    pub period_ms: u64,
    pub runs: u64,
    pub failures: u64,
}

/// The dispatcher loop
pub struct Scheduler {
    tick: Duration,
    tasks: Vec<ScheduledTask>,
}

impl Scheduler {
    pub fn new(tick: Duration) -> Self {
        Self {
            tick,
            tasks: Vec::new(),
        }
    }

    /// Scheduler with the collector, heartbeat and health tasks at their
    /// configured periods
    pub fn with_default_tasks(
        config: &SchedulerConfig,
        manager: &MemoryManager,
        watchdog: &Watchdog,
        health: &HealthChecker,
    ) -> Self {
        let mut scheduler = Self::new(config.tick());
        scheduler.add_task(
            Box::new(HeartbeatTask::new(watchdog.clone())),
            config.heartbeat_interval(),
        );
        scheduler.add_task(
            Box::new(HealthTask::new(health.clone(), manager.clone())),
            config.health_interval(),
        );
        scheduler.add_task(
            Box::new(CollectorTask::new(manager.clone())),
            config.collector_interval(),
        );
        scheduler
    }

    /// Register a task. A zero period runs it on every tick. The first run
    /// is on the next tick.
    pub fn add_task(&mut self, task: Box<dyn PeriodicTask>, period: Duration) -> &mut Self {
        debug!(task = task.name(), period_ms = period.as_millis() as u64, "Task registered");
        self.tasks.push(ScheduledTask {
            task,
            period,
            next_due: Instant::now(),
            runs: 0,
            failures: 0,
        });
        self
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn task_stats(&self) -> Vec<TaskStats> {
        self.tasks
            .iter()
            .map(|t| TaskStats {
                name: t.task.name(),
                period_ms: t.period.as_millis() as u64,
                runs: t.runs,
                failures: t.failures,
            })
            .collect()
    }

    /// Run every task that is due. Returns how many ran.
    ///
    /// A fatal error stops the tick and is returned; any other task error is
    /// logged and counted.
    pub async fn tick(&mut self) -> Result<usize> {
        let now = Instant::now();
        let mut ran = 0;

        for scheduled in self.tasks.iter_mut() {
            if now < scheduled.next_due {
                continue;
            }
            scheduled.next_due = now + scheduled.period;
            scheduled.runs += 1;
            ran += 1;

            if let Err(e) = scheduled.task.run().await {
                scheduled.failures += 1;
                if e.is_fatal() {
                    error!(task = scheduled.task.name(), error = %e, "Fatal task error, stopping dispatcher");
                    return Err(e);
                }
                warn!(task = scheduled.task.name(), error = %e, "Task failed");
            }
        }

        Ok(ran)
    }

    /// Dispatch until `shutdown` resolves or a task fails fatally
    #[instrument(skip(self, shutdown))]
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            tasks = self.tasks.len(),
            tick_ms = self.tick.as_millis() as u64,
            "Dispatcher started"
        );
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Dispatcher shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.tick) => {
                    self.tick().await?;
                }
            }
        }
    }
}
