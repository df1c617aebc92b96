//! Periodic task table
//!
//! Every background activity the engine runs is declared here as data.
//! Each task's deadline equals its period: a tick that overruns is
//! interrupted and the work restarts fresh on the next tick.

use std::time::Duration;

use crate::config::SchedulerConfig;

/// What a periodic tick does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Move ready jobs from the queue to workers
    Drain,

    /// Shift unconfirmed work off overloaded workers
    Rebalance,

    /// Worker health checks plus the graph invariant sweep
    HealthCheck,

    /// Retire stale ERROR workers and drop idle rate-limit trackers
    Cleanup,
}

/// One periodic task entry
#[derive(Debug, Clone, Copy)]
pub struct PeriodicTask {
    pub name: &'static str,
    pub period: Duration,
    pub kind: TaskKind,
}

/// Build the task table for a configuration
pub fn task_table(config: &SchedulerConfig) -> Vec<PeriodicTask> {
    vec![
        PeriodicTask {
            name: "drain",
            period: config.load_balancing.drain_interval(),
            kind: TaskKind::Drain,
        },
        PeriodicTask {
            name: "rebalance",
            period: config.load_balancing.rebalance_interval(),
            kind: TaskKind::Rebalance,
        },
        PeriodicTask {
            name: "health-check",
            period: config.health.check_interval(),
            kind: TaskKind::HealthCheck,
        },
        PeriodicTask {
            name: "cleanup",
            period: config.health.cleanup_interval(),
            kind: TaskKind::Cleanup,
        },
    ]
}
