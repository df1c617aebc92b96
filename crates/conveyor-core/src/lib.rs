//! Core scheduling engine for a distributed job scheduler
//!
//! Accepts job submissions with priorities and inter-job dependencies,
//! tracks a fleet of remote workers through heartbeats, and assigns
//! ready jobs to suitable workers under load-balancing, failure, and
//! ordering constraints.
//!
//! The engine composes:
//! - a dependency DAG with insertion-time cycle rejection
//! - a three-band priority-ordered ready queue
//! - a worker registry with rate-limited registration and heartbeats
//! - a periodic health monitor with auto-recovery and cleanup
//! - a pluggable assignment policy
//! - a load balancer draining queues and rebalancing workers
//! - a failure controller with bounded retries
//!
//! Persistence and caching stay behind the `repository` and `cache`
//! traits; in-memory implementations ship for tests and local runs.

pub mod assignment;
pub mod balancer;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod failure;
pub mod graph;
pub mod health;
pub mod models;
pub mod queue;
pub mod registry;
pub mod repository;
pub mod scheduler;
pub mod util;

// Re-export commonly used types
pub use assignment::{AssignmentPolicy, Strategy};
pub use balancer::{BalancerMetrics, DrainSummary, LoadBalancer};
pub use cache::{CacheStore, MemoryCache};
pub use config::SchedulerConfig;
pub use error::{Error, Result};
pub use events::{EventBus, SchedulerEvent};
pub use failure::{FailureController, ReassignOutcome};
pub use graph::{CycleReport, CycleSeverity, DependencyGraph, GraphError};
pub use health::{HealthCheckResult, HealthMonitor, HealthState};
pub use models::{
    DependencyKind, FailureAction, Job, JobDependency, JobId, JobOutcome, JobStatus, PriorityBand,
    RegisterWorker, Worker, WorkerHeartbeat, WorkerId, WorkerStatus,
};
pub use queue::{PriorityQueue, QueueStats};
pub use registry::{RegistryError, WorkerRegistry};
pub use repository::{DependencyStore, JobStore, StoreError, Stores, WorkerStore};
pub use scheduler::{DependencySpec, SchedulerCore, SchedulerStats, SubmitJob};

/// Current version of the engine
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_available() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_error_reason_surface() {
        let err = Error::validation("bad priority");
        assert_eq!(err.reason(), "validation");
    }
}
