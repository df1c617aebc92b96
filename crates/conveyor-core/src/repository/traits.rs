//! Repository traits for store abstraction
//!
//! These traits define the interface that all store implementations must
//! provide. The engine only depends on these contracts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::StoreResult;
use crate::models::{Job, JobDependency, JobId, JobStatus, Worker, WorkerId};

/// Job store trait - backend agnostic
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Find job by id
    async fn find(&self, job_id: &JobId) -> StoreResult<Option<Job>>;

    /// Find all jobs in the given status
    async fn find_all_by_status(&self, status: JobStatus) -> StoreResult<Vec<Job>>;

    /// Find jobs whose prerequisites are all satisfied and whose
    /// scheduled-at time (if any) has passed
    async fn find_ready_to_execute(&self, now: DateTime<Utc>) -> StoreResult<Vec<Job>>;

    /// Find jobs bound to the given worker
    async fn find_by_assigned_worker(&self, worker_id: &WorkerId) -> StoreResult<Vec<Job>>;

    /// Insert or update a job record
    async fn save(&self, job: &Job) -> StoreResult<()>;

    /// Delete a job record
    async fn delete(&self, job_id: &JobId) -> StoreResult<bool>;
}

/// Worker store trait - backend agnostic
#[async_trait]
pub trait WorkerStore: Send + Sync + 'static {
    /// Find worker by id
    async fn find(&self, worker_id: &WorkerId) -> StoreResult<Option<Worker>>;

    /// List all workers
    async fn find_all(&self) -> StoreResult<Vec<Worker>>;

    /// List workers in ACTIVE or BUSY
    async fn find_all_active(&self) -> StoreResult<Vec<Worker>>;

    /// List workers whose last heartbeat predates `ts` (or who never sent one)
    async fn find_by_last_heartbeat_before(&self, ts: DateTime<Utc>) -> StoreResult<Vec<Worker>>;

    /// Insert or update a worker record
    async fn save(&self, worker: &Worker) -> StoreResult<()>;

    /// Delete a worker record
    async fn delete(&self, worker_id: &WorkerId) -> StoreResult<bool>;
}

/// Dependency edge store trait - backend agnostic
#[async_trait]
pub trait DependencyStore: Send + Sync + 'static {
    /// Edges where the given job is the waiting child
    async fn find_by_child(&self, job_id: &JobId) -> StoreResult<Vec<JobDependency>>;

    /// Edges where the given job is the prerequisite parent
    async fn find_by_parent(&self, job_id: &JobId) -> StoreResult<Vec<JobDependency>>;

    /// Insert or update an edge, keyed on (child, parent)
    async fn save(&self, edge: &JobDependency) -> StoreResult<()>;

    /// Delete an edge
    async fn delete(&self, child: &JobId, parent: &JobId) -> StoreResult<bool>;

    /// Count unsatisfied edges for a child
    async fn count_unsatisfied(&self, job_id: &JobId) -> StoreResult<usize>;
}

/// Store container - holds all repositories the engine needs
#[derive(Clone)]
pub struct Stores {
    pub jobs: Arc<dyn JobStore>,
    pub workers: Arc<dyn WorkerStore>,
    pub dependencies: Arc<dyn DependencyStore>,
}

impl Stores {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        workers: Arc<dyn WorkerStore>,
        dependencies: Arc<dyn DependencyStore>,
    ) -> Self {
        Self {
            jobs,
            workers,
            dependencies,
        }
    }

    /// In-memory stores for tests and default wiring. The job store shares
    /// the dependency store so readiness queries see edge satisfaction.
    pub fn in_memory() -> Self {
        let dependencies = Arc::new(super::memory::InMemoryDependencyStore::new());
        Self {
            jobs: Arc::new(
                super::memory::InMemoryJobStore::new().with_dependency_store(dependencies.clone()),
            ),
            workers: Arc::new(super::memory::InMemoryWorkerStore::new()),
            dependencies,
        }
    }
}
