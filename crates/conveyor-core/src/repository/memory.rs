//! In-memory store implementations
//!
//! Backed by concurrent maps; used by the default wiring and the test
//! suite so the engine runs without external infrastructure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;

use super::{StoreResult, DependencyStore, JobStore, WorkerStore};
use crate::models::{Job, JobDependency, JobId, JobStatus, Worker, WorkerId};

/// In-memory job store
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: DashMap<JobId, Job>,
    dependencies: Option<Arc<InMemoryDependencyStore>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
            dependencies: None,
        }
    }

    /// Share a dependency store so readiness queries can consult edge
    /// satisfaction, the way a relational backend would join
    pub fn with_dependency_store(mut self, deps: Arc<InMemoryDependencyStore>) -> Self {
        self.dependencies = Some(deps);
        self
    }

    fn unsatisfied_count(&self, job_id: &JobId) -> usize {
        self.dependencies
            .as_ref()
            .map(|d| d.unsatisfied_count_sync(job_id))
            .unwrap_or(0)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn find(&self, job_id: &JobId) -> StoreResult<Option<Job>> {
        Ok(self.jobs.get(job_id).map(|j| j.clone()))
    }

    async fn find_all_by_status(&self, status: JobStatus) -> StoreResult<Vec<Job>> {
        Ok(self
            .jobs
            .iter()
            .filter(|j| j.status == status)
            .map(|j| j.clone())
            .collect())
    }

    async fn find_ready_to_execute(&self, now: DateTime<Utc>) -> StoreResult<Vec<Job>> {
        Ok(self
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .filter(|j| j.scheduled_at.map(|at| at <= now).unwrap_or(true))
            .filter(|j| self.unsatisfied_count(&j.id) == 0)
            .map(|j| j.clone())
            .collect())
    }

    async fn find_by_assigned_worker(&self, worker_id: &WorkerId) -> StoreResult<Vec<Job>> {
        Ok(self
            .jobs
            .iter()
            .filter(|j| j.assigned_worker_id.as_ref() == Some(worker_id))
            .map(|j| j.clone())
            .collect())
    }

    async fn save(&self, job: &Job) -> StoreResult<()> {
        self.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn delete(&self, job_id: &JobId) -> StoreResult<bool> {
        Ok(self.jobs.remove(job_id).is_some())
    }
}

/// In-memory worker store
#[derive(Default)]
pub struct InMemoryWorkerStore {
    workers: DashMap<WorkerId, Worker>,
}

impl InMemoryWorkerStore {
    pub fn new() -> Self {
        Self {
            workers: DashMap::new(),
        }
    }
}

#[async_trait]
impl WorkerStore for InMemoryWorkerStore {
    async fn find(&self, worker_id: &WorkerId) -> StoreResult<Option<Worker>> {
        Ok(self.workers.get(worker_id).map(|w| w.clone()))
    }

    async fn find_all(&self) -> StoreResult<Vec<Worker>> {
        Ok(self.workers.iter().map(|w| w.clone()).collect())
    }

    async fn find_all_active(&self) -> StoreResult<Vec<Worker>> {
        Ok(self
            .workers
            .iter()
            .filter(|w| w.status.is_schedulable())
            .map(|w| w.clone())
            .collect())
    }

    async fn find_by_last_heartbeat_before(&self, ts: DateTime<Utc>) -> StoreResult<Vec<Worker>> {
        Ok(self
            .workers
            .iter()
            .filter(|w| w.last_heartbeat.map(|hb| hb < ts).unwrap_or(true))
            .map(|w| w.clone())
            .collect())
    }

    async fn save(&self, worker: &Worker) -> StoreResult<()> {
        self.workers.insert(worker.id.clone(), worker.clone());
        Ok(())
    }

    async fn delete(&self, worker_id: &WorkerId) -> StoreResult<bool> {
        Ok(self.workers.remove(worker_id).is_some())
    }
}

/// In-memory dependency edge store, keyed on (child, parent)
#[derive(Default)]
pub struct InMemoryDependencyStore {
    edges: DashMap<(JobId, JobId), JobDependency>,
}

impl InMemoryDependencyStore {
    pub fn new() -> Self {
        Self {
            edges: DashMap::new(),
        }
    }

    fn unsatisfied_count_sync(&self, job_id: &JobId) -> usize {
        self.edges
            .iter()
            .filter(|e| e.child == *job_id && !e.satisfied)
            .count()
    }
}

#[async_trait]
impl DependencyStore for InMemoryDependencyStore {
    async fn find_by_child(&self, job_id: &JobId) -> StoreResult<Vec<JobDependency>> {
        Ok(self
            .edges
            .iter()
            .filter(|e| e.child == *job_id)
            .map(|e| e.clone())
            .collect())
    }

    async fn find_by_parent(&self, job_id: &JobId) -> StoreResult<Vec<JobDependency>> {
        Ok(self
            .edges
            .iter()
            .filter(|e| e.parent == *job_id)
            .map(|e| e.clone())
            .collect())
    }

    async fn save(&self, edge: &JobDependency) -> StoreResult<()> {
        self.edges.insert(edge.key(), edge.clone());
        Ok(())
    }

    async fn delete(&self, child: &JobId, parent: &JobId) -> StoreResult<bool> {
        Ok(self.edges.remove(&(*child, *parent)).is_some())
    }

    async fn count_unsatisfied(&self, job_id: &JobId) -> StoreResult<usize> {
        Ok(self.unsatisfied_count_sync(job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DependencyKind;

    #[tokio::test]
    async fn test_job_store_round_trip() {
        let store = InMemoryJobStore::new();
        let job = Job::new("j", "t", serde_json::json!({}));

        store.save(&job).await.unwrap();
        let loaded = store.find(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.name, "j");

        assert!(store.delete(&job.id).await.unwrap());
        assert!(store.find(&job.id).await.unwrap().is_none());
        assert!(!store.delete(&job.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_find_by_status_and_worker() {
        let store = InMemoryJobStore::new();

        let mut running = Job::new("r", "t", serde_json::json!({}));
        running.mark_scheduled().unwrap();
        running.mark_running("w-1".to_string()).unwrap();
        store.save(&running).await.unwrap();

        let pending = Job::new("p", "t", serde_json::json!({}));
        store.save(&pending).await.unwrap();

        let by_status = store.find_all_by_status(JobStatus::Running).await.unwrap();
        assert_eq!(by_status.len(), 1);
        assert_eq!(by_status[0].id, running.id);

        let by_worker = store
            .find_by_assigned_worker(&"w-1".to_string())
            .await
            .unwrap();
        assert_eq!(by_worker.len(), 1);
        assert_eq!(by_worker[0].id, running.id);
    }

    #[tokio::test]
    async fn test_ready_to_execute_respects_edges_and_deferral() {
        let deps = Arc::new(InMemoryDependencyStore::new());
        let store = InMemoryJobStore::new().with_dependency_store(deps.clone());

        let parent = Job::new("parent", "t", serde_json::json!({}));
        let child = Job::new("child", "t", serde_json::json!({}));
        let deferred = Job::new("later", "t", serde_json::json!({}))
            .schedule_at(Utc::now() + chrono::Duration::hours(1));

        store.save(&parent).await.unwrap();
        store.save(&child).await.unwrap();
        store.save(&deferred).await.unwrap();

        deps.save(&JobDependency::new(
            child.id,
            parent.id,
            DependencyKind::MustComplete,
        ))
        .await
        .unwrap();

        let ready = store.find_ready_to_execute(Utc::now()).await.unwrap();
        let ids: Vec<JobId> = ready.iter().map(|j| j.id).collect();

        assert!(ids.contains(&parent.id));
        assert!(!ids.contains(&child.id)); // unsatisfied edge
        assert!(!ids.contains(&deferred.id)); // deferred

        // Satisfy the edge and the child becomes ready
        let mut edge = deps.find_by_child(&child.id).await.unwrap().remove(0);
        edge.satisfied = true;
        deps.save(&edge).await.unwrap();

        let ready = store.find_ready_to_execute(Utc::now()).await.unwrap();
        assert!(ready.iter().any(|j| j.id == child.id));
    }

    #[tokio::test]
    async fn test_worker_store_heartbeat_query() {
        let store = InMemoryWorkerStore::new();

        let mut fresh = Worker::new("fresh", "fresh", "h");
        fresh.last_heartbeat = Some(Utc::now());
        store.save(&fresh).await.unwrap();

        let mut stale = Worker::new("stale", "stale", "h");
        stale.last_heartbeat = Some(Utc::now() - chrono::Duration::hours(1));
        store.save(&stale).await.unwrap();

        let silent = Worker::new("silent", "silent", "h");
        store.save(&silent).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::minutes(5);
        let stale_ids: Vec<WorkerId> = store
            .find_by_last_heartbeat_before(cutoff)
            .await
            .unwrap()
            .into_iter()
            .map(|w| w.id)
            .collect();

        assert!(stale_ids.contains(&"stale".to_string()));
        assert!(stale_ids.contains(&"silent".to_string()));
        assert!(!stale_ids.contains(&"fresh".to_string()));
    }

    #[tokio::test]
    async fn test_dependency_store_counts() {
        let store = InMemoryDependencyStore::new();
        let child = JobId::new_v4();
        let p1 = JobId::new_v4();
        let p2 = JobId::new_v4();

        store
            .save(&JobDependency::new(child, p1, DependencyKind::MustComplete))
            .await
            .unwrap();
        store
            .save(&JobDependency::new(child, p2, DependencyKind::MustSucceed))
            .await
            .unwrap();

        assert_eq!(store.count_unsatisfied(&child).await.unwrap(), 2);
        assert_eq!(store.find_by_child(&child).await.unwrap().len(), 2);
        assert_eq!(store.find_by_parent(&p1).await.unwrap().len(), 1);

        assert!(store.delete(&child, &p1).await.unwrap());
        assert_eq!(store.count_unsatisfied(&child).await.unwrap(), 1);
    }
}
