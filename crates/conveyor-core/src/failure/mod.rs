//! Failure recovery: bounded retries and worker-death reassignment
//!
//! Invoked by the health monitor when a worker is declared failed, by the
//! scheduler facade when a worker reports a failed outcome, and by the
//! timeout escalation path.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::events::{EventBus, SchedulerEvent};
use crate::models::{JobId, JobStatus, WorkerId};
use crate::registry::WorkerRegistry;
use crate::repository::JobStore;

/// What `reassign` did with the job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassignOutcome {
    /// Job re-admitted to the queue with one more retry consumed
    Requeued,

    /// Retry budget exhausted; job is terminally FAILED
    Exhausted,

    /// Job missing or already resolved; nothing to do
    Skipped,
}

/// Failure controller
pub struct FailureController {
    jobs: Arc<dyn JobStore>,
    registry: Arc<WorkerRegistry>,
    dispatcher: Arc<Dispatcher>,
    events: EventBus,
}

impl FailureController {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        registry: Arc<WorkerRegistry>,
        dispatcher: Arc<Dispatcher>,
        events: EventBus,
    ) -> Self {
        Self {
            jobs,
            registry,
            dispatcher,
            events,
        }
    }

    /// Recover a job whose worker failed, timed out, or reported failure.
    ///
    /// Consumes one retry and re-admits the job as PENDING, or drives it
    /// terminally FAILED once the budget is spent. Jobs already resolved
    /// (COMPLETED or CANCELLED) are left alone.
    pub async fn reassign(
        &self,
        job_id: &JobId,
        failed_worker_id: &WorkerId,
        reason: &str,
    ) -> Result<ReassignOutcome> {
        let Some(mut job) = self.jobs.find(job_id).await? else {
            debug!("reassign skipped, job missing: id={}", job_id);
            return Ok(ReassignOutcome::Skipped);
        };

        if job.status.is_terminal() && job.status != JobStatus::Failed {
            debug!("reassign skipped, job already {}: id={}", job.status, job_id);
            return Ok(ReassignOutcome::Skipped);
        }

        // Strip the binding from the failed worker either way. Idempotent
        // when the caller already unassigned.
        let _ = self
            .registry
            .unassign(failed_worker_id, job_id, Some(false))
            .await;

        if !job.can_retry() {
            let message = format!("Max retry attempts exceeded: {}", reason);
            let previous = job.status;
            if job.status == JobStatus::Failed {
                job.error_message = Some(message);
            } else if job.mark_failed(message).is_err() {
                return Ok(ReassignOutcome::Skipped);
            }
            job.clear_assignment();
            self.dispatcher.save_with_status(&job, previous).await?;

            error!(
                "job failed terminally: id={}, worker={}, retries={}, reason={}",
                job_id, failed_worker_id, job.retry_count, reason
            );
            self.dispatcher
                .propagate_terminal(*job_id, JobStatus::Failed)
                .await?;
            return Ok(ReassignOutcome::Exhausted);
        }

        let previous = job.status;
        if job.begin_retry().is_err() {
            return Ok(ReassignOutcome::Skipped);
        }
        self.dispatcher.save_with_status(&job, previous).await?;
        self.dispatcher.schedule_job(job_id).await?;

        info!(
            "job reassigned: id={}, from_worker={}, retry={}/{}, reason={}",
            job_id, failed_worker_id, job.retry_count, job.max_retries, reason
        );
        self.events.publish(SchedulerEvent::JobReassigned {
            job_id: *job_id,
            from_worker: failed_worker_id.clone(),
            reason: reason.to_string(),
            retry_count: job.retry_count,
            at: Utc::now(),
        });

        Ok(ReassignOutcome::Requeued)
    }

    /// A worker died: recover every job bound to it.
    pub async fn handle_worker_failure(&self, worker_id: &WorkerId, reason: &str) -> Result<usize> {
        let assigned = self.jobs.find_by_assigned_worker(worker_id).await?;
        let mut recovered = 0;

        for job in assigned {
            if !matches!(job.status, JobStatus::Scheduled | JobStatus::Running) {
                continue;
            }
            self.reassign(&job.id, worker_id, reason).await?;
            recovered += 1;
        }

        if recovered > 0 {
            info!(
                "worker failure handled: worker={}, jobs_recovered={}, reason={}",
                worker_id, recovered, reason
            );
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::SchedulerConfig;
    use crate::graph::DependencyGraph;
    use crate::models::{Job, RegisterWorker};
    use crate::queue::PriorityQueue;
    use crate::repository::Stores;

    struct Fixture {
        stores: Stores,
        registry: Arc<WorkerRegistry>,
        queue: Arc<PriorityQueue>,
        graph: Arc<DependencyGraph>,
        dispatcher: Arc<Dispatcher>,
        controller: FailureController,
    }

    fn fixture() -> Fixture {
        let config = SchedulerConfig::default();
        let stores = Stores::in_memory();
        let events = EventBus::new();
        let registry = Arc::new(WorkerRegistry::new(
            config.registration.clone(),
            config.limits.clone(),
            stores.workers.clone(),
            Arc::new(MemoryCache::new()),
            events.clone(),
        ));
        let queue = Arc::new(PriorityQueue::new(config.queues.clone()));
        let graph = Arc::new(DependencyGraph::new(config.dependencies.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            config.dependencies.clone(),
            stores.jobs.clone(),
            stores.dependencies.clone(),
            registry.clone(),
            queue.clone(),
            graph.clone(),
            events.clone(),
        ));
        let controller = FailureController::new(
            stores.jobs.clone(),
            registry.clone(),
            dispatcher.clone(),
            events,
        );

        Fixture {
            stores,
            registry,
            queue,
            graph,
            dispatcher,
            controller,
        }
    }

    async fn running_job(f: &Fixture, worker: &str, max_retries: u32) -> JobId {
        f.registry
            .register(RegisterWorker {
                worker_id: worker.to_string(),
                name: worker.to_string(),
                host: "h".to_string(),
                port: None,
                max_concurrent_jobs: 4,
                reserved_capacity: 0,
                tags: vec![],
                capabilities: None,
                version: None,
                priority_threshold: 0,
                load_factor: 1.0,
            })
            .await
            .unwrap();

        let job = Job::new("j", "t", serde_json::json!({})).with_max_retries(max_retries);
        f.stores.jobs.save(&job).await.unwrap();
        f.graph.add_node(job.id, job.priority).await;
        f.dispatcher.schedule_job(&job.id).await.unwrap();
        f.queue.remove_job(&job.id).await; // drained by the test itself
        f.dispatcher
            .assign_job(&job.id, &worker.to_string())
            .await
            .unwrap();
        job.id
    }

    #[tokio::test]
    async fn test_reassign_requeues_with_retry_budget() {
        let f = fixture();
        let job_id = running_job(&f, "w-1", 2).await;

        let outcome = f
            .controller
            .reassign(&job_id, &"w-1".to_string(), "Worker failed")
            .await
            .unwrap();
        assert_eq!(outcome, ReassignOutcome::Requeued);

        let job = f.stores.jobs.find(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Scheduled);
        assert_eq!(job.retry_count, 1);
        assert!(job.assigned_worker_id.is_none());
        assert!(job.started_at.is_none());

        // Back in the queue, off the worker
        assert_eq!(f.queue.total_size().await, 1);
        let worker = f.registry.get(&"w-1".to_string()).await.unwrap();
        assert_eq!(worker.current_job_count, 0);
        assert_eq!(worker.total_failed, 1);
    }

    #[tokio::test]
    async fn test_reassign_exhausts_budget_with_composed_error() {
        let f = fixture();
        let job_id = running_job(&f, "w-1", 0).await;

        let outcome = f
            .controller
            .reassign(&job_id, &"w-1".to_string(), "Timeout")
            .await
            .unwrap();
        assert_eq!(outcome, ReassignOutcome::Exhausted);

        let job = f.stores.jobs.find(&job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.error_message.as_deref(),
            Some("Max retry attempts exceeded: Timeout")
        );
        assert_eq!(f.queue.total_size().await, 0);
    }

    #[tokio::test]
    async fn test_reassign_skips_resolved_jobs() {
        let f = fixture();

        let mut job = Job::new("done", "t", serde_json::json!({}));
        job.mark_scheduled().unwrap();
        job.mark_running("w-1".to_string()).unwrap();
        job.mark_completed().unwrap();
        f.stores.jobs.save(&job).await.unwrap();

        let outcome = f
            .controller
            .reassign(&job.id, &"w-1".to_string(), "Worker failed")
            .await
            .unwrap();
        assert_eq!(outcome, ReassignOutcome::Skipped);

        let missing = JobId::new_v4();
        let outcome = f
            .controller
            .reassign(&missing, &"w-1".to_string(), "Worker failed")
            .await
            .unwrap();
        assert_eq!(outcome, ReassignOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_bounded_retries_across_repeated_failures() {
        let f = fixture();
        let job_id = running_job(&f, "w-1", 2).await;
        let worker = "w-1".to_string();

        // First two failures requeue, third exhausts
        for expected in [ReassignOutcome::Requeued, ReassignOutcome::Requeued] {
            let outcome = f
                .controller
                .reassign(&job_id, &worker, "Worker failed")
                .await
                .unwrap();
            assert_eq!(outcome, expected);

            // Simulate the job being placed and the worker dying again
            f.queue.remove_job(&job_id).await;
            f.dispatcher.assign_job(&job_id, &worker).await.unwrap();
        }

        let outcome = f
            .controller
            .reassign(&job_id, &worker, "Worker failed")
            .await
            .unwrap();
        assert_eq!(outcome, ReassignOutcome::Exhausted);

        let job = f.stores.jobs.find(&job_id).await.unwrap().unwrap();
        assert_eq!(job.retry_count, 2);
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_worker_failure_fans_out() {
        let f = fixture();
        let worker = "w-1".to_string();
        let first = running_job(&f, "w-1", 3).await;

        // Second job on the same worker
        let job = Job::new("second", "t", serde_json::json!({}));
        f.stores.jobs.save(&job).await.unwrap();
        f.graph.add_node(job.id, job.priority).await;
        f.dispatcher.schedule_job(&job.id).await.unwrap();
        f.queue.remove_job(&job.id).await;
        f.dispatcher.assign_job(&job.id, &worker).await.unwrap();

        let recovered = f
            .controller
            .handle_worker_failure(&worker, "Worker failed")
            .await
            .unwrap();
        assert_eq!(recovered, 2);

        for id in [first, job.id] {
            let j = f.stores.jobs.find(&id).await.unwrap().unwrap();
            assert_eq!(j.status, JobStatus::Scheduled);
            assert_eq!(j.retry_count, 1);
        }
    }
}
