//! Shared state-transition flows
//!
//! The dispatcher owns the compound transitions that touch several
//! components at once: admitting ready jobs to the queue, committing an
//! assignment, and cascading a terminal outcome through the dependency
//! graph. Components acquire their internal sections in the fixed order
//! WorkerRegistry -> PriorityQueue -> DependencyGraph, each held briefly.

use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::DependencyConfig;
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::graph::DependencyGraph;
use crate::models::{Job, JobId, JobStatus, WorkerId};
use crate::queue::PriorityQueue;
use crate::registry::WorkerRegistry;
use crate::repository::{DependencyStore, JobStore};

/// Compound transition driver shared by the balancer, the failure
/// controller, and the scheduler facade
pub struct Dispatcher {
    dependency_config: DependencyConfig,
    jobs: Arc<dyn JobStore>,
    dependencies: Arc<dyn DependencyStore>,
    registry: Arc<WorkerRegistry>,
    queue: Arc<PriorityQueue>,
    graph: Arc<DependencyGraph>,
    events: EventBus,
}

impl Dispatcher {
    pub fn new(
        dependency_config: DependencyConfig,
        jobs: Arc<dyn JobStore>,
        dependencies: Arc<dyn DependencyStore>,
        registry: Arc<WorkerRegistry>,
        queue: Arc<PriorityQueue>,
        graph: Arc<DependencyGraph>,
        events: EventBus,
    ) -> Self {
        Self {
            dependency_config,
            jobs,
            dependencies,
            registry,
            queue,
            graph,
            events,
        }
    }

    /// Persist a job, mirror its status into the graph, and notify
    /// observers of the change.
    pub async fn save_with_status(&self, job: &Job, previous: JobStatus) -> Result<()> {
        self.jobs.save(job).await?;
        self.graph.set_node_status(&job.id, job.status).await;
        if previous != job.status {
            self.events.job_status_changed(job.id, previous, job.status);
        }
        Ok(())
    }

    /// Move a PENDING job whose prerequisites are satisfied into the
    /// ready queue. Jobs in any other state are left alone.
    pub async fn schedule_job(&self, job_id: &JobId) -> Result<bool> {
        let Some(mut job) = self.jobs.find(job_id).await? else {
            return Ok(false);
        };
        if job.status != JobStatus::Pending {
            return Ok(false);
        }

        let previous = job.status;
        if job.mark_scheduled().is_err() {
            return Ok(false);
        }

        if let Err(e) = self.queue.enqueue(&job).await {
            // Band full: stay PENDING and let a later drain pass admit it
            warn!("ready job could not be queued: id={}, error={}", job.id, e);
            return Ok(false);
        }

        self.save_with_status(&job, previous).await?;
        debug!("job admitted to ready queue: id={}, band={}", job.id, job.band());
        Ok(true)
    }

    /// Admit every PENDING job whose edges are satisfied and whose
    /// deferral (if any) has elapsed. Returns the number admitted.
    pub async fn admit_ready(&self) -> Result<usize> {
        let ready = self.graph.jobs_ready().await;
        let now = chrono::Utc::now();
        let mut admitted = 0;

        for job_id in ready {
            let Some(job) = self.jobs.find(&job_id).await? else {
                continue;
            };
            if let Some(at) = job.scheduled_at {
                if at > now {
                    continue;
                }
            }
            if self.schedule_job(&job_id).await? {
                admitted += 1;
            }
        }

        Ok(admitted)
    }

    /// Commit an assignment picked by the policy: bind the job to the
    /// worker, transition it to RUNNING, and release MUST_START children.
    pub async fn assign_job(&self, job_id: &JobId, worker_id: &WorkerId) -> Result<()> {
        let Some(mut job) = self.jobs.find(job_id).await? else {
            return Err(Error::not_found(format!("job {}", job_id)));
        };
        if !job.status.is_schedulable() {
            return Err(Error::validation(format!(
                "job {} is {} and cannot be assigned",
                job_id, job.status
            )));
        }

        // Registry first: capacity is enforced at commit, so a stale
        // snapshot pick fails here instead of oversubscribing.
        self.registry.try_assign(worker_id, *job_id).await?;

        let previous = job.status;
        if let Err(e) = job.mark_running(worker_id.clone()) {
            // Roll the registry binding back; the job never started
            let _ = self.registry.unassign(worker_id, job_id, None).await;
            return Err(Error::validation(e.to_string()));
        }
        self.save_with_status(&job, previous).await?;

        info!("job running: id={}, worker={}, priority={}", job_id, worker_id, job.priority);

        // MUST_START edges resolve as soon as the parent is running
        let change = self.graph.on_job_started(job_id).await;
        self.persist_edge_satisfaction(job_id, JobStatus::Running).await;
        for child in change.ready {
            self.schedule_job(&child).await?;
        }

        Ok(())
    }

    /// Cascade a terminal outcome through the graph: satisfied edges
    /// release children into the queue; permanently blocked children are
    /// cancelled, and their own dependents see that cancellation.
    pub async fn propagate_terminal(&self, job_id: JobId, status: JobStatus) -> Result<()> {
        let mut work: VecDeque<(JobId, JobStatus)> = VecDeque::new();
        work.push_back((job_id, status));

        while let Some((id, terminal)) = work.pop_front() {
            let change = self.graph.on_job_completed(&id, terminal).await;
            self.persist_edge_satisfaction(&id, terminal).await;

            for child in change.ready {
                self.schedule_job(&child).await?;
            }

            for child in change.blocked {
                let Some(mut job) = self.jobs.find(&child).await? else {
                    continue;
                };
                if job.status.is_terminal() {
                    continue;
                }

                let previous = job.status;
                self.queue.remove_job(&child).await;
                if job.mark_cancelled("Prerequisite failed").is_err() {
                    continue;
                }
                self.save_with_status(&job, previous).await?;

                info!("job cancelled, prerequisite failed: id={}, parent={}", child, id);
                work.push_back((child, JobStatus::Cancelled));
            }
        }

        Ok(())
    }

    /// Mirror the graph's edge satisfaction into the edge store
    async fn persist_edge_satisfaction(&self, parent: &JobId, status: JobStatus) {
        let edges = match self.dependencies.find_by_parent(parent).await {
            Ok(edges) => edges,
            Err(e) => {
                warn!("edge lookup failed during propagation: parent={}, error={}", parent, e);
                return;
            }
        };

        for mut edge in edges {
            if !edge.satisfied
                && edge.is_satisfied_by(status, self.dependency_config.conditional_propagation)
            {
                edge.satisfied = true;
                if let Err(e) = self.dependencies.save(&edge).await {
                    warn!(
                        "edge satisfaction write failed: child={}, parent={}, error={}",
                        edge.child, edge.parent, e
                    );
                }
            }
        }
    }
}
