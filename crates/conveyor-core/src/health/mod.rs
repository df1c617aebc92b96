//! Worker health monitoring
//!
//! Periodically folds four sub-checks into a per-worker health state,
//! drives auto-recovery, flags persistently failing workers, and retires
//! them after the cleanup threshold. Check #4 doubles as the per-job
//! timeout escalation point.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::HealthConfig;
use crate::error::Result;
use crate::events::{EventBus, SchedulerEvent};
use crate::failure::FailureController;
use crate::models::{JobId, JobStatus, Worker, WorkerId, WorkerStatus};
use crate::registry::WorkerRegistry;
use crate::repository::JobStore;

/// Aggregate health state for one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// All sub-checks passed
    Healthy,

    /// At least one sub-check failed, below the failure threshold
    Unhealthy,

    /// Was unhealthy, passed a clean check
    Recovered,

    /// Consecutive failures reached the threshold
    Failed,
}

/// Result of one health check pass over one worker
#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    pub worker_id: WorkerId,
    pub state: HealthState,
    pub heartbeat_fresh: bool,
    pub status_consistent: bool,
    pub capacity_consistent: bool,
    pub assignments_consistent: bool,
    pub consecutive_failures: u32,
}

impl HealthCheckResult {
    fn healthy(&self) -> bool {
        self.heartbeat_fresh
            && self.status_consistent
            && self.capacity_consistent
            && self.assignments_consistent
    }
}

#[derive(Debug, Default, Clone)]
struct WorkerHealthTracker {
    consecutive_failures: u32,
}

/// Health monitor
pub struct HealthMonitor {
    config: HealthConfig,
    registry: Arc<WorkerRegistry>,
    jobs: Arc<dyn JobStore>,
    failure: Arc<FailureController>,
    events: EventBus,
    trackers: RwLock<HashMap<WorkerId, WorkerHealthTracker>>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        registry: Arc<WorkerRegistry>,
        jobs: Arc<dyn JobStore>,
        failure: Arc<FailureController>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            registry,
            jobs,
            failure,
            events,
            trackers: RwLock::new(HashMap::new()),
        }
    }

    /// Run one health check pass over every worker. The four sub-checks
    /// decide health regardless of lifecycle status, so drift repair and
    /// timeout escalation also cover workers that are ERROR, INACTIVE,
    /// or in MAINTENANCE.
    pub async fn check_all(&self) -> Result<Vec<HealthCheckResult>> {
        let (_, workers) = self.registry.snapshot().await;
        let mut results = Vec::new();

        for worker in workers {
            let result = self.check_worker(&worker).await?;
            results.push(result);
        }

        Ok(results)
    }

    async fn check_worker(&self, worker: &Worker) -> Result<HealthCheckResult> {
        let now = Utc::now();

        // Truth set: what the job store says this worker owns
        let assigned = self.jobs.find_by_assigned_worker(&worker.id).await?;
        let truth: HashSet<JobId> = assigned
            .iter()
            .filter(|j| matches!(j.status, JobStatus::Scheduled | JobStatus::Running))
            .map(|j| j.id)
            .collect();

        // Check 1: heartbeat freshness
        let heartbeat_fresh = worker.is_heartbeat_fresh(now, self.config.heartbeat_timeout());

        // Check 2: status consistency
        let status_consistent = !(worker.status == WorkerStatus::Error
            || (worker.status == WorkerStatus::Busy && worker.current_job_count == 0)
            || (worker.status == WorkerStatus::Active
                && worker.current_job_count > worker.max_concurrent_jobs));

        // Check 3: capacity consistency
        let capacity_consistent =
            worker.current_job_count + worker.reserved_capacity <= worker.max_concurrent_jobs;

        // Check 4: assignment consistency against the truth set
        let assignments_consistent = worker.assigned_jobs == truth;
        if !assignments_consistent {
            error!(
                "assignment drift detected, reconciling: worker={}, claimed={}, truth={}",
                worker.id,
                worker.assigned_jobs.len(),
                truth.len()
            );
            self.registry
                .reconcile_assignments(&worker.id, truth.clone())
                .await
                .ok();
        }

        // Timed-out jobs escalate to the failure controller
        for job in &assigned {
            if job.has_timed_out(now) {
                warn!(
                    "job timed out: id={}, worker={}, timeout_secs={}",
                    job.id, worker.id, job.timeout_secs
                );
                self.failure.reassign(&job.id, &worker.id, "Timeout").await?;
            }
        }

        let mut result = HealthCheckResult {
            worker_id: worker.id.clone(),
            state: HealthState::Healthy,
            heartbeat_fresh,
            status_consistent,
            capacity_consistent,
            assignments_consistent,
            consecutive_failures: 0,
        };

        result.state = self.fold_state(worker, result.healthy()).await?;
        result.consecutive_failures = self
            .trackers
            .read()
            .await
            .get(&worker.id)
            .map(|t| t.consecutive_failures)
            .unwrap_or(0);

        Ok(result)
    }

    /// Fold a check outcome into the per-worker tracker, firing recovery
    /// and failure side effects.
    async fn fold_state(&self, worker: &Worker, healthy: bool) -> Result<HealthState> {
        let previous_failures = {
            let mut trackers = self.trackers.write().await;
            let tracker = trackers.entry(worker.id.clone()).or_default();
            let previous = tracker.consecutive_failures;
            if healthy {
                tracker.consecutive_failures = 0;
            } else {
                tracker.consecutive_failures += 1;
            }
            previous
        };

        if healthy {
            if previous_failures > 0 {
                info!("worker recovered: id={}", worker.id);
                self.events.publish(SchedulerEvent::WorkerRecovered {
                    worker_id: worker.id.clone(),
                    at: Utc::now(),
                });
                return Ok(HealthState::Recovered);
            }
            return Ok(HealthState::Healthy);
        }

        let failures = previous_failures + 1;
        if failures >= self.config.max_consecutive_failures {
            // A worker already flagged ERROR stays FAILED without
            // re-firing the transition side effects every pass
            if worker.status != WorkerStatus::Error {
                warn!(
                    "worker failed health threshold: id={}, consecutive_failures={}",
                    worker.id, failures
                );
                self.registry
                    .set_worker_status(&worker.id, WorkerStatus::Error)
                    .await
                    .ok();
                self.registry
                    .blacklist(&worker.id, self.config.cleanup_threshold())
                    .await;
                self.events.publish(SchedulerEvent::WorkerFailed {
                    worker_id: worker.id.clone(),
                    consecutive_failures: failures,
                    at: Utc::now(),
                });
                self.failure
                    .handle_worker_failure(&worker.id, "Worker failed")
                    .await?;
            }
            return Ok(HealthState::Failed);
        }

        debug!(
            "worker unhealthy: id={}, consecutive_failures={}/{}",
            worker.id, failures, self.config.max_consecutive_failures
        );
        Ok(HealthState::Unhealthy)
    }

    /// Retire ERROR workers older than the cleanup threshold: any stray
    /// jobs go back to the failure controller and the worker turns
    /// INACTIVE. Returns the number of workers retired.
    pub async fn cleanup(&self) -> Result<usize> {
        let (_, workers) = self.registry.snapshot().await;
        let now = Utc::now();
        let threshold = chrono::Duration::from_std(self.config.cleanup_threshold())
            .unwrap_or_else(|_| chrono::Duration::minutes(15));
        let mut retired = 0;

        for worker in workers {
            if worker.status != WorkerStatus::Error {
                continue;
            }
            if now - worker.status_changed_at < threshold {
                continue;
            }

            // Failure handling at FAILED time normally clears these, but a
            // crashed pass may have left strays behind
            let strays = self
                .failure
                .handle_worker_failure(&worker.id, "Worker failed")
                .await?;
            if strays > 0 {
                warn!("cleanup recovered stray jobs: worker={}, jobs={}", worker.id, strays);
            }

            self.registry
                .set_worker_status(&worker.id, WorkerStatus::Inactive)
                .await
                .ok();
            self.trackers.write().await.remove(&worker.id);

            info!("error worker retired: id={}", worker.id);
            retired += 1;
        }

        Ok(retired)
    }
}
