//! Queue draining and load rebalancing
//!
//! Drain moves ready jobs from the queue to workers through the
//! assignment policy, band by band. Rebalance pulls unconfirmed
//! assignments off overloaded workers and lets the next drain pass place
//! them somewhere better. A job the worker has already reported is never
//! pre-empted.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::assignment::AssignmentPolicy;
use crate::config::LoadBalancingConfig;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::events::{EventBus, SchedulerEvent};
use crate::models::{Job, JobStatus, PriorityBand, Worker, WorkerId};
use crate::queue::PriorityQueue;
use crate::registry::{RegistryError, WorkerRegistry};
use crate::repository::JobStore;

/// Stale-snapshot commit retries per queue entry
const ASSIGN_COMMIT_RETRIES: usize = 3;

/// Outcome of trying to place one queue entry
enum Placement {
    Assigned(WorkerId),
    NoWorker,
    Dropped,
}

/// Summary of one drain pass
#[derive(Debug, Default, Clone, Copy)]
pub struct DrainSummary {
    /// Pending jobs admitted to the queue this pass
    pub admitted: usize,

    /// Jobs handed to workers
    pub assigned: usize,

    /// Jobs re-queued because no worker was eligible
    pub requeued: usize,
}

/// Balancing metrics
#[derive(Debug, Default, Clone)]
pub struct BalancerMetrics {
    /// Jobs successfully handed to workers
    pub success_count: u64,

    /// Placement attempts that found no eligible worker
    pub failure_count: u64,

    /// Jobs moved off overloaded workers
    pub total_rebalanced: u64,

    /// Successful placements per strategy
    pub per_strategy: HashMap<String, u64>,

    /// Moving average drain latency in milliseconds
    pub avg_latency_ms: f64,
}

impl BalancerMetrics {
    fn record_placement(&mut self, strategy: &str, assigned: bool) {
        if assigned {
            self.success_count += 1;
            *self.per_strategy.entry(strategy.to_string()).or_default() += 1;
        } else {
            self.failure_count += 1;
        }
    }

    fn record_latency(&mut self, elapsed_ms: f64) {
        if self.avg_latency_ms == 0.0 {
            self.avg_latency_ms = elapsed_ms;
        } else {
            self.avg_latency_ms = 0.8 * self.avg_latency_ms + 0.2 * elapsed_ms;
        }
    }
}

/// Load balancer
pub struct LoadBalancer {
    config: LoadBalancingConfig,
    policy: AssignmentPolicy,
    registry: Arc<WorkerRegistry>,
    queue: Arc<PriorityQueue>,
    jobs: Arc<dyn JobStore>,
    dispatcher: Arc<Dispatcher>,
    events: EventBus,
    metrics: Mutex<BalancerMetrics>,
}

impl LoadBalancer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: LoadBalancingConfig,
        policy: AssignmentPolicy,
        registry: Arc<WorkerRegistry>,
        queue: Arc<PriorityQueue>,
        jobs: Arc<dyn JobStore>,
        dispatcher: Arc<Dispatcher>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            policy,
            registry,
            queue,
            jobs,
            dispatcher,
            events,
            metrics: Mutex::new(BalancerMetrics::default()),
        }
    }

    /// Snapshot of the balancing metrics
    pub async fn metrics(&self) -> BalancerMetrics {
        self.metrics.lock().await.clone()
    }

    /// One drain pass: admit newly-ready jobs, then serve HIGH to empty,
    /// then NORMAL, then LOW only while some worker still has slack.
    pub async fn drain_once(&self) -> Result<DrainSummary> {
        let started = Instant::now();
        let mut summary = DrainSummary {
            admitted: self.dispatcher.admit_ready().await?,
            ..Default::default()
        };

        for band in [PriorityBand::High, PriorityBand::Normal] {
            let (assigned, requeued) = self.drain_band(band).await?;
            summary.assigned += assigned;
            summary.requeued += requeued;
        }

        // LOW is served only when capacity is left after NORMAL
        if self.registry.any_worker_with_slack().await {
            let (assigned, requeued) = self.drain_band(PriorityBand::Low).await?;
            summary.assigned += assigned;
            summary.requeued += requeued;
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.metrics.lock().await.record_latency(elapsed_ms);

        if summary.assigned > 0 || summary.admitted > 0 {
            debug!(
                "drain pass: admitted={}, assigned={}, requeued={}",
                summary.admitted, summary.assigned, summary.requeued
            );
        }
        Ok(summary)
    }

    /// Serve one band. Each entry queued at pass start gets one placement
    /// attempt; unplaceable entries go to the tail so they cannot block
    /// the rest of the band.
    async fn drain_band(&self, band: PriorityBand) -> Result<(usize, usize)> {
        let mut assigned = 0;
        let mut requeued = 0;
        let depth = self.queue.size(band).await;

        for _ in 0..depth {
            let Some(entry) = self.queue.pop(band).await else {
                break;
            };

            let Some(job) = self.jobs.find(&entry.job_id).await? else {
                debug!("queued job vanished, dropping entry: id={}", entry.job_id);
                continue;
            };
            if job.status != JobStatus::Scheduled {
                // Cancelled or already placed through another path
                continue;
            }

            match self.place(&job).await? {
                Placement::Assigned(worker_id) => {
                    assigned += 1;
                    self.metrics
                        .lock()
                        .await
                        .record_placement(&self.policy.strategy().to_string(), true);
                    debug!("placed: job={}, worker={}, band={}", job.id, worker_id, band);
                }
                Placement::NoWorker => {
                    requeued += 1;
                    self.metrics
                        .lock()
                        .await
                        .record_placement(&self.policy.strategy().to_string(), false);
                    if let Err(e) = self.queue.enqueue_entry(entry).await {
                        warn!("requeue failed, job stays pending: id={}, error={}", job.id, e);
                    }
                }
                Placement::Dropped => {}
            }
        }

        Ok((assigned, requeued))
    }

    /// Score a snapshot, commit, and retry with a fresh snapshot when the
    /// commit loses a race to a concurrent mutation.
    async fn place(&self, job: &Job) -> Result<Placement> {
        for _ in 0..ASSIGN_COMMIT_RETRIES {
            let (_, workers) = self.registry.snapshot().await;
            let blacklisted = self.blacklisted_of(&workers).await;

            let Some(worker_id) = self.policy.select_worker(job, &workers, &blacklisted) else {
                return Ok(Placement::NoWorker);
            };

            match self.dispatcher.assign_job(&job.id, &worker_id).await {
                Ok(()) => return Ok(Placement::Assigned(worker_id)),
                Err(Error::Registry(
                    RegistryError::NoCapacity(_)
                    | RegistryError::NotSchedulable { .. }
                    | RegistryError::WorkerUnknown(_),
                )) => {
                    // Snapshot went stale under us; take a fresh one
                    continue;
                }
                Err(e) => {
                    warn!("placement dropped: job={}, error={}", job.id, e);
                    return Ok(Placement::Dropped);
                }
            }
        }
        Ok(Placement::NoWorker)
    }

    async fn blacklisted_of(&self, workers: &[Worker]) -> HashSet<WorkerId> {
        let mut blacklisted = HashSet::new();
        for worker in workers {
            if self.registry.is_blacklisted(&worker.id).await {
                blacklisted.insert(worker.id.clone());
            }
        }
        blacklisted
    }

    /// One rebalance pass. When the load spread between the most and
    /// least loaded schedulable workers exceeds the threshold, pull
    /// unconfirmed assignments off the overloaded worker and re-queue
    /// them. Returns the number of jobs moved.
    pub async fn rebalance_once(&self) -> Result<usize> {
        let (_, workers) = self.registry.snapshot().await;
        let mut candidates: Vec<&Worker> = workers
            .iter()
            .filter(|w| w.status.is_schedulable())
            .collect();
        if candidates.len() < 2 {
            return Ok(0);
        }
        candidates.sort_by(|a, b| a.id.cmp(&b.id));

        let src = candidates
            .iter()
            .max_by(|a, b| a.load_percentage().total_cmp(&b.load_percentage()))
            .copied()
            .ok_or_else(|| Error::invariant("rebalance candidates vanished"))?;
        let dst = candidates
            .iter()
            .min_by(|a, b| a.load_percentage().total_cmp(&b.load_percentage()))
            .copied()
            .ok_or_else(|| Error::invariant("rebalance candidates vanished"))?;

        let spread = src.load_percentage() - dst.load_percentage();
        if spread <= self.config.imbalance_threshold {
            return Ok(0);
        }

        // Movable: assigned, but the worker has not reported the job yet
        // (no heartbeat since it started). Confirmed RUNNING work stays.
        let assigned = self.jobs.find_by_assigned_worker(&src.id).await?;
        let movable: Vec<Job> = assigned
            .into_iter()
            .filter(|j| j.status == JobStatus::Running)
            .filter(|j| match (src.last_heartbeat, j.started_at) {
                (Some(hb), Some(started)) => hb < started,
                (None, _) => true,
                _ => false,
            })
            .collect();

        if movable.is_empty() {
            return Ok(0);
        }

        let mut moved = 0;
        let mut projected = src.current_job_count;
        for mut job in movable {
            let projected_load = if src.max_concurrent_jobs == 0 {
                0.0
            } else {
                (projected.saturating_sub(1)) as f64 / src.max_concurrent_jobs as f64
            };
            if projected_load - dst.load_percentage() <= self.config.imbalance_threshold
                && moved > 0
            {
                break;
            }

            let previous = job.status;
            self.registry.unassign(&src.id, &job.id, None).await?;
            if job.revert_to_scheduled().is_err() {
                continue;
            }
            self.dispatcher.save_with_status(&job, previous).await?;
            if let Err(e) = self.queue.enqueue(&job).await {
                warn!("rebalanced job could not be queued: id={}, error={}", job.id, e);
            }

            moved += 1;
            projected = projected.saturating_sub(1);
        }

        if moved > 0 {
            self.metrics.lock().await.total_rebalanced += moved as u64;
            info!(
                "rebalanced: from={}, toward={}, moved={}, spread={:.2}",
                src.id, dst.id, moved, spread
            );
            self.events.publish(SchedulerEvent::JobsRebalanced {
                from_worker: src.id.clone(),
                to_worker: dst.id.clone(),
                moved,
                at: Utc::now(),
            });
        }

        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::Strategy;
    use crate::cache::MemoryCache;
    use crate::config::SchedulerConfig;
    use crate::graph::DependencyGraph;
    use crate::models::{JobId, RegisterWorker, WorkerHeartbeat};
    use crate::repository::Stores;

    struct Fixture {
        stores: Stores,
        registry: Arc<WorkerRegistry>,
        queue: Arc<PriorityQueue>,
        graph: Arc<DependencyGraph>,
        balancer: LoadBalancer,
    }

    fn fixture(strategy: Strategy) -> Fixture {
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
        let balancer = LoadBalancer::new(
            config.load_balancing.clone(),
            AssignmentPolicy::new(strategy),
            registry.clone(),
            queue.clone(),
            stores.jobs.clone(),
            dispatcher,
            events,
        );

        Fixture {
            stores,
            registry,
            queue,
            graph,
            balancer,
        }
    }

    async fn register(f: &Fixture, id: &str, max: u32) {
        f.registry
            .register(RegisterWorker {
                worker_id: id.to_string(),
                name: id.to_string(),
                host: "h".to_string(),
                port: None,
                max_concurrent_jobs: max,
                reserved_capacity: 0,
                tags: vec![],
                capabilities: None,
                version: None,
                priority_threshold: 0,
                load_factor: 1.0,
            })
            .await
            .unwrap();
    }

    async fn submit(f: &Fixture, priority: u32) -> JobId {
        let job = Job::new("j", "t", serde_json::json!({})).with_priority(priority);
        f.stores.jobs.save(&job).await.unwrap();
        f.graph.add_node(job.id, job.priority).await;
        job.id
    }

    async fn status_of(f: &Fixture, id: &JobId) -> JobStatus {
        f.stores.jobs.find(id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_drain_admits_and_assigns() {
        let f = fixture(Strategy::RoundRobin);
        register(&f, "w-1", 2).await;
        let job_id = submit(&f, 200).await;

        let summary = f.balancer.drain_once().await.unwrap();
        assert_eq!(summary.admitted, 1);
        assert_eq!(summary.assigned, 1);
        assert_eq!(summary.requeued, 0);

        assert_eq!(status_of(&f, &job_id).await, JobStatus::Running);
        let metrics = f.balancer.metrics().await;
        assert_eq!(metrics.success_count, 1);
        assert_eq!(metrics.per_strategy.get("round_robin"), Some(&1));
        assert!(metrics.avg_latency_ms >= 0.0);
    }

    #[tokio::test]
    async fn test_high_band_served_before_normal() {
        let f = fixture(Strategy::RoundRobin);
        register(&f, "w-1", 1).await; // room for exactly one job

        let normal = submit(&f, 200).await;
        let high = submit(&f, 800).await;

        let summary = f.balancer.drain_once().await.unwrap();
        assert_eq!(summary.assigned, 1);

        // The elevated job took the only slot
        assert_eq!(status_of(&f, &high).await, JobStatus::Running);
        assert_eq!(status_of(&f, &normal).await, JobStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_low_band_gated_on_slack() {
        let f = fixture(Strategy::RoundRobin);
        register(&f, "w-1", 1).await;

        let normal = submit(&f, 200).await;
        let low = submit(&f, 10).await;

        // The NORMAL job exhausts the only worker, so LOW is not served
        f.balancer.drain_once().await.unwrap();
        assert_eq!(status_of(&f, &normal).await, JobStatus::Running);
        assert_eq!(status_of(&f, &low).await, JobStatus::Scheduled);
        assert_eq!(f.queue.size(PriorityBand::Low).await, 1);

        // Capacity frees up: the next pass serves LOW
        f.registry
            .unassign(&"w-1".to_string(), &normal, Some(true))
            .await
            .unwrap();
        let mut done = f.stores.jobs.find(&normal).await.unwrap().unwrap();
        done.mark_completed().unwrap();
        f.stores.jobs.save(&done).await.unwrap();

        f.balancer.drain_once().await.unwrap();
        assert_eq!(status_of(&f, &low).await, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_unplaceable_job_requeues_at_tail() {
        let f = fixture(Strategy::RoundRobin);
        // No workers at all
        let job_id = submit(&f, 200).await;

        let summary = f.balancer.drain_once().await.unwrap();
        assert_eq!(summary.assigned, 0);
        assert_eq!(summary.requeued, 1);
        assert_eq!(status_of(&f, &job_id).await, JobStatus::Scheduled);
        assert_eq!(f.queue.size(PriorityBand::Normal).await, 1);
        assert_eq!(f.balancer.metrics().await.failure_count, 1);
    }

    #[tokio::test]
    async fn test_one_blocked_job_does_not_starve_band() {
        let f = fixture(Strategy::RoundRobin);
        register(&f, "w-1", 5).await;

        // First job needs a capability nobody has; second is plain
        let picky = Job::new("picky", "t", serde_json::json!({}))
            .with_priority(200)
            .with_required_capabilities("quantum");
        f.stores.jobs.save(&picky).await.unwrap();
        f.graph.add_node(picky.id, picky.priority).await;

        let plain = submit(&f, 200).await;

        let summary = f.balancer.drain_once().await.unwrap();
        assert_eq!(summary.assigned, 1);
        assert_eq!(summary.requeued, 1);
        assert_eq!(status_of(&f, &plain).await, JobStatus::Running);
        assert_eq!(status_of(&f, &picky.id).await, JobStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_cancelled_entries_are_skipped() {
        let f = fixture(Strategy::RoundRobin);
        let job_id = submit(&f, 200).await;

        // No workers yet: the job is admitted but stays queued
        f.balancer.drain_once().await.unwrap();
        assert_eq!(f.queue.total_size().await, 1);

        // Cancel behind the queue's back, then give the balancer a worker
        let mut job = f.stores.jobs.find(&job_id).await.unwrap().unwrap();
        job.mark_cancelled("caller cancelled").unwrap();
        f.stores.jobs.save(&job).await.unwrap();
        register(&f, "w-1", 2).await;

        let summary = f.balancer.drain_once().await.unwrap();
        assert_eq!(summary.assigned, 0);
        assert_eq!(f.queue.total_size().await, 0);
    }

    #[tokio::test]
    async fn test_rebalance_moves_unconfirmed_jobs() {
        let f = fixture(Strategy::RoundRobin);
        register(&f, "w-big", 4).await;
        register(&f, "w-idle", 4).await;

        // Stack three jobs on w-big directly
        let mut job_ids = Vec::new();
        for _ in 0..3 {
            let id = submit(&f, 200).await;
            let mut job = f.stores.jobs.find(&id).await.unwrap().unwrap();
            job.mark_scheduled().unwrap();
            f.stores.jobs.save(&job).await.unwrap();
            f.registry.try_assign(&"w-big".to_string(), id).await.unwrap();
            let mut job = f.stores.jobs.find(&id).await.unwrap().unwrap();
            job.mark_running("w-big".to_string()).unwrap();
            f.stores.jobs.save(&job).await.unwrap();
            job_ids.push(id);
        }

        // w-big has not heartbeaten since the jobs started, so they are
        // unconfirmed and movable. Spread is 0.75 - 0.0 > 0.4.
        let moved = f.balancer.rebalance_once().await.unwrap();
        assert!(moved >= 1);
        assert_eq!(f.queue.total_size().await, moved);
        assert_eq!(f.balancer.metrics().await.total_rebalanced, moved as u64);

        let w = f.registry.get(&"w-big".to_string()).await.unwrap();
        assert_eq!(w.current_job_count as usize, 3 - moved);
    }

    #[tokio::test]
    async fn test_rebalance_never_moves_confirmed_jobs() {
        let f = fixture(Strategy::RoundRobin);
        register(&f, "w-big", 4).await;
        register(&f, "w-idle", 4).await;

        for _ in 0..3 {
            let id = submit(&f, 200).await;
            let mut job = f.stores.jobs.find(&id).await.unwrap().unwrap();
            job.mark_scheduled().unwrap();
            f.stores.jobs.save(&job).await.unwrap();
            f.registry.try_assign(&"w-big".to_string(), id).await.unwrap();
            let mut job = f.stores.jobs.find(&id).await.unwrap().unwrap();
            job.mark_running("w-big".to_string()).unwrap();
            f.stores.jobs.save(&job).await.unwrap();
        }

        // The worker reports in after the jobs started: all confirmed
        f.registry
            .heartbeat(&"w-big".to_string(), WorkerHeartbeat::default())
            .await
            .unwrap();

        assert_eq!(f.balancer.rebalance_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rebalance_noop_under_threshold() {
        let f = fixture(Strategy::RoundRobin);
        register(&f, "w-1", 4).await;
        register(&f, "w-2", 4).await;

        let id = submit(&f, 200).await;
        let mut job = f.stores.jobs.find(&id).await.unwrap().unwrap();
        job.mark_scheduled().unwrap();
        f.stores.jobs.save(&job).await.unwrap();
        f.registry.try_assign(&"w-1".to_string(), id).await.unwrap();

        // Spread 0.25 is under the 0.4 threshold
        assert_eq!(f.balancer.rebalance_once().await.unwrap(), 0);
    }
}
