//! Scheduler facade
//!
//! Composes the graph, queue, registry, health monitor, assignment
//! policy, balancer, and failure controller, and exposes the submit /
//! cancel / report / worker API. All components are built here and
//! passed around as explicit collaborators; there is no global state.

pub mod tasks;

pub use tasks::{task_table, PeriodicTask, TaskKind};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::assignment::AssignmentPolicy;
use crate::balancer::{BalancerMetrics, LoadBalancer};
use crate::cache::{CacheStore, MemoryCache};
use crate::config::SchedulerConfig;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::events::{EventBus, SchedulerEvent};
use crate::failure::FailureController;
use crate::graph::DependencyGraph;
use crate::health::HealthMonitor;
use crate::models::{
    DependencyKind, Job, JobDependency, JobId, JobOutcome, JobStatus, RegisterWorker, Worker,
    WorkerHeartbeat, WorkerId, PRIORITY_LOW, PRIORITY_MAX,
};
use crate::queue::{PriorityQueue, QueueStats};
use crate::registry::{RegistryStats, WorkerRegistry};
use crate::repository::{with_retries, Stores};

/// One declared dependency in a submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencySpec {
    pub parent: JobId,

    #[serde(default = "default_dependency_kind")]
    pub kind: DependencyKind,
}

fn default_dependency_kind() -> DependencyKind {
    DependencyKind::MustComplete
}

impl DependencySpec {
    pub fn new(parent: JobId) -> Self {
        Self {
            parent,
            kind: DependencyKind::MustComplete,
        }
    }

    pub fn with_kind(mut self, kind: DependencyKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Job submission request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJob {
    pub name: String,
    pub job_type: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default = "default_params")]
    pub params: serde_json::Value,

    #[serde(default = "default_priority")]
    pub priority: u32,

    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,

    #[serde(default)]
    pub max_retries: Option<u32>,

    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub required_capabilities: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub estimated_duration_secs: Option<u64>,
}

fn default_params() -> serde_json::Value {
    serde_json::Value::Null
}

fn default_priority() -> u32 {
    crate::models::PRIORITY_MEDIUM
}

impl SubmitJob {
    pub fn new(name: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            job_type: job_type.into(),
            description: None,
            params: serde_json::Value::Null,
            priority: crate::models::PRIORITY_MEDIUM,
            dependencies: vec![],
            max_retries: None,
            timeout_secs: None,
            required_capabilities: None,
            tags: vec![],
            scheduled_at: None,
            estimated_duration_secs: None,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<DependencySpec>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    pub fn with_required_capabilities(mut self, caps: impl Into<String>) -> Self {
        self.required_capabilities = Some(caps.into());
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

/// Point-in-time engine statistics
#[derive(Debug, Clone)]
pub struct SchedulerStats {
    pub queue: QueueStats,
    pub workers: RegistryStats,
    pub graph_nodes: usize,
    pub graph_edges: usize,
    pub balancing: BalancerMetrics,
}

/// The core scheduling engine
pub struct SchedulerCore {
    config: SchedulerConfig,
    stores: Stores,
    events: EventBus,
    registry: Arc<WorkerRegistry>,
    queue: Arc<PriorityQueue>,
    graph: Arc<DependencyGraph>,
    dispatcher: Arc<Dispatcher>,
    failure: Arc<FailureController>,
    health: Arc<HealthMonitor>,
    balancer: Arc<LoadBalancer>,
    shutdown: watch::Sender<bool>,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl SchedulerCore {
    /// Build the engine against the given stores and cache.
    pub fn new(
        config: SchedulerConfig,
        stores: Stores,
        cache: Arc<dyn CacheStore>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let events = EventBus::new();
        let registry = Arc::new(WorkerRegistry::new(
            config.registration.clone(),
            config.limits.clone(),
            stores.workers.clone(),
            cache,
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
        let failure = Arc::new(FailureController::new(
            stores.jobs.clone(),
            registry.clone(),
            dispatcher.clone(),
            events.clone(),
        ));
        let health = Arc::new(HealthMonitor::new(
            config.health.clone(),
            registry.clone(),
            stores.jobs.clone(),
            failure.clone(),
            events.clone(),
        ));
        let balancer = Arc::new(LoadBalancer::new(
            config.load_balancing.clone(),
            AssignmentPolicy::new(config.assignment.strategy),
            registry.clone(),
            queue.clone(),
            stores.jobs.clone(),
            dispatcher.clone(),
            events.clone(),
        ));

        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            stores,
            events,
            registry,
            queue,
            graph,
            dispatcher,
            failure,
            health,
            balancer,
            shutdown,
            task_handles: Mutex::new(Vec::new()),
        }))
    }

    /// Engine with in-memory stores and cache, for tests and local runs
    pub fn in_memory(config: SchedulerConfig) -> Result<Arc<Self>> {
        Self::new(config, Stores::in_memory(), Arc::new(MemoryCache::new()))
    }

    /// Subscribe to structured engine events
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Submit a job with its declared dependencies. The job is persisted
    /// PENDING; when every edge is already satisfied and no deferral is
    /// set, it enters the ready queue immediately.
    pub async fn submit_job(&self, req: SubmitJob) -> Result<JobId> {
        if req.name.trim().is_empty() {
            return Err(Error::validation("job name must not be empty"));
        }
        if req.priority < PRIORITY_LOW || req.priority > PRIORITY_MAX {
            return Err(Error::validation(format!(
                "priority must be within [{}, {}], got {}",
                PRIORITY_LOW, PRIORITY_MAX, req.priority
            )));
        }

        // Every declared parent must already exist
        let mut parents = Vec::with_capacity(req.dependencies.len());
        for spec in &req.dependencies {
            let Some(parent) = self.stores.jobs.find(&spec.parent).await? else {
                return Err(Error::Graph(crate::graph::GraphError::UnknownJob(
                    spec.parent,
                )));
            };
            parents.push(parent);
        }

        let mut job = Job::new(req.name, req.job_type, req.params)
            .with_priority(req.priority)
            .with_dependencies(req.dependencies.iter().map(|d| d.parent).collect());
        job.description = req.description;
        job.required_capabilities = req.required_capabilities;
        job.tags = req.tags;
        job.scheduled_at = req.scheduled_at;
        job.estimated_duration_secs = req.estimated_duration_secs;
        if let Some(max_retries) = req.max_retries {
            job = job.with_max_retries(max_retries);
        }
        if let Some(timeout_secs) = req.timeout_secs {
            job = job.with_timeout_secs(timeout_secs);
        }

        let store_cfg = &self.config.store;
        let backoff = Duration::from_millis(store_cfg.initial_backoff_ms);
        with_retries(store_cfg.max_retries, backoff, || {
            let job = job.clone();
            let jobs = self.stores.jobs.clone();
            async move { jobs.save(&job).await }
        })
        .await?;

        self.graph.add_node(job.id, job.priority).await;

        // Register the edges; any rejection rolls the whole submission back
        let mut added: Vec<JobId> = Vec::new();
        for (spec, parent) in req.dependencies.iter().zip(&parents) {
            match self.graph.add_edge(job.id, spec.parent, spec.kind).await {
                Ok(_) => {
                    added.push(spec.parent);
                    let mut edge = JobDependency::new(job.id, spec.parent, spec.kind);
                    edge.satisfied = edge.is_satisfied_by(
                        parent.status,
                        self.config.dependencies.conditional_propagation,
                    );
                    self.stores.dependencies.save(&edge).await?;
                }
                Err(e) => {
                    for parent_id in &added {
                        self.graph.remove_edge(&job.id, parent_id).await;
                        let _ = self.stores.dependencies.delete(&job.id, parent_id).await;
                    }
                    self.graph.remove_node(&job.id).await;
                    let _ = self.stores.jobs.delete(&job.id).await;
                    return Err(e.into());
                }
            }
        }

        info!(
            "job submitted: id={}, priority={}, deps={}",
            job.id,
            job.priority,
            job.depends_on.len()
        );

        // Fast path: already ready and not deferred
        let deferred = job.scheduled_at.map(|at| at > Utc::now()).unwrap_or(false);
        if !deferred && self.graph.jobs_ready().await.contains(&job.id) {
            self.dispatcher.schedule_job(&job.id).await?;
        }

        Ok(job.id)
    }

    /// Cancel a job. Queued jobs are removed and cancelled directly;
    /// running jobs are unbound from their worker and cancelled (the stop
    /// signal to the worker process travels outside this engine).
    pub async fn cancel_job(&self, job_id: &JobId) -> Result<()> {
        let Some(mut job) = self.stores.jobs.find(job_id).await? else {
            return Err(Error::not_found(format!("job {}", job_id)));
        };
        if job.status.is_terminal() {
            return Err(Error::validation(format!(
                "job {} is already {}",
                job_id, job.status
            )));
        }

        let previous = job.status;
        match job.status {
            JobStatus::Pending | JobStatus::Scheduled => {
                self.queue.remove_job(job_id).await;
            }
            JobStatus::Running => {
                if let Some(worker_id) = job.assigned_worker_id.clone() {
                    let _ = self.registry.unassign(&worker_id, job_id, None).await;
                }
            }
            _ => {}
        }

        job.mark_cancelled("Cancelled by request")
            .map_err(|e| Error::validation(e.to_string()))?;
        self.dispatcher.save_with_status(&job, previous).await?;
        self.dispatcher
            .propagate_terminal(*job_id, JobStatus::Cancelled)
            .await?;

        info!("job cancelled: id={}", job_id);
        Ok(())
    }

    /// Ingest a worker's terminal report for a job. Failed outcomes run
    /// through the failure controller, which either re-admits the job or
    /// finalizes the failure once retries are spent.
    pub async fn report_job_outcome(
        &self,
        job_id: &JobId,
        outcome: JobOutcome,
        message: Option<String>,
    ) -> Result<()> {
        let Some(mut job) = self.stores.jobs.find(job_id).await? else {
            return Err(Error::not_found(format!("job {}", job_id)));
        };
        if job.status != JobStatus::Running {
            return Err(Error::validation(format!(
                "job {} is {} and has no outcome to report",
                job_id, job.status
            )));
        }

        let worker_id = job.assigned_worker_id.clone();
        let previous = job.status;

        match outcome {
            JobOutcome::Completed => {
                if let Some(worker_id) = &worker_id {
                    let _ = self.registry.unassign(worker_id, job_id, Some(true)).await;
                }
                job.mark_completed()
                    .map_err(|e| Error::validation(e.to_string()))?;
                self.dispatcher.save_with_status(&job, previous).await?;
                self.dispatcher
                    .propagate_terminal(*job_id, JobStatus::Completed)
                    .await?;
            }
            JobOutcome::Failed => {
                let reason = message.unwrap_or_else(|| "Job failed".to_string());
                if let Some(worker_id) = &worker_id {
                    let _ = self
                        .registry
                        .unassign(worker_id, job_id, Some(false))
                        .await;
                }
                job.mark_failed(reason.clone())
                    .map_err(|e| Error::validation(e.to_string()))?;
                self.dispatcher.save_with_status(&job, previous).await?;
                // Retry policy applies to worker-reported failures too
                self.failure
                    .reassign(job_id, &worker_id.unwrap_or_default(), &reason)
                    .await?;
            }
            JobOutcome::Cancelled => {
                if let Some(worker_id) = &worker_id {
                    let _ = self.registry.unassign(worker_id, job_id, None).await;
                }
                job.mark_cancelled(message.unwrap_or_else(|| "Cancelled by worker".to_string()))
                    .map_err(|e| Error::validation(e.to_string()))?;
                self.dispatcher.save_with_status(&job, previous).await?;
                self.dispatcher
                    .propagate_terminal(*job_id, JobStatus::Cancelled)
                    .await?;
            }
        }

        debug!("outcome recorded: job={}, outcome={}", job_id, outcome);
        Ok(())
    }

    /// Look up a job record
    pub async fn get_job(&self, job_id: &JobId) -> Result<Option<Job>> {
        Ok(self.stores.jobs.find(job_id).await?)
    }

    /// Register a worker (delegates to the registry)
    pub async fn register_worker(&self, req: RegisterWorker) -> Result<Worker> {
        Ok(self.registry.register(req).await?)
    }

    /// Ingest a worker heartbeat (delegates to the registry)
    pub async fn worker_heartbeat(&self, worker_id: &WorkerId, hb: WorkerHeartbeat) -> Result<()> {
        Ok(self.registry.heartbeat(worker_id, hb).await?)
    }

    /// Deregister a worker. Forced removal hands the worker's jobs to the
    /// failure controller.
    pub async fn deregister_worker(&self, worker_id: &WorkerId, force: bool) -> Result<()> {
        let orphaned = self.registry.deregister(worker_id, force).await?;
        for job_id in orphaned {
            self.failure
                .reassign(&job_id, worker_id, "Worker deregistered")
                .await?;
        }
        Ok(())
    }

    /// Look up a worker record
    pub async fn get_worker(&self, worker_id: &WorkerId) -> Option<Worker> {
        self.registry.get(worker_id).await
    }

    /// Run one drain pass immediately (the periodic task does this on its
    /// own; explicit calls are for tests and manual nudging)
    pub async fn drain_now(&self) -> Result<crate::balancer::DrainSummary> {
        self.balancer.drain_once().await
    }

    /// Run one health check pass immediately
    pub async fn health_check_now(&self) -> Result<Vec<crate::health::HealthCheckResult>> {
        self.health.check_all().await
    }

    /// Point-in-time statistics
    pub async fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            queue: self.queue.stats().await,
            workers: self.registry.stats().await,
            graph_nodes: self.graph.node_count().await,
            graph_edges: self.graph.edge_count().await,
            balancing: self.balancer.metrics().await,
        }
    }

    /// Start the periodic tasks declared in the task table.
    pub async fn start(self: &Arc<Self>) {
        let table = task_table(&self.config);
        let mut handles = self.task_handles.lock().await;

        for task in table {
            let core = self.clone();
            let mut shutdown_rx = self.shutdown.subscribe();

            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(task.period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // The first tick fires immediately; skip it so tasks run
                // one full period after startup
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            // Deadline = period: an overrunning tick is cut
                            // off and the next tick starts clean
                            match tokio::time::timeout(task.period, core.run_task(task.kind)).await {
                                Ok(Ok(())) => {}
                                Ok(Err(e)) => {
                                    error!("periodic task failed: task={}, error={}", task.name, e);
                                }
                                Err(_) => {
                                    warn!("periodic task overran its deadline: task={}", task.name);
                                }
                            }
                        }
                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                break;
                            }
                        }
                    }
                }
                debug!("periodic task stopped: task={}", task.name);
            }));
        }

        info!("scheduler started: tasks={}", handles.len());
    }

    async fn run_task(&self, kind: TaskKind) -> Result<()> {
        match kind {
            TaskKind::Drain => {
                self.balancer.drain_once().await?;
            }
            TaskKind::Rebalance => {
                self.balancer.rebalance_once().await?;
            }
            TaskKind::HealthCheck => {
                self.health.check_all().await?;

                // Invariant sweep: insertion checks should make this empty
                let cycles = self.graph.detect_cycles().await;
                for cycle in &cycles {
                    error!(
                        "dependency cycle detected: length={}, severity={:?}, jobs={:?}",
                        cycle.length, cycle.severity, cycle.jobs
                    );
                }
                for warning in self.graph.validate().await {
                    warn!("graph structure warning: {:?}", warning);
                }
            }
            TaskKind::Cleanup => {
                self.health.cleanup().await?;
                self.registry.cleanup_rate_limiter().await;
            }
        }
        Ok(())
    }

    /// Stop the periodic tasks and wait for them to wind down.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let mut handles = self.task_handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        info!("scheduler stopped");
    }
}
