//! Worker registry: lifecycle, heartbeats, and the working set
//!
//! The registry owns the in-process working set of worker records and is
//! the single writer for worker state. Mutations happen under one short
//! exclusive section; store and cache writes follow outside the lock.

pub mod rate_limit;

pub use rate_limit::RegistrationRateLimiter;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cache::{CacheNamespace, CacheStore};
use crate::config::{LimitsConfig, RegistrationConfig};
use crate::events::EventBus;
use crate::models::{
    JobId, RegisterWorker, Worker, WorkerHeartbeat, WorkerId, WorkerStatus,
};
use crate::repository::WorkerStore;

/// Registry error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("registration validation failed: {0}")]
    Validation(String),

    #[error("registration rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("unknown worker {0}")]
    WorkerUnknown(WorkerId),

    #[error("worker {0} still has active jobs")]
    HasActiveJobs(WorkerId),

    #[error("worker {0} has no available capacity")]
    NoCapacity(WorkerId),

    #[error("worker {worker_id} is {status} and cannot accept jobs")]
    NotSchedulable {
        worker_id: WorkerId,
        status: WorkerStatus,
    },
}

impl RegistryError {
    /// Reason tag for the uniform handler contract
    pub fn reason(&self) -> &'static str {
        match self {
            RegistryError::Validation(_) => "validation_failed",
            RegistryError::RateLimited { .. } => "rate_limited",
            RegistryError::WorkerUnknown(_) => "worker_unknown",
            RegistryError::HasActiveJobs(_) => "has_active_jobs",
            RegistryError::NoCapacity(_) => "no_capacity",
            RegistryError::NotSchedulable { .. } => "not_schedulable",
        }
    }
}

/// Registry statistics
#[derive(Debug, Default, Clone)]
pub struct RegistryStats {
    pub total: usize,
    pub active: usize,
    pub busy: usize,
    pub inactive: usize,
    pub error: usize,
    pub maintenance: usize,
}

/// Worker registry
pub struct WorkerRegistry {
    registration: RegistrationConfig,
    limits: LimitsConfig,
    store: Arc<dyn WorkerStore>,
    cache: Arc<dyn CacheStore>,
    events: EventBus,
    rate_limiter: RegistrationRateLimiter,
    workers: RwLock<HashMap<WorkerId, Worker>>,

    /// Bumped on every mutation; snapshots carry the value so stale
    /// write-backs can be detected
    version: AtomicU64,
}

impl WorkerRegistry {
    /// Create a new registry
    pub fn new(
        registration: RegistrationConfig,
        limits: LimitsConfig,
        store: Arc<dyn WorkerStore>,
        cache: Arc<dyn CacheStore>,
        events: EventBus,
    ) -> Self {
        let rate_limiter = RegistrationRateLimiter::new(registration.clone());
        Self {
            registration,
            limits,
            store,
            cache,
            events,
            rate_limiter,
            workers: RwLock::new(HashMap::new()),
            version: AtomicU64::new(0),
        }
    }

    fn bump_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Current mutation version
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Register a worker, or refresh an existing registration.
    ///
    /// The rate limiter is consulted before validation: an id that burned
    /// its attempt budget is refused even with valid input.
    pub async fn register(&self, req: RegisterWorker) -> Result<Worker, RegistryError> {
        if let Err(retry_after_secs) = self.rate_limiter.check(&req.worker_id).await {
            return Err(RegistryError::RateLimited { retry_after_secs });
        }

        if let Err(msg) = self.validate_registration(&req) {
            self.rate_limiter.record_failure(&req.worker_id).await;
            return Err(RegistryError::Validation(msg));
        }

        let worker = {
            let mut workers = self.workers.write().await;
            let worker = workers
                .entry(req.worker_id.clone())
                .or_insert_with(|| Worker::new(req.worker_id.clone(), req.name.clone(), req.host.clone()));

            worker.name = req.name.clone();
            worker.host = req.host.clone();
            worker.port = req.port;
            worker.max_concurrent_jobs = req.max_concurrent_jobs;
            worker.reserved_capacity = req.reserved_capacity;
            worker.tags = req.tags.clone();
            worker.capabilities = req.capabilities.clone();
            worker.version = req.version.clone();
            worker.priority_threshold = req.priority_threshold;
            worker.load_factor = req.load_factor;

            let previous = worker.status;
            worker.set_status(WorkerStatus::Active);
            worker.last_heartbeat = Some(chrono::Utc::now());

            if previous != WorkerStatus::Active {
                self.events
                    .worker_status_changed(worker.id.clone(), previous, WorkerStatus::Active);
            }

            worker.clone()
        };
        self.bump_version();

        self.rate_limiter.clear(&req.worker_id).await;
        self.persist(&worker).await;
        self.cache_worker(&worker).await;

        info!(
            "worker registered: id={}, host={}, max_concurrent={}",
            worker.id, worker.host, worker.max_concurrent_jobs
        );
        Ok(worker)
    }

    fn validate_registration(&self, req: &RegisterWorker) -> Result<(), String> {
        if req.worker_id.trim().is_empty() {
            return Err("worker id must not be empty".to_string());
        }
        if req.name.trim().is_empty() {
            return Err("worker name must not be empty".to_string());
        }
        if req.max_concurrent_jobs < 1 || req.max_concurrent_jobs > self.limits.max_concurrent_jobs
        {
            return Err(format!(
                "max concurrent jobs must be within [1, {}], got {}",
                self.limits.max_concurrent_jobs, req.max_concurrent_jobs
            ));
        }
        if let Some(port) = req.port {
            if port == 0 {
                return Err("port must be within [1, 65535]".to_string());
            }
        }
        if req.load_factor < self.limits.load_factor_min
            || req.load_factor > self.limits.load_factor_max
        {
            return Err(format!(
                "load factor must be within [{}, {}], got {}",
                self.limits.load_factor_min, self.limits.load_factor_max, req.load_factor
            ));
        }
        Ok(())
    }

    /// Ingest a heartbeat. Scalar fields are last-writer-wins; counters
    /// are monotone; an INACTIVE worker is promoted to ACTIVE.
    pub async fn heartbeat(
        &self,
        worker_id: &WorkerId,
        hb: WorkerHeartbeat,
    ) -> Result<(), RegistryError> {
        if !self.workers.read().await.contains_key(worker_id) {
            // Working set miss: the store is still authoritative
            match self.store.find(worker_id).await {
                Ok(Some(worker)) => {
                    self.workers
                        .write()
                        .await
                        .entry(worker.id.clone())
                        .or_insert(worker);
                }
                _ => return Err(RegistryError::WorkerUnknown(worker_id.clone())),
            }
        }

        let worker = {
            let mut workers = self.workers.write().await;
            let Some(worker) = workers.get_mut(worker_id) else {
                return Err(RegistryError::WorkerUnknown(worker_id.clone()));
            };

            let previous = worker.status;
            worker.apply_heartbeat(&hb);
            if previous != worker.status {
                self.events
                    .worker_status_changed(worker.id.clone(), previous, worker.status);
            }

            worker.clone()
        };
        self.bump_version();

        self.persist(&worker).await;
        self.cache_worker(&worker).await;
        Ok(())
    }

    /// Deregister a worker.
    ///
    /// With `force = false` the call is refused while the worker still has
    /// active jobs. With `force = true` the assignments are stripped and
    /// returned to the caller for reassignment.
    pub async fn deregister(
        &self,
        worker_id: &WorkerId,
        force: bool,
    ) -> Result<Vec<JobId>, RegistryError> {
        let (worker, orphaned) = {
            let mut workers = self.workers.write().await;
            let Some(worker) = workers.get_mut(worker_id) else {
                return Err(RegistryError::WorkerUnknown(worker_id.clone()));
            };

            if !force && worker.current_job_count > 0 {
                return Err(RegistryError::HasActiveJobs(worker_id.clone()));
            }

            let orphaned: Vec<JobId> = worker.assigned_jobs.drain().collect();
            worker.current_job_count = 0;

            let previous = worker.status;
            worker.set_status(WorkerStatus::Inactive);
            if previous != WorkerStatus::Inactive {
                self.events
                    .worker_status_changed(worker.id.clone(), previous, WorkerStatus::Inactive);
            }

            (worker.clone(), orphaned)
        };
        self.bump_version();

        self.persist(&worker).await;
        self.evict_cached(worker_id).await;
        self.rate_limiter.clear(worker_id).await;

        info!(
            "worker deregistered: id={}, force={}, orphaned_jobs={}",
            worker_id,
            force,
            orphaned.len()
        );
        Ok(orphaned)
    }

    /// Look up a worker: working set first, then cache, then store.
    pub async fn get(&self, worker_id: &WorkerId) -> Option<Worker> {
        if let Some(worker) = self.workers.read().await.get(worker_id) {
            return Some(worker.clone());
        }

        let cache_key = CacheNamespace::Worker.key(worker_id);
        if let Ok(Some(raw)) = self.cache.get(&cache_key).await {
            if let Ok(worker) = serde_json::from_str::<Worker>(&raw) {
                return Some(worker);
            }
        }

        // The cache is never authoritative: fall through to the store
        match self.store.find(worker_id).await {
            Ok(Some(worker)) => {
                self.workers
                    .write()
                    .await
                    .insert(worker.id.clone(), worker.clone());
                self.cache_worker(&worker).await;
                Some(worker)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("worker lookup hit store error: id={}, error={}", worker_id, e);
                None
            }
        }
    }

    /// Versioned snapshot of every worker, for pure policy scoring
    pub async fn snapshot(&self) -> (u64, Vec<Worker>) {
        let workers = self.workers.read().await;
        let version = self.version();
        (version, workers.values().cloned().collect())
    }

    /// Workers currently accepting jobs
    pub async fn schedulable_workers(&self) -> Vec<Worker> {
        self.workers
            .read()
            .await
            .values()
            .filter(|w| w.status.is_schedulable())
            .cloned()
            .collect()
    }

    /// Whether any schedulable worker has free capacity
    pub async fn any_worker_with_slack(&self) -> bool {
        self.workers
            .read()
            .await
            .values()
            .any(|w| w.status.is_schedulable() && w.available_capacity() > 0)
    }

    /// Bind a job to a worker, enforcing status and capacity at commit
    /// time. This is the write half of the snapshot/commit pattern: the
    /// policy scores a snapshot, and a stale pick fails here.
    pub async fn try_assign(
        &self,
        worker_id: &WorkerId,
        job_id: JobId,
    ) -> Result<(), RegistryError> {
        let worker = {
            let mut workers = self.workers.write().await;
            let Some(worker) = workers.get_mut(worker_id) else {
                return Err(RegistryError::WorkerUnknown(worker_id.clone()));
            };

            if !worker.status.is_schedulable() {
                return Err(RegistryError::NotSchedulable {
                    worker_id: worker_id.clone(),
                    status: worker.status,
                });
            }

            let previous = worker.status;
            if !worker.assign_job(job_id) {
                return Err(RegistryError::NoCapacity(worker_id.clone()));
            }
            if previous != worker.status {
                self.events
                    .worker_status_changed(worker.id.clone(), previous, worker.status);
            }

            worker.clone()
        };
        self.bump_version();

        self.persist(&worker).await;
        debug!("job assigned: worker={}, job={}", worker_id, job_id);
        Ok(())
    }

    /// Release a job binding. When `outcome` is set the cumulative
    /// counters are updated. Idempotent for unknown bindings.
    pub async fn unassign(
        &self,
        worker_id: &WorkerId,
        job_id: &JobId,
        outcome: Option<bool>,
    ) -> Result<(), RegistryError> {
        let worker = {
            let mut workers = self.workers.write().await;
            let Some(worker) = workers.get_mut(worker_id) else {
                return Err(RegistryError::WorkerUnknown(worker_id.clone()));
            };

            let previous = worker.status;
            worker.unassign_job(job_id);
            if let Some(success) = outcome {
                worker.record_outcome(success);
            }
            if previous != worker.status {
                self.events
                    .worker_status_changed(worker.id.clone(), previous, worker.status);
            }

            worker.clone()
        };
        self.bump_version();

        self.persist(&worker).await;
        Ok(())
    }

    /// Force a worker's lifecycle status
    pub async fn set_worker_status(
        &self,
        worker_id: &WorkerId,
        status: WorkerStatus,
    ) -> Result<(), RegistryError> {
        let worker = {
            let mut workers = self.workers.write().await;
            let Some(worker) = workers.get_mut(worker_id) else {
                return Err(RegistryError::WorkerUnknown(worker_id.clone()));
            };

            let previous = worker.status;
            worker.set_status(status);
            if previous != status {
                self.events
                    .worker_status_changed(worker.id.clone(), previous, status);
            }

            worker.clone()
        };
        self.bump_version();

        self.persist(&worker).await;
        Ok(())
    }

    /// Overwrite a worker's assignment view from the authoritative truth
    /// set. Used by the health monitor to repair drift.
    pub async fn reconcile_assignments(
        &self,
        worker_id: &WorkerId,
        truth: HashSet<JobId>,
    ) -> Result<(), RegistryError> {
        let worker = {
            let mut workers = self.workers.write().await;
            let Some(worker) = workers.get_mut(worker_id) else {
                return Err(RegistryError::WorkerUnknown(worker_id.clone()));
            };

            worker.current_job_count = truth.len() as u32;
            worker.assigned_jobs = truth;
            worker.clone()
        };
        self.bump_version();

        self.persist(&worker).await;
        Ok(())
    }

    /// Exclude a worker from assignment for `ttl`
    pub async fn blacklist(&self, worker_id: &WorkerId, ttl: Duration) {
        let key = CacheNamespace::WorkerBlacklist.key(worker_id);
        if let Err(e) = self.cache.put(&key, "1".to_string(), ttl).await {
            warn!("failed to blacklist worker: id={}, error={}", worker_id, e);
        }
    }

    /// Whether the worker is currently blacklisted
    pub async fn is_blacklisted(&self, worker_id: &WorkerId) -> bool {
        let key = CacheNamespace::WorkerBlacklist.key(worker_id);
        matches!(self.cache.get(&key).await, Ok(Some(_)))
    }

    /// Counts by status
    pub async fn stats(&self) -> RegistryStats {
        let workers = self.workers.read().await;
        let mut stats = RegistryStats {
            total: workers.len(),
            ..Default::default()
        };
        for worker in workers.values() {
            match worker.status {
                WorkerStatus::Active => stats.active += 1,
                WorkerStatus::Busy => stats.busy += 1,
                WorkerStatus::Inactive => stats.inactive += 1,
                WorkerStatus::Error => stats.error += 1,
                WorkerStatus::Maintenance => stats.maintenance += 1,
            }
        }
        stats
    }

    /// Periodic maintenance: drop idle rate-limit trackers
    pub async fn cleanup_rate_limiter(&self) -> usize {
        self.rate_limiter.cleanup().await
    }

    async fn persist(&self, worker: &Worker) {
        if let Err(e) = self.store.save(worker).await {
            warn!("worker store save failed: id={}, error={}", worker.id, e);
        }
    }

    async fn cache_worker(&self, worker: &Worker) {
        let key = CacheNamespace::Worker.key(&worker.id);
        match serde_json::to_string(worker) {
            Ok(raw) => {
                let ttl = Duration::from_secs(self.registration.worker_cache_ttl_secs);
                if let Err(e) = self.cache.put(&key, raw, ttl).await {
                    warn!("worker cache write failed: id={}, error={}", worker.id, e);
                }
            }
            Err(e) => warn!("worker cache serialization failed: id={}, error={}", worker.id, e),
        }
    }

    async fn evict_cached(&self, worker_id: &WorkerId) {
        let key = CacheNamespace::Worker.key(worker_id);
        let _ = self.cache.evict(&key).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::repository::InMemoryWorkerStore;

    fn registry() -> WorkerRegistry {
        WorkerRegistry::new(
            RegistrationConfig::default(),
            LimitsConfig::default(),
            Arc::new(InMemoryWorkerStore::new()),
            Arc::new(MemoryCache::new()),
            EventBus::new(),
        )
    }

    fn request(id: &str) -> RegisterWorker {
        RegisterWorker {
            worker_id: id.to_string(),
            name: format!("worker {}", id),
            host: "10.0.0.1".to_string(),
            port: Some(7070),
            max_concurrent_jobs: 4,
            reserved_capacity: 0,
            tags: vec![],
            capabilities: Some("gpu".to_string()),
            version: None,
            priority_threshold: 0,
            load_factor: 1.0,
        }
    }

    #[tokio::test]
    async fn test_register_activates_worker() {
        let reg = registry();
        let worker = reg.register(request("w-1")).await.unwrap();

        assert_eq!(worker.status, WorkerStatus::Active);
        assert!(worker.last_heartbeat.is_some());
        assert_eq!(reg.stats().await.active, 1);
    }

    #[tokio::test]
    async fn test_register_validation_ladder() {
        let reg = registry();

        let mut bad = request("");
        assert!(matches!(
            reg.register(bad).await.unwrap_err(),
            RegistryError::Validation(_)
        ));

        bad = request("w-1");
        bad.name = "  ".to_string();
        assert!(matches!(
            reg.register(bad).await.unwrap_err(),
            RegistryError::Validation(_)
        ));

        bad = request("w-1");
        bad.max_concurrent_jobs = 150;
        assert!(matches!(
            reg.register(bad).await.unwrap_err(),
            RegistryError::Validation(_)
        ));

        bad = request("w-1");
        bad.port = Some(0);
        assert!(matches!(
            reg.register(bad).await.unwrap_err(),
            RegistryError::Validation(_)
        ));

        bad = request("w-1");
        bad.load_factor = 5.0;
        assert!(matches!(
            reg.register(bad).await.unwrap_err(),
            RegistryError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_rate_limit_after_three_failures() {
        let reg = registry();

        let mut bad = request("w");
        bad.max_concurrent_jobs = 150;

        for _ in 0..3 {
            assert!(matches!(
                reg.register(bad.clone()).await.unwrap_err(),
                RegistryError::Validation(_)
            ));
        }

        // Fourth attempt refused even with valid input
        let err = reg.register(request("w")).await.unwrap_err();
        assert!(matches!(err, RegistryError::RateLimited { .. }));
        assert_eq!(err.reason(), "rate_limited");
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_worker() {
        let reg = registry();
        let err = reg
            .heartbeat(&"ghost".to_string(), WorkerHeartbeat::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::WorkerUnknown(_)));
    }

    #[tokio::test]
    async fn test_heartbeat_promotes_inactive_worker() {
        let reg = registry();
        reg.register(request("w-1")).await.unwrap();
        reg.set_worker_status(&"w-1".to_string(), WorkerStatus::Inactive)
            .await
            .unwrap();

        reg.heartbeat(&"w-1".to_string(), WorkerHeartbeat::default())
            .await
            .unwrap();

        let worker = reg.get(&"w-1".to_string()).await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Active);
        assert_eq!(worker.heartbeat_count, 1);
    }

    #[tokio::test]
    async fn test_assign_and_unassign_accounting() {
        let reg = registry();
        reg.register(request("w-1")).await.unwrap();
        let id = "w-1".to_string();

        let job = JobId::new_v4();
        reg.try_assign(&id, job).await.unwrap();

        let worker = reg.get(&id).await.unwrap();
        assert_eq!(worker.current_job_count, 1);
        assert!(worker.assigned_jobs.contains(&job));

        reg.unassign(&id, &job, Some(true)).await.unwrap();
        let worker = reg.get(&id).await.unwrap();
        assert_eq!(worker.current_job_count, 0);
        assert_eq!(worker.total_succeeded, 1);
    }

    #[tokio::test]
    async fn test_try_assign_enforces_capacity() {
        let reg = registry();
        let mut req = request("w-1");
        req.max_concurrent_jobs = 1;
        reg.register(req).await.unwrap();
        let id = "w-1".to_string();

        reg.try_assign(&id, JobId::new_v4()).await.unwrap();
        let err = reg.try_assign(&id, JobId::new_v4()).await.unwrap_err();
        assert!(matches!(err, RegistryError::NoCapacity(_)));
    }

    #[tokio::test]
    async fn test_try_assign_refuses_error_worker() {
        let reg = registry();
        reg.register(request("w-1")).await.unwrap();
        let id = "w-1".to_string();
        reg.set_worker_status(&id, WorkerStatus::Error).await.unwrap();

        let err = reg.try_assign(&id, JobId::new_v4()).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotSchedulable { .. }));
    }

    #[tokio::test]
    async fn test_deregister_refuses_active_jobs_without_force() {
        let reg = registry();
        reg.register(request("w-1")).await.unwrap();
        let id = "w-1".to_string();
        reg.try_assign(&id, JobId::new_v4()).await.unwrap();

        let err = reg.deregister(&id, false).await.unwrap_err();
        assert!(matches!(err, RegistryError::HasActiveJobs(_)));

        // State unchanged
        assert_eq!(reg.get(&id).await.unwrap().current_job_count, 1);
    }

    #[tokio::test]
    async fn test_force_deregister_returns_orphans() {
        let reg = registry();
        reg.register(request("w-1")).await.unwrap();
        let id = "w-1".to_string();

        let job = JobId::new_v4();
        reg.try_assign(&id, job).await.unwrap();

        let orphans = reg.deregister(&id, true).await.unwrap();
        assert_eq!(orphans, vec![job]);

        let worker = reg.get(&id).await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Inactive);
        assert_eq!(worker.current_job_count, 0);
    }

    #[tokio::test]
    async fn test_blacklist_round_trip() {
        let reg = registry();
        let id = "w-1".to_string();

        assert!(!reg.is_blacklisted(&id).await);
        reg.blacklist(&id, Duration::from_secs(60)).await;
        assert!(reg.is_blacklisted(&id).await);
    }

    #[tokio::test]
    async fn test_reconcile_overwrites_view() {
        let reg = registry();
        reg.register(request("w-1")).await.unwrap();
        let id = "w-1".to_string();
        reg.try_assign(&id, JobId::new_v4()).await.unwrap();

        let truth: HashSet<JobId> = [JobId::new_v4(), JobId::new_v4()].into_iter().collect();
        reg.reconcile_assignments(&id, truth.clone()).await.unwrap();

        let worker = reg.get(&id).await.unwrap();
        assert_eq!(worker.current_job_count, 2);
        assert_eq!(worker.assigned_jobs, truth);
    }

    #[tokio::test]
    async fn test_snapshot_carries_version() {
        let reg = registry();
        let (v0, workers) = reg.snapshot().await;
        assert!(workers.is_empty());

        reg.register(request("w-1")).await.unwrap();
        let (v1, workers) = reg.snapshot().await;
        assert_eq!(workers.len(), 1);
        assert!(v1 > v0);
    }
}
