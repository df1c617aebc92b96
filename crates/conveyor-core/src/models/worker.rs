//! Worker entity, heartbeat payloads, and derived statistics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;

use crate::models::job::JobId;

/// Unique worker identifier
pub type WorkerId = String;

/// Bounded window for rolling CPU / memory samples
const RESOURCE_SAMPLE_WINDOW: usize = 20;

/// Worker lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerStatus {
    /// Registered but not yet (or no longer) taking work
    Inactive,

    /// Healthy and accepting jobs
    Active,

    /// Accepting jobs but under load
    Busy,

    /// Flagged by the health monitor; candidate for cleanup
    Error,

    /// Administratively drained
    Maintenance,
}

impl Default for WorkerStatus {
    fn default() -> Self {
        WorkerStatus::Inactive
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStatus::Inactive => write!(f, "inactive"),
            WorkerStatus::Active => write!(f, "active"),
            WorkerStatus::Busy => write!(f, "busy"),
            WorkerStatus::Error => write!(f, "error"),
            WorkerStatus::Maintenance => write!(f, "maintenance"),
        }
    }
}

impl WorkerStatus {
    /// Whether the assignment policy may place jobs on a worker in this state
    pub fn is_schedulable(&self) -> bool {
        matches!(self, WorkerStatus::Active | WorkerStatus::Busy)
    }
}

/// Worker record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    /// Unique worker id
    pub id: WorkerId,

    /// Display name
    pub name: String,

    /// Host the worker runs on
    pub host: String,

    /// Port the worker listens on, when it exposes one
    pub port: Option<u16>,

    /// Lifecycle status
    pub status: WorkerStatus,

    /// Concurrency ceiling
    pub max_concurrent_jobs: u32,

    /// Jobs currently bound to the worker
    pub current_job_count: u32,

    /// Capacity withheld from scheduling
    pub reserved_capacity: u32,

    /// Tags for placement and reporting
    pub tags: Vec<String>,

    /// Free-form capabilities blob; matched by substring against job
    /// requirements
    pub capabilities: Option<String>,

    /// Worker software version
    pub version: Option<String>,

    /// Jobs below this priority are refused
    pub priority_threshold: u32,

    /// Relative weight in [0.1, 2.0]
    pub load_factor: f64,

    /// Last heartbeat received
    pub last_heartbeat: Option<DateTime<Utc>>,

    /// Registration time
    pub registered_at: DateTime<Utc>,

    /// When the worker entered its current status
    pub status_changed_at: DateTime<Utc>,

    /// Cumulative jobs handed to this worker
    pub total_processed: u64,

    /// Cumulative successes
    pub total_succeeded: u64,

    /// Cumulative failures
    pub total_failed: u64,

    /// Heartbeats received
    pub heartbeat_count: u64,

    /// Errors the worker has self-reported
    pub reported_error_count: u32,

    /// Jobs currently assigned. View over the scheduler's assignment
    /// index; reconciled by the health monitor.
    pub assigned_jobs: HashSet<JobId>,

    /// Rolling CPU usage samples (0-100)
    pub cpu_samples: VecDeque<f64>,

    /// Rolling memory usage samples (0-100)
    pub memory_samples: VecDeque<f64>,
}

impl Worker {
    /// Create a new worker record in INACTIVE
    pub fn new(id: impl Into<WorkerId>, name: impl Into<String>, host: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            host: host.into(),
            port: None,
            status: WorkerStatus::Inactive,
            max_concurrent_jobs: 1,
            current_job_count: 0,
            reserved_capacity: 0,
            tags: vec![],
            capabilities: None,
            version: None,
            priority_threshold: 0,
            load_factor: 1.0,
            last_heartbeat: None,
            registered_at: now,
            status_changed_at: now,
            total_processed: 0,
            total_succeeded: 0,
            total_failed: 0,
            heartbeat_count: 0,
            reported_error_count: 0,
            assigned_jobs: HashSet::new(),
            cpu_samples: VecDeque::new(),
            memory_samples: VecDeque::new(),
        }
    }

    /// Set the listening port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the concurrency ceiling
    pub fn with_max_concurrent_jobs(mut self, max: u32) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    /// Set the capabilities blob
    pub fn with_capabilities(mut self, caps: impl Into<String>) -> Self {
        self.capabilities = Some(caps.into());
        self
    }

    /// Set the priority threshold
    pub fn with_priority_threshold(mut self, threshold: u32) -> Self {
        self.priority_threshold = threshold;
        self
    }

    /// Set the load factor
    pub fn with_load_factor(mut self, load_factor: f64) -> Self {
        self.load_factor = load_factor;
        self
    }

    /// Set tags
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Derived: slots the policy may still fill
    pub fn available_capacity(&self) -> u32 {
        self.max_concurrent_jobs
            .saturating_sub(self.current_job_count)
            .saturating_sub(self.reserved_capacity)
    }

    /// Derived: fraction of the ceiling in use
    pub fn load_percentage(&self) -> f64 {
        if self.max_concurrent_jobs == 0 {
            return 1.0;
        }
        self.current_job_count as f64 / self.max_concurrent_jobs as f64
    }

    /// Derived: fraction of processed jobs that succeeded
    pub fn success_rate(&self) -> f64 {
        if self.total_processed == 0 {
            0.0
        } else {
            self.total_succeeded as f64 / self.total_processed as f64
        }
    }

    /// Rolling CPU average, when samples exist
    pub fn avg_cpu(&self) -> Option<f64> {
        if self.cpu_samples.is_empty() {
            return None;
        }
        Some(self.cpu_samples.iter().sum::<f64>() / self.cpu_samples.len() as f64)
    }

    /// Rolling memory average, when samples exist
    pub fn avg_memory(&self) -> Option<f64> {
        if self.memory_samples.is_empty() {
            return None;
        }
        Some(self.memory_samples.iter().sum::<f64>() / self.memory_samples.len() as f64)
    }

    /// Whether the last heartbeat is within the timeout
    pub fn is_heartbeat_fresh(&self, now: DateTime<Utc>, timeout: std::time::Duration) -> bool {
        let Some(hb) = self.last_heartbeat else {
            return false;
        };
        match chrono::Duration::from_std(timeout) {
            Ok(timeout) => now - hb <= timeout,
            // A timeout too large to represent can never be exceeded
            Err(_) => true,
        }
    }

    /// Move to a new lifecycle status, stamping the change time
    pub fn set_status(&mut self, status: WorkerStatus) {
        if self.status != status {
            self.status = status;
            self.status_changed_at = Utc::now();
        }
    }

    /// Bind a job to this worker. Capacity is the caller's responsibility;
    /// the counter never exceeds the ceiling here.
    pub fn assign_job(&mut self, job_id: JobId) -> bool {
        if self.available_capacity() == 0 {
            return false;
        }
        if self.assigned_jobs.insert(job_id) {
            self.current_job_count += 1;
        }
        if self.current_job_count >= self.max_concurrent_jobs {
            self.set_status(WorkerStatus::Busy);
        }
        true
    }

    /// Release a job binding. Idempotent.
    pub fn unassign_job(&mut self, job_id: &JobId) {
        if self.assigned_jobs.remove(job_id) {
            self.current_job_count = self.current_job_count.saturating_sub(1);
        }
        if self.status == WorkerStatus::Busy && self.current_job_count < self.max_concurrent_jobs {
            self.set_status(WorkerStatus::Active);
        }
    }

    /// Record a finished job in the cumulative counters
    pub fn record_outcome(&mut self, success: bool) {
        self.total_processed += 1;
        if success {
            self.total_succeeded += 1;
        } else {
            self.total_failed += 1;
        }
    }

    /// Fold a heartbeat payload into the record. Scalar fields are
    /// last-writer-wins; counters are monotone.
    pub fn apply_heartbeat(&mut self, hb: &WorkerHeartbeat) {
        self.last_heartbeat = Some(Utc::now());
        self.heartbeat_count += 1;

        if let Some(status) = hb.status {
            self.set_status(status);
        } else if self.status == WorkerStatus::Inactive {
            self.set_status(WorkerStatus::Active);
        }

        if let Some(count) = hb.current_job_count {
            self.current_job_count = count.min(self.max_concurrent_jobs);
        }

        if let Some(errors) = hb.error_count {
            self.reported_error_count = self.reported_error_count.max(errors);
        }

        if let Some(cpu) = hb.cpu_usage {
            push_sample(&mut self.cpu_samples, cpu);
        }

        if let Some(mem) = hb.memory_usage {
            push_sample(&mut self.memory_samples, mem);
        }
    }

    /// Point-in-time statistics view
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            id: self.id.clone(),
            name: self.name.clone(),
            status: self.status,
            current_job_count: self.current_job_count,
            max_concurrent_jobs: self.max_concurrent_jobs,
            available_capacity: self.available_capacity(),
            load_percentage: self.load_percentage(),
            success_rate: self.success_rate(),
            total_processed: self.total_processed,
            total_succeeded: self.total_succeeded,
            total_failed: self.total_failed,
            last_heartbeat: self.last_heartbeat,
        }
    }
}

fn push_sample(window: &mut VecDeque<f64>, sample: f64) {
    if window.len() == RESOURCE_SAMPLE_WINDOW {
        window.pop_front();
    }
    window.push_back(sample.clamp(0.0, 100.0));
}

/// Registration request carrying the caller-settable worker attributes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterWorker {
    pub worker_id: WorkerId,
    pub name: String,
    pub host: String,
    pub port: Option<u16>,
    pub max_concurrent_jobs: u32,

    #[serde(default)]
    pub reserved_capacity: u32,

    #[serde(default)]
    pub tags: Vec<String>,

    pub capabilities: Option<String>,
    pub version: Option<String>,

    #[serde(default)]
    pub priority_threshold: u32,

    #[serde(default = "default_load_factor")]
    pub load_factor: f64,
}

fn default_load_factor() -> f64 {
    1.0
}

/// Periodic self-report from a worker
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    /// Status override
    pub status: Option<WorkerStatus>,

    /// Jobs the worker believes it is running
    pub current_job_count: Option<u32>,

    /// Capacity the worker advertises; recomputed from the record when absent
    pub available_capacity: Option<u32>,

    /// CPU usage (0-100)
    pub cpu_usage: Option<f64>,

    /// Memory usage (0-100)
    pub memory_usage: Option<f64>,

    /// Errors observed since startup
    pub error_count: Option<u32>,

    /// Free-form status message
    pub message: Option<String>,
}

/// Derived worker statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStats {
    pub id: WorkerId,
    pub name: String,
    pub status: WorkerStatus,
    pub current_job_count: u32,
    pub max_concurrent_jobs: u32,
    pub available_capacity: u32,
    pub load_percentage: f64,
    pub success_rate: f64,
    pub total_processed: u64,
    pub total_succeeded: u64,
    pub total_failed: u64,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl WorkerStats {
    /// Format as human-readable
    pub fn format(&self) -> String {
        format!(
            "Worker '{}' [{}]: status={}, jobs={}/{}, success_rate={:.1}%, processed={}",
            self.name,
            self.id,
            self.status,
            self.current_job_count,
            self.max_concurrent_jobs,
            self.success_rate * 100.0,
            self.total_processed,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker() -> Worker {
        Worker::new("w-1", "worker one", "10.0.0.5")
            .with_port(7070)
            .with_max_concurrent_jobs(4)
            .with_capabilities("gpu,ffmpeg")
    }

    #[test]
    fn test_new_worker_is_inactive() {
        let w = worker();
        assert_eq!(w.status, WorkerStatus::Inactive);
        assert_eq!(w.available_capacity(), 4);
        assert_eq!(w.load_percentage(), 0.0);
        assert_eq!(w.success_rate(), 0.0);
    }

    #[test]
    fn test_capacity_accounting() {
        let mut w = worker();
        w.set_status(WorkerStatus::Active);

        let a = JobId::new_v4();
        let b = JobId::new_v4();
        assert!(w.assign_job(a));
        assert!(w.assign_job(b));
        assert_eq!(w.current_job_count, 2);
        assert_eq!(w.available_capacity(), 2);

        // Assigning the same job twice does not double-count
        assert!(w.assign_job(a));
        assert_eq!(w.current_job_count, 2);

        w.unassign_job(&a);
        w.unassign_job(&a);
        assert_eq!(w.current_job_count, 1);
        assert_eq!(w.available_capacity(), 3);
    }

    #[test]
    fn test_assignment_saturates_to_busy_and_back() {
        let mut w = Worker::new("w-2", "small", "h").with_max_concurrent_jobs(1);
        w.set_status(WorkerStatus::Active);

        let job = JobId::new_v4();
        assert!(w.assign_job(job));
        assert_eq!(w.status, WorkerStatus::Busy);
        assert_eq!(w.available_capacity(), 0);

        // Ceiling reached: further assignments refused
        assert!(!w.assign_job(JobId::new_v4()));

        w.unassign_job(&job);
        assert_eq!(w.status, WorkerStatus::Active);
    }

    #[test]
    fn test_reserved_capacity_reduces_slack() {
        let mut w = worker();
        w.reserved_capacity = 3;
        assert_eq!(w.available_capacity(), 1);

        w.reserved_capacity = 10;
        assert_eq!(w.available_capacity(), 0);
    }

    #[test]
    fn test_heartbeat_updates() {
        let mut w = worker();

        let hb = WorkerHeartbeat {
            cpu_usage: Some(42.0),
            memory_usage: Some(63.0),
            ..Default::default()
        };
        w.apply_heartbeat(&hb);

        // INACTIVE promotes to ACTIVE on a clean heartbeat
        assert_eq!(w.status, WorkerStatus::Active);
        assert!(w.last_heartbeat.is_some());
        assert_eq!(w.heartbeat_count, 1);
        assert_eq!(w.avg_cpu(), Some(42.0));
        assert_eq!(w.avg_memory(), Some(63.0));

        let first_hb = w.last_heartbeat.unwrap();
        w.apply_heartbeat(&WorkerHeartbeat::default());
        // Heartbeat monotonicity
        assert!(w.last_heartbeat.unwrap() >= first_hb);
        assert_eq!(w.heartbeat_count, 2);
    }

    #[test]
    fn test_rolling_samples_are_bounded() {
        let mut w = worker();
        for i in 0..50 {
            w.apply_heartbeat(&WorkerHeartbeat {
                cpu_usage: Some(i as f64),
                ..Default::default()
            });
        }
        assert_eq!(w.cpu_samples.len(), RESOURCE_SAMPLE_WINDOW);
        // Oldest samples dropped
        assert_eq!(*w.cpu_samples.front().unwrap(), 30.0);
    }

    #[test]
    fn test_success_rate() {
        let mut w = worker();
        w.record_outcome(true);
        w.record_outcome(true);
        w.record_outcome(false);

        assert_eq!(w.total_processed, 3);
        assert!((w.success_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_stats_format() {
        let w = worker();
        let s = w.stats().format();
        assert!(s.contains("worker one"));
        assert!(s.contains("inactive"));
    }
}
