//! Job entity and lifecycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::models::worker::WorkerId;

/// Unique job identifier
pub type JobId = Uuid;

/// Lowest accepted priority
pub const PRIORITY_LOW: u32 = 1;

/// Default priority for unremarkable work
pub const PRIORITY_MEDIUM: u32 = 50;

/// Convenience band for urgent-ish work (still the NORMAL queue band)
pub const PRIORITY_HIGH: u32 = 100;

/// Jobs at or above this priority are treated as elevated throughout the
/// engine: HIGH queue band, scoring bonus, restricted worker pools
pub const ELEVATED_PRIORITY: u32 = 500;

/// Highest accepted priority
pub const PRIORITY_MAX: u32 = 1000;

/// Ready-queue band derived from a job's numeric priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PriorityBand {
    /// priority >= 500
    High,

    /// 100 <= priority <= 499
    Normal,

    /// priority < 100
    Low,
}

impl PriorityBand {
    /// Band for a numeric priority
    pub fn of(priority: u32) -> Self {
        if priority >= ELEVATED_PRIORITY {
            PriorityBand::High
        } else if priority >= PRIORITY_HIGH {
            PriorityBand::Normal
        } else {
            PriorityBand::Low
        }
    }
}

impl fmt::Display for PriorityBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriorityBand::High => write!(f, "high"),
            PriorityBand::Normal => write!(f, "normal"),
            PriorityBand::Low => write!(f, "low"),
        }
    }
}

/// Job execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    /// Waiting for prerequisites or queue admission
    Pending,

    /// Prerequisites cleared, sitting in the ready queue
    Scheduled,

    /// Assigned to a worker and executing
    Running,

    /// Finished successfully
    Completed,

    /// Finished unsuccessfully (may be re-admitted while retry budget lasts)
    Failed,

    /// Cancelled before completion
    Cancelled,
}

impl Default for JobStatus {
    fn default() -> Self {
        JobStatus::Pending
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Scheduled => write!(f, "scheduled"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl JobStatus {
    /// Check if status is terminal (absorbing)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Check if the job can still be placed on a worker
    pub fn is_schedulable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Scheduled)
    }
}

/// Terminal outcome reported for a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOutcome {
    Completed,
    Failed,
    Cancelled,
}

impl JobOutcome {
    /// The terminal status this outcome maps to
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed => JobStatus::Completed,
            JobOutcome::Failed => JobStatus::Failed,
            JobOutcome::Cancelled => JobStatus::Cancelled,
        }
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.status())
    }
}

/// Rejected state transition
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("job {job_id} is {status} and cannot transition to {requested}")]
    InvalidTransition {
        job_id: JobId,
        status: JobStatus,
        requested: JobStatus,
    },

    #[error("job {0} has exhausted its retry budget")]
    RetriesExhausted(JobId),

    #[error("job {0} cannot run without an assigned worker")]
    NoAssignedWorker(JobId),
}

/// Job definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,

    /// Human-readable name
    pub name: String,

    /// Optional description
    pub description: Option<String>,

    /// User-supplied job type
    pub job_type: String,

    /// Opaque parameter blob handed to the worker
    pub params: serde_json::Value,

    /// Priority (1-1000)
    pub priority: u32,

    /// Job status
    pub status: JobStatus,

    /// Created timestamp
    pub created_at: DateTime<Utc>,

    /// Earliest time the job should run, if deferred
    pub scheduled_at: Option<DateTime<Utc>>,

    /// Started timestamp
    pub started_at: Option<DateTime<Utc>>,

    /// Completed timestamp (set iff status is terminal)
    pub completed_at: Option<DateTime<Utc>>,

    /// Re-admissions so far
    pub retry_count: u32,

    /// Max re-admissions
    pub max_retries: u32,

    /// Execution timeout in seconds
    pub timeout_secs: u64,

    /// Prerequisite job ids. Derived projection of the authoritative
    /// dependency edge records; populated for convenience on read paths.
    pub depends_on: Vec<JobId>,

    /// Worker currently bound to this job, if any
    pub assigned_worker_id: Option<WorkerId>,

    /// Caller's duration estimate in seconds
    pub estimated_duration_secs: Option<u64>,

    /// Capabilities a worker must advertise to take this job
    pub required_capabilities: Option<String>,

    /// Tags for categorization
    pub tags: Vec<String>,

    /// Last error message
    pub error_message: Option<String>,
}

impl Job {
    /// Create a new job in PENDING
    pub fn new(
        name: impl Into<String>,
        job_type: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        Self {
            id: JobId::new_v4(),
            name: name.into(),
            description: None,
            job_type: job_type.into(),
            params,
            priority: PRIORITY_MEDIUM,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: 3,
            timeout_secs: 300,
            depends_on: vec![],
            assigned_worker_id: None,
            estimated_duration_secs: None,
            required_capabilities: None,
            tags: vec![],
            error_message: None,
        }
    }

    /// Set priority
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Declare prerequisites
    pub fn with_dependencies(mut self, deps: Vec<JobId>) -> Self {
        self.depends_on = deps;
        self
    }

    /// Set max retries
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set timeout
    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Set tags
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Require worker capabilities
    pub fn with_required_capabilities(mut self, caps: impl Into<String>) -> Self {
        self.required_capabilities = Some(caps.into());
        self
    }

    /// Set the caller's duration estimate
    pub fn with_estimated_duration_secs(mut self, secs: u64) -> Self {
        self.estimated_duration_secs = Some(secs);
        self
    }

    /// Defer execution until the given time
    pub fn schedule_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Queue band for this job's priority
    pub fn band(&self) -> PriorityBand {
        PriorityBand::of(self.priority)
    }

    /// Whether this job gets elevated treatment
    pub fn is_elevated(&self) -> bool {
        self.priority >= ELEVATED_PRIORITY
    }

    /// Actual execution duration, derived from the timestamps
    pub fn actual_duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some(completed - started),
            _ => None,
        }
    }

    /// Whether the job may be re-admitted after a failure
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Whether a RUNNING job has outlived its timeout
    pub fn has_timed_out(&self, now: DateTime<Utc>) -> bool {
        match (self.status, self.started_at) {
            (JobStatus::Running, Some(started)) => {
                (now - started).num_seconds() > self.timeout_secs as i64
            }
            _ => false,
        }
    }

    /// PENDING -> SCHEDULED: prerequisites cleared, entering the queue
    pub fn mark_scheduled(&mut self) -> Result<(), TransitionError> {
        if self.status != JobStatus::Pending {
            return Err(self.invalid(JobStatus::Scheduled));
        }
        self.status = JobStatus::Scheduled;
        Ok(())
    }

    /// SCHEDULED/PENDING -> RUNNING: bound to a worker
    pub fn mark_running(&mut self, worker_id: WorkerId) -> Result<(), TransitionError> {
        if !self.status.is_schedulable() {
            return Err(self.invalid(JobStatus::Running));
        }
        self.assigned_worker_id = Some(worker_id);
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// RUNNING -> COMPLETED
    pub fn mark_completed(&mut self) -> Result<(), TransitionError> {
        if self.status != JobStatus::Running {
            return Err(self.invalid(JobStatus::Completed));
        }
        self.status = JobStatus::Completed;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Any non-terminal -> FAILED with an error message
    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(self.invalid(JobStatus::Failed));
        }
        self.status = JobStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error_message = Some(error.into());
        Ok(())
    }

    /// Any non-terminal -> CANCELLED with a reason
    pub fn mark_cancelled(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(self.invalid(JobStatus::Cancelled));
        }
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(Utc::now());
        self.error_message = Some(reason.into());
        Ok(())
    }

    /// FAILED (or interrupted RUNNING) -> PENDING, consuming one retry.
    /// Clears the worker binding and execution timestamps.
    pub fn begin_retry(&mut self) -> Result<(), TransitionError> {
        if !self.can_retry() {
            return Err(TransitionError::RetriesExhausted(self.id));
        }
        self.retry_count += 1;
        self.status = JobStatus::Pending;
        self.assigned_worker_id = None;
        self.started_at = None;
        self.completed_at = None;
        Ok(())
    }

    /// RUNNING -> SCHEDULED: pull an unconfirmed assignment back into the
    /// queue. Only valid while the assigned worker has not reported the
    /// job; the rebalancer uses this to move work off overloaded workers.
    pub fn revert_to_scheduled(&mut self) -> Result<(), TransitionError> {
        if self.status != JobStatus::Running {
            return Err(self.invalid(JobStatus::Scheduled));
        }
        self.status = JobStatus::Scheduled;
        self.assigned_worker_id = None;
        self.started_at = None;
        Ok(())
    }

    /// Drop the worker binding without changing status. Used when a queue
    /// re-admission races a worker report.
    pub fn clear_assignment(&mut self) {
        self.assigned_worker_id = None;
    }

    fn invalid(&self, requested: JobStatus) -> TransitionError {
        TransitionError::InvalidTransition {
            job_id: self.id,
            status: self.status,
            requested,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_bands() {
        assert_eq!(PriorityBand::of(1), PriorityBand::Low);
        assert_eq!(PriorityBand::of(99), PriorityBand::Low);
        assert_eq!(PriorityBand::of(100), PriorityBand::Normal);
        assert_eq!(PriorityBand::of(499), PriorityBand::Normal);
        assert_eq!(PriorityBand::of(500), PriorityBand::High);
        assert_eq!(PriorityBand::of(1000), PriorityBand::High);
    }

    #[test]
    fn test_job_creation() {
        let job = Job::new("nightly-report", "report", serde_json::json!({"day": 7}));

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, PRIORITY_MEDIUM);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.max_retries, 3);
        assert!(job.assigned_worker_id.is_none());
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn test_job_builder_options() {
        let job = Job::new("encode", "video", serde_json::json!({}))
            .with_priority(600)
            .with_max_retries(5)
            .with_timeout_secs(60)
            .with_required_capabilities("gpu")
            .with_tags(vec!["media".to_string()]);

        assert!(job.is_elevated());
        assert_eq!(job.band(), PriorityBand::High);
        assert_eq!(job.max_retries, 5);
        assert_eq!(job.required_capabilities.as_deref(), Some("gpu"));
    }

    #[test]
    fn test_lifecycle_happy_path() {
        let mut job = Job::new("j", "t", serde_json::json!({}));

        job.mark_scheduled().unwrap();
        assert_eq!(job.status, JobStatus::Scheduled);

        job.mark_running("w-1".to_string()).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.assigned_worker_id.as_deref(), Some("w-1"));
        assert!(job.started_at.is_some());

        job.mark_completed().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
        assert!(job.started_at.unwrap() <= job.completed_at.unwrap());
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        let mut job = Job::new("j", "t", serde_json::json!({}));
        job.mark_scheduled().unwrap();
        job.mark_running("w-1".to_string()).unwrap();
        job.mark_completed().unwrap();

        assert!(job.mark_failed("late failure").is_err());
        assert!(job.mark_cancelled("late cancel").is_err());
        assert!(job.mark_scheduled().is_err());
    }

    #[test]
    fn test_retry_consumes_budget_and_resets() {
        let mut job = Job::new("j", "t", serde_json::json!({})).with_max_retries(1);
        job.mark_scheduled().unwrap();
        job.mark_running("w-1".to_string()).unwrap();
        job.mark_failed("worker died").unwrap();

        job.begin_retry().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 1);
        assert!(job.assigned_worker_id.is_none());
        assert!(job.started_at.is_none());
        assert!(job.completed_at.is_none());

        // Budget exhausted
        assert_eq!(
            job.begin_retry().unwrap_err(),
            TransitionError::RetriesExhausted(job.id)
        );
    }

    #[test]
    fn test_revert_to_scheduled_clears_binding() {
        let mut job = Job::new("j", "t", serde_json::json!({}));
        job.mark_scheduled().unwrap();
        job.mark_running("w-1".to_string()).unwrap();

        job.revert_to_scheduled().unwrap();
        assert_eq!(job.status, JobStatus::Scheduled);
        assert!(job.assigned_worker_id.is_none());
        assert!(job.started_at.is_none());
        // No retry consumed by a move
        assert_eq!(job.retry_count, 0);

        // Only RUNNING jobs can be pulled back
        assert!(job.revert_to_scheduled().is_err());
    }

    #[test]
    fn test_timeout_detection() {
        let mut job = Job::new("j", "t", serde_json::json!({})).with_timeout_secs(10);
        job.mark_scheduled().unwrap();
        job.mark_running("w-1".to_string()).unwrap();

        let now = Utc::now();
        assert!(!job.has_timed_out(now));
        assert!(job.has_timed_out(now + chrono::Duration::seconds(11)));
    }

    #[test]
    fn test_outcome_maps_to_status() {
        assert_eq!(JobOutcome::Completed.status(), JobStatus::Completed);
        assert_eq!(JobOutcome::Failed.status(), JobStatus::Failed);
        assert_eq!(JobOutcome::Cancelled.status(), JobStatus::Cancelled);
        assert!(JobOutcome::Failed.status().is_terminal());
    }
}
