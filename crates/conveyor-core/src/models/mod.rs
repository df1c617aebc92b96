//! Core entity types: jobs, workers, dependency edges
//!
//! Entities are plain data with a small set of state-transition methods.
//! Derived fields (available capacity, load percentage, success rate) are
//! computed on read, never stored.

pub mod dependency;
pub mod job;
pub mod worker;

pub use dependency::{DependencyKind, FailureAction, JobDependency};
pub use job::{
    Job, JobId, JobOutcome, JobStatus, PriorityBand, TransitionError, ELEVATED_PRIORITY,
    PRIORITY_HIGH, PRIORITY_LOW, PRIORITY_MAX, PRIORITY_MEDIUM,
};
pub use worker::{
    RegisterWorker, Worker, WorkerHeartbeat, WorkerId, WorkerStats, WorkerStatus,
};
