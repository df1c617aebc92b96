//! Dependency edge records
//!
//! The edge record is the authoritative representation of a dependency;
//! `Job::depends_on` is a projection of these records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::job::{JobId, JobStatus};

/// How a parent job must resolve before the child may run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Parent must reach any terminal state
    MustComplete,

    /// Parent must have started executing
    MustStart,

    /// Parent must finish COMPLETED
    MustSucceed,

    /// Propagation policy is configurable (see `DependencyConfig`)
    Conditional,
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyKind::MustComplete => write!(f, "must_complete"),
            DependencyKind::MustStart => write!(f, "must_start"),
            DependencyKind::MustSucceed => write!(f, "must_succeed"),
            DependencyKind::Conditional => write!(f, "conditional"),
        }
    }
}

/// What the submitter wants done when a prerequisite fails.
/// Carried as policy metadata; the engine does not interpret it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureAction {
    Block,
    Proceed,
    Warn,
    Retry,
    Skip,
    Escalate,
}

impl Default for FailureAction {
    fn default() -> Self {
        FailureAction::Block
    }
}

/// A directed dependency edge: `child` waits on `parent`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDependency {
    /// The waiting job
    pub child: JobId,

    /// The prerequisite job
    pub parent: JobId,

    /// Resolution requirement
    pub kind: DependencyKind,

    /// Whether the parent has reached a compatible state
    pub satisfied: bool,

    /// Edge priority (1-10), metadata for reporting
    pub priority: u8,

    /// Optional per-edge timeout in seconds
    pub timeout_secs: Option<u64>,

    /// Failure policy metadata
    pub failure_action: FailureAction,

    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl JobDependency {
    /// Create a new unsatisfied edge
    pub fn new(child: JobId, parent: JobId, kind: DependencyKind) -> Self {
        Self {
            child,
            parent,
            kind,
            satisfied: false,
            priority: 5,
            timeout_secs: None,
            failure_action: FailureAction::default(),
            created_at: Utc::now(),
        }
    }

    /// Set edge priority
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(1, 10);
        self
    }

    /// Set edge timeout
    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    /// Set failure policy metadata
    pub fn with_failure_action(mut self, action: FailureAction) -> Self {
        self.failure_action = action;
        self
    }

    /// Edge key, (child, parent)
    pub fn key(&self) -> (JobId, JobId) {
        (self.child, self.parent)
    }

    /// Whether a parent in `parent_status` satisfies this edge.
    ///
    /// `conditional_propagation` controls CONDITIONAL edges: when true any
    /// terminal parent satisfies them (MUST_COMPLETE semantics), when false
    /// only a successful parent does (MUST_SUCCEED semantics).
    pub fn is_satisfied_by(&self, parent_status: JobStatus, conditional_propagation: bool) -> bool {
        match self.kind {
            DependencyKind::MustComplete => parent_status.is_terminal(),
            DependencyKind::MustStart => {
                parent_status == JobStatus::Running || parent_status.is_terminal()
            }
            DependencyKind::MustSucceed => parent_status == JobStatus::Completed,
            DependencyKind::Conditional => {
                if conditional_propagation {
                    parent_status.is_terminal()
                } else {
                    parent_status == JobStatus::Completed
                }
            }
        }
    }

    /// Whether a terminal parent in `parent_status` permanently blocks the
    /// child (the edge can never become satisfied).
    pub fn is_blocked_by(&self, parent_status: JobStatus, conditional_propagation: bool) -> bool {
        parent_status.is_terminal()
            && !self.is_satisfied_by(parent_status, conditional_propagation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(kind: DependencyKind) -> JobDependency {
        JobDependency::new(JobId::new_v4(), JobId::new_v4(), kind)
    }

    #[test]
    fn test_must_complete_accepts_any_terminal() {
        let e = edge(DependencyKind::MustComplete);
        assert!(e.is_satisfied_by(JobStatus::Completed, true));
        assert!(e.is_satisfied_by(JobStatus::Failed, true));
        assert!(e.is_satisfied_by(JobStatus::Cancelled, true));
        assert!(!e.is_satisfied_by(JobStatus::Running, true));
    }

    #[test]
    fn test_must_succeed_requires_completed() {
        let e = edge(DependencyKind::MustSucceed);
        assert!(e.is_satisfied_by(JobStatus::Completed, true));
        assert!(!e.is_satisfied_by(JobStatus::Failed, true));
        assert!(e.is_blocked_by(JobStatus::Failed, true));
        assert!(e.is_blocked_by(JobStatus::Cancelled, true));
    }

    #[test]
    fn test_must_start_satisfied_at_running() {
        let e = edge(DependencyKind::MustStart);
        assert!(e.is_satisfied_by(JobStatus::Running, true));
        // A parent that already finished obviously started
        assert!(e.is_satisfied_by(JobStatus::Completed, true));
        assert!(!e.is_satisfied_by(JobStatus::Pending, true));
    }

    #[test]
    fn test_conditional_follows_configuration() {
        let e = edge(DependencyKind::Conditional);
        assert!(e.is_satisfied_by(JobStatus::Failed, true));
        assert!(!e.is_satisfied_by(JobStatus::Failed, false));
        assert!(e.is_satisfied_by(JobStatus::Completed, false));
    }

    #[test]
    fn test_edge_priority_is_clamped() {
        let e = edge(DependencyKind::MustComplete).with_priority(99);
        assert_eq!(e.priority, 10);
        let e = edge(DependencyKind::MustComplete).with_priority(0);
        assert_eq!(e.priority, 1);
    }
}
