//! Structured scheduler events for observers
//!
//! Anything that changes an entity's visible status is published here.
//! Delivery is best-effort fan-out over a broadcast channel; slow or
//! absent observers never block the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::{JobId, JobStatus, WorkerId, WorkerStatus};

/// Default buffered capacity per subscriber
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Structured event emitted by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    /// A job's visible status changed
    JobStatusChanged {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
        at: DateTime<Utc>,
    },

    /// A worker's lifecycle status changed
    WorkerStatusChanged {
        worker_id: WorkerId,
        from: WorkerStatus,
        to: WorkerStatus,
        at: DateTime<Utc>,
    },

    /// A job was pulled off a failed worker and re-admitted
    JobReassigned {
        job_id: JobId,
        from_worker: WorkerId,
        reason: String,
        retry_count: u32,
        at: DateTime<Utc>,
    },

    /// A previously unhealthy worker passed a clean check
    WorkerRecovered {
        worker_id: WorkerId,
        at: DateTime<Utc>,
    },

    /// A worker crossed the consecutive-failure threshold
    WorkerFailed {
        worker_id: WorkerId,
        consecutive_failures: u32,
        at: DateTime<Utc>,
    },

    /// The rebalancer moved queued work between workers
    JobsRebalanced {
        from_worker: WorkerId,
        to_worker: WorkerId,
        moved: usize,
        at: DateTime<Utc>,
    },
}

/// Event bus handing out broadcast subscriptions
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SchedulerEvent>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Fire-and-forget: an error only means there are
    /// currently no subscribers.
    pub fn publish(&self, event: SchedulerEvent) {
        let _ = self.sender.send(event);
    }

    /// Publish a job status change
    pub fn job_status_changed(&self, job_id: JobId, from: JobStatus, to: JobStatus) {
        self.publish(SchedulerEvent::JobStatusChanged {
            job_id,
            from,
            to,
            at: Utc::now(),
        });
    }

    /// Publish a worker status change
    pub fn worker_status_changed(&self, worker_id: WorkerId, from: WorkerStatus, to: WorkerStatus) {
        self.publish(SchedulerEvent::WorkerStatusChanged {
            worker_id,
            from,
            to,
            at: Utc::now(),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
