//! Registration rate limiting
//!
//! Tracks failed registration attempts per worker id. A worker id that
//! fails too often inside the window is refused outright until the
//! cooldown after its last attempt has passed, valid input or not.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::RegistrationConfig;
use crate::models::WorkerId;

#[derive(Debug, Clone)]
struct AttemptTracker {
    /// Failed attempt timestamps inside the rolling window
    failed_attempts: Vec<DateTime<Utc>>,

    /// Most recent attempt, successful or not
    last_attempt: DateTime<Utc>,
}

impl AttemptTracker {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            failed_attempts: Vec::new(),
            last_attempt: now,
        }
    }

    fn prune(&mut self, now: DateTime<Utc>, window: ChronoDuration) {
        self.failed_attempts.retain(|t| now - *t < window);
    }
}

/// In-memory registration rate limiter
pub struct RegistrationRateLimiter {
    config: RegistrationConfig,
    trackers: RwLock<HashMap<WorkerId, AttemptTracker>>,
}

impl RegistrationRateLimiter {
    /// Create a new rate limiter
    pub fn new(config: RegistrationConfig) -> Self {
        Self {
            config,
            trackers: RwLock::new(HashMap::new()),
        }
    }

    /// Check whether a registration attempt for this worker id is allowed.
    /// Returns the seconds to wait when the id is currently limited.
    pub async fn check(&self, worker_id: &WorkerId) -> Result<(), u64> {
        let now = Utc::now();
        let window = ChronoDuration::from_std(self.config.cooldown())
            .unwrap_or_else(|_| ChronoDuration::hours(1));

        let mut trackers = self.trackers.write().await;
        let Some(tracker) = trackers.get_mut(worker_id) else {
            return Ok(());
        };

        tracker.prune(now, window);

        if tracker.failed_attempts.len() >= self.config.max_attempts as usize {
            // Cooldown runs from the last attempt, not the first failure
            let retry_at = tracker.last_attempt + window;
            let retry_after = (retry_at - now).num_seconds().max(0) as u64;

            if retry_after > 0 {
                // Hammering during the cooldown pushes it out further
                tracker.last_attempt = now;
                warn!(
                    "registration rate limited: worker_id={}, retry_after_secs={}",
                    worker_id, retry_after
                );
                return Err(retry_after);
            }

            // Cooldown elapsed
            tracker.failed_attempts.clear();
        }

        Ok(())
    }

    /// Record a failed registration attempt
    pub async fn record_failure(&self, worker_id: &WorkerId) {
        let now = Utc::now();
        let window = ChronoDuration::from_std(self.config.cooldown())
            .unwrap_or_else(|_| ChronoDuration::hours(1));

        let mut trackers = self.trackers.write().await;
        let tracker = trackers
            .entry(worker_id.clone())
            .or_insert_with(|| AttemptTracker::new(now));

        tracker.prune(now, window);
        tracker.failed_attempts.push(now);
        tracker.last_attempt = now;

        debug!(
            "registration failure recorded: worker_id={}, failures_in_window={}",
            worker_id,
            tracker.failed_attempts.len()
        );
    }

    /// Clear tracking after a successful registration
    pub async fn clear(&self, worker_id: &WorkerId) {
        self.trackers.write().await.remove(worker_id);
    }

    /// Drop trackers whose last attempt is outside the cooldown window
    pub async fn cleanup(&self) -> usize {
        let now = Utc::now();
        let window = ChronoDuration::from_std(self.config.cooldown())
            .unwrap_or_else(|_| ChronoDuration::hours(1));

        let mut trackers = self.trackers.write().await;
        let before = trackers.len();
        trackers.retain(|_, t| now - t.last_attempt < window);
        before - trackers.len()
    }
}
