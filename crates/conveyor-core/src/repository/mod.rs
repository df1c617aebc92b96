//! Persistence contracts consumed by the engine
//!
//! The engine never talks to a concrete database; it is written against
//! the traits in `traits` and ships in-memory implementations used by the
//! default wiring and the test suite.

pub mod memory;
pub mod traits;

pub use memory::{InMemoryDependencyStore, InMemoryJobStore, InMemoryWorkerStore};
pub use traits::{DependencyStore, JobStore, Stores, WorkerStore};

use std::future::Future;
use std::time::Duration;

use crate::util::ExponentialBackoff;

/// Store result type alias
pub type StoreResult<T> = Result<T, StoreError>;

/// Store-specific error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The backing store could not be reached; retried internally before
    /// being surfaced
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A record failed to round-trip
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A write conflicted with a concurrent update
    #[error("conflicting write for {0}")]
    Conflict(String),
}

impl StoreError {
    /// Whether the operation is worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Conflict(_))
    }
}

/// Run a store operation, retrying transient failures with exponential
/// backoff before surfacing the final error.
pub async fn with_retries<T, F, Fut>(max_retries: u32, initial_backoff: Duration, op: F) -> StoreResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let backoff = ExponentialBackoff::new(initial_backoff, Duration::from_secs(30), 2.0);
    let mut attempt: u32 = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < max_retries => {
                attempt += 1;
                tracing::warn!(
                    "transient store failure, retrying: attempt={}/{}, error={}",
                    attempt,
                    max_retries,
                    err
                );
                tokio::time::sleep(backoff.delay_for(attempt)).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_with_retries_eventually_succeeds() {
        let calls = AtomicU32::new(0);

        let result = with_retries(3, Duration::from_millis(1), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StoreError::Unavailable("connection refused".to_string()))
            } else {
                Ok(42u32)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retries_gives_up() {
        let calls = AtomicU32::new(0);

        let result: StoreResult<()> = with_retries(2, Duration::from_millis(1), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Unavailable("down".to_string()))
        })
        .await;

        assert!(result.is_err());
        // Initial attempt plus two retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_errors_are_not_retried() {
        let calls = AtomicU32::new(0);

        let result: StoreResult<()> = with_retries(5, Duration::from_millis(1), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Serialization("bad record".to_string()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
