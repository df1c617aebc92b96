//! Three-band ready-to-run queue
//!
//! HIGH (priority >= 500), NORMAL (100-499), LOW (< 100). FIFO within a
//! band, bounded per-band capacity, drained HIGH -> NORMAL -> LOW by the
//! load balancer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::QueueConfig;
use crate::models::{Job, JobId, PriorityBand};

/// Queue error types
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue band {band} is full (capacity {capacity})")]
    BandFull {
        band: PriorityBand,
        capacity: usize,
    },
}

/// A queued job reference. The queue holds references, not job records;
/// the job store stays authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: JobId,
    pub priority: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueEntry {
    fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            priority: job.priority,
            enqueued_at: Utc::now(),
        }
    }

    /// Band this entry belongs to
    pub fn band(&self) -> PriorityBand {
        PriorityBand::of(self.priority)
    }
}

#[derive(Debug, Default)]
struct Bands {
    high: VecDeque<QueueEntry>,
    normal: VecDeque<QueueEntry>,
    low: VecDeque<QueueEntry>,
}

impl Bands {
    fn band_mut(&mut self, band: PriorityBand) -> &mut VecDeque<QueueEntry> {
        match band {
            PriorityBand::High => &mut self.high,
            PriorityBand::Normal => &mut self.normal,
            PriorityBand::Low => &mut self.low,
        }
    }

    fn band(&self, band: PriorityBand) -> &VecDeque<QueueEntry> {
        match band {
            PriorityBand::High => &self.high,
            PriorityBand::Normal => &self.normal,
            PriorityBand::Low => &self.low,
        }
    }
}

/// Bounded three-band FIFO queue
pub struct PriorityQueue {
    config: QueueConfig,
    bands: Mutex<Bands>,
}

impl PriorityQueue {
    /// Create an empty queue with the given capacity bounds
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            bands: Mutex::new(Bands::default()),
        }
    }

    fn capacity(&self, band: PriorityBand) -> usize {
        match band {
            PriorityBand::High => self.config.high_capacity,
            PriorityBand::Normal => self.config.normal_capacity,
            PriorityBand::Low => self.config.low_capacity,
        }
    }

    /// Enqueue a job at the tail of its band
    pub async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        self.enqueue_entry(QueueEntry::for_job(job)).await
    }

    /// Re-admit an existing entry at the tail of its band. Used by the
    /// drain pass when no worker is eligible, so one unassignable job
    /// does not block the band.
    pub async fn enqueue_entry(&self, entry: QueueEntry) -> Result<(), QueueError> {
        let band = entry.band();
        let capacity = self.capacity(band);
        let mut bands = self.bands.lock().await;

        let queue = bands.band_mut(band);
        if queue.len() >= capacity {
            return Err(QueueError::BandFull { band, capacity });
        }

        debug!("job enqueued: id={}, band={}, priority={}", entry.job_id, band, entry.priority);
        queue.push_back(entry);
        Ok(())
    }

    /// Head of a band without removing it
    pub async fn peek(&self, band: PriorityBand) -> Option<QueueEntry> {
        self.bands.lock().await.band(band).front().cloned()
    }

    /// Pop the head of a band
    pub async fn pop(&self, band: PriorityBand) -> Option<QueueEntry> {
        self.bands.lock().await.band_mut(band).pop_front()
    }

    /// Remove every entry matching the predicate, across all bands.
    /// Returns the removed entries. Used by cancellation.
    pub async fn remove_if<F>(&self, mut predicate: F) -> Vec<QueueEntry>
    where
        F: FnMut(&QueueEntry) -> bool,
    {
        let mut bands = self.bands.lock().await;
        let mut removed = Vec::new();

        for band in [PriorityBand::High, PriorityBand::Normal, PriorityBand::Low] {
            let queue = bands.band_mut(band);
            let mut kept = VecDeque::with_capacity(queue.len());
            while let Some(entry) = queue.pop_front() {
                if predicate(&entry) {
                    removed.push(entry);
                } else {
                    kept.push_back(entry);
                }
            }
            *queue = kept;
        }

        removed
    }

    /// Remove a single job wherever it is queued. Returns whether it was
    /// present.
    pub async fn remove_job(&self, job_id: &JobId) -> bool {
        !self.remove_if(|e| e.job_id == *job_id).await.is_empty()
    }

    /// Depth of one band
    pub async fn size(&self, band: PriorityBand) -> usize {
        self.bands.lock().await.band(band).len()
    }

    /// Depth across all bands
    pub async fn total_size(&self) -> usize {
        let bands = self.bands.lock().await;
        bands.high.len() + bands.normal.len() + bands.low.len()
    }

    /// Point-in-time statistics
    pub async fn stats(&self) -> QueueStats {
        let bands = self.bands.lock().await;
        QueueStats {
            high_depth: bands.high.len(),
            normal_depth: bands.normal.len(),
            low_depth: bands.low.len(),
            high_capacity: self.config.high_capacity,
            normal_capacity: self.config.normal_capacity,
            low_capacity: self.config.low_capacity,
        }
    }
}

/// Queue statistics
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub high_depth: usize,
    pub normal_depth: usize,
    pub low_depth: usize,
    pub high_capacity: usize,
    pub normal_capacity: usize,
    pub low_capacity: usize,
}

impl QueueStats {
    /// Total queued jobs
    pub fn total(&self) -> usize {
        self.high_depth + self.normal_depth + self.low_depth
    }

    /// Format as human-readable
    pub fn format(&self) -> String {
        format!(
            "Ready queue: total={}, high={}/{}, normal={}/{}, low={}/{}",
            self.total(),
            self.high_depth,
            self.high_capacity,
            self.normal_depth,
            self.normal_capacity,
            self.low_depth,
            self.low_capacity,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(priority: u32) -> Job {
        Job::new("j", "t", serde_json::json!({})).with_priority(priority)
    }

    fn queue() -> PriorityQueue {
        PriorityQueue::new(QueueConfig::default())
    }

    #[tokio::test]
    async fn test_entries_land_in_their_band() {
        let q = queue();

        let high = job(600);
        let normal = job(200);
        let low = job(10);

        q.enqueue(&high).await.unwrap();
        q.enqueue(&normal).await.unwrap();
        q.enqueue(&low).await.unwrap();

        assert_eq!(q.size(PriorityBand::High).await, 1);
        assert_eq!(q.size(PriorityBand::Normal).await, 1);
        assert_eq!(q.size(PriorityBand::Low).await, 1);
        assert_eq!(q.total_size().await, 3);

        assert_eq!(q.pop(PriorityBand::High).await.unwrap().job_id, high.id);
        assert_eq!(q.pop(PriorityBand::Normal).await.unwrap().job_id, normal.id);
        assert_eq!(q.pop(PriorityBand::Low).await.unwrap().job_id, low.id);
    }

    #[tokio::test]
    async fn test_fifo_within_band() {
        let q = queue();
        let first = job(200);
        let second = job(450); // higher priority, same band: still FIFO
        let third = job(101);

        q.enqueue(&first).await.unwrap();
        q.enqueue(&second).await.unwrap();
        q.enqueue(&third).await.unwrap();

        assert_eq!(q.pop(PriorityBand::Normal).await.unwrap().job_id, first.id);
        assert_eq!(q.pop(PriorityBand::Normal).await.unwrap().job_id, second.id);
        assert_eq!(q.pop(PriorityBand::Normal).await.unwrap().job_id, third.id);
    }

    #[tokio::test]
    async fn test_band_capacity_bound() {
        let config = QueueConfig {
            high_capacity: 2,
            normal_capacity: 5000,
            low_capacity: 10000,
        };
        let q = PriorityQueue::new(config);

        q.enqueue(&job(600)).await.unwrap();
        q.enqueue(&job(700)).await.unwrap();

        let err = q.enqueue(&job(800)).await.unwrap_err();
        assert_eq!(
            err,
            QueueError::BandFull {
                band: PriorityBand::High,
                capacity: 2
            }
        );

        // Other bands are unaffected
        q.enqueue(&job(50)).await.unwrap();
    }

    #[tokio::test]
    async fn test_peek_does_not_remove() {
        let q = queue();
        let j = job(600);
        q.enqueue(&j).await.unwrap();

        assert_eq!(q.peek(PriorityBand::High).await.unwrap().job_id, j.id);
        assert_eq!(q.size(PriorityBand::High).await, 1);
    }

    #[tokio::test]
    async fn test_requeue_goes_to_tail() {
        let q = queue();
        let first = job(600);
        let second = job(600);

        q.enqueue(&first).await.unwrap();
        q.enqueue(&second).await.unwrap();

        // Simulate a drain pass that could not place the head
        let head = q.pop(PriorityBand::High).await.unwrap();
        assert_eq!(head.job_id, first.id);
        q.enqueue_entry(head).await.unwrap();

        assert_eq!(q.pop(PriorityBand::High).await.unwrap().job_id, second.id);
        assert_eq!(q.pop(PriorityBand::High).await.unwrap().job_id, first.id);
    }

    #[tokio::test]
    async fn test_remove_if_for_cancellation() {
        let q = queue();
        let keep = job(200);
        let cancel = job(200);

        q.enqueue(&keep).await.unwrap();
        q.enqueue(&cancel).await.unwrap();

        let removed = q.remove_if(|e| e.job_id == cancel.id).await;
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].job_id, cancel.id);
        assert_eq!(q.total_size().await, 1);

        assert!(!q.remove_job(&cancel.id).await);
        assert!(q.remove_job(&keep.id).await);
    }

    #[tokio::test]
    async fn test_stats_format() {
        let q = queue();
        q.enqueue(&job(600)).await.unwrap();
        q.enqueue(&job(20)).await.unwrap();

        let stats = q.stats().await;
        assert_eq!(stats.total(), 2);
        assert!(stats.format().contains("high=1/1000"));
        assert!(stats.format().contains("low=1/10000"));
    }
}
