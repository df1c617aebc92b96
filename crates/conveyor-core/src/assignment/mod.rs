//! Worker selection policy
//!
//! A tagged strategy enum with a single dispatch function. Scoring is
//! pure over worker snapshots; the only mutable state is the round-robin
//! cursor. `None` means no eligible worker, which is not an error: the
//! job goes back to the tail of its band.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::models::{Job, Worker, WorkerId, ELEVATED_PRIORITY};

/// Concurrency ceiling a worker needs before the priority-based strategy
/// will hand it elevated work
const PRIORITY_POOL_MIN_CONCURRENCY: u32 = 5;

/// Selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Next eligible worker by rotating cursor
    RoundRobin,

    /// Most free slots
    CapacityAware,

    /// Lowest load percentage
    LeastLoaded,

    /// Best historical success rate
    PerformanceBased,

    /// Weighted blend of capacity, success rate, load, and experience
    Intelligent,

    /// Elevated jobs restricted to big workers, round-robin otherwise
    PriorityBased,

    /// Switches strategy on system-wide average load
    Adaptive,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::Intelligent
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::RoundRobin => write!(f, "round_robin"),
            Strategy::CapacityAware => write!(f, "capacity_aware"),
            Strategy::LeastLoaded => write!(f, "least_loaded"),
            Strategy::PerformanceBased => write!(f, "performance_based"),
            Strategy::Intelligent => write!(f, "intelligent"),
            Strategy::PriorityBased => write!(f, "priority_based"),
            Strategy::Adaptive => write!(f, "adaptive"),
        }
    }
}

/// Assignment policy: strategy plus the round-robin cursor
pub struct AssignmentPolicy {
    strategy: Strategy,
    cursor: AtomicUsize,
}

impl AssignmentPolicy {
    /// Create a policy for the given strategy
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Configured strategy
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Pick a worker for `job` from a snapshot of candidates.
    ///
    /// Candidates are filtered for eligibility first; ties always break
    /// on ascending worker id so selection is stable.
    pub fn select_worker(
        &self,
        job: &Job,
        workers: &[Worker],
        blacklisted: &HashSet<WorkerId>,
    ) -> Option<WorkerId> {
        let mut eligible: Vec<&Worker> = workers
            .iter()
            .filter(|w| is_eligible(job, w, blacklisted))
            .collect();

        if eligible.is_empty() {
            return None;
        }

        eligible.sort_by(|a, b| a.id.cmp(&b.id));

        let strategy = match self.strategy {
            Strategy::Adaptive => adaptive_strategy(workers),
            other => other,
        };

        let chosen = match strategy {
            Strategy::RoundRobin => self.round_robin(&eligible),
            Strategy::CapacityAware => {
                argmax(&eligible, |w| w.available_capacity() as f64)
            }
            Strategy::LeastLoaded => argmax(&eligible, |w| -w.load_percentage()),
            Strategy::PerformanceBased => argmax(&eligible, |w| w.success_rate()),
            Strategy::Intelligent => {
                argmax(&eligible, |w| intelligent_score(job, w))
            }
            Strategy::PriorityBased => self.priority_based(job, &eligible),
            Strategy::Adaptive => unreachable!("adaptive resolves to a concrete strategy"),
        };

        chosen.map(|w| w.id.clone())
    }

    fn round_robin<'a>(&self, eligible: &[&'a Worker]) -> Option<&'a Worker> {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % eligible.len();
        eligible.get(idx).copied()
    }

    fn priority_based<'a>(&self, job: &Job, eligible: &[&'a Worker]) -> Option<&'a Worker> {
        if job.priority >= ELEVATED_PRIORITY {
            let pool: Vec<&Worker> = eligible
                .iter()
                .filter(|w| {
                    w.max_concurrent_jobs >= PRIORITY_POOL_MIN_CONCURRENCY
                        && w.available_capacity() > 0
                })
                .copied()
                .collect();
            if pool.is_empty() {
                return None;
            }
            self.round_robin(&pool)
        } else {
            self.round_robin(eligible)
        }
    }
}

/// Eligibility filter applied before any scoring
pub fn is_eligible(job: &Job, worker: &Worker, blacklisted: &HashSet<WorkerId>) -> bool {
    if !worker.status.is_schedulable() {
        return false;
    }
    if worker.available_capacity() == 0 {
        return false;
    }
    if job.priority < worker.priority_threshold {
        return false;
    }
    if blacklisted.contains(&worker.id) {
        return false;
    }
    if let Some(required) = &job.required_capabilities {
        match &worker.capabilities {
            Some(caps) if caps.contains(required.as_str()) => {}
            _ => return false,
        }
    }
    true
}

/// Intelligent score: weighted blend, boosted for elevated jobs.
/// Every component is normalized to [0, 1].
fn intelligent_score(job: &Job, worker: &Worker) -> f64 {
    let capacity_ratio = if worker.max_concurrent_jobs == 0 {
        0.0
    } else {
        worker.available_capacity() as f64 / worker.max_concurrent_jobs as f64
    };
    let success_rate = worker.success_rate();
    let idle = 1.0 - worker.load_percentage();
    let experience = (worker.total_processed as f64 / 1000.0).min(1.0);

    let priority_bonus = if job.priority >= ELEVATED_PRIORITY {
        1.5
    } else {
        1.0
    };

    (0.30 * capacity_ratio + 0.30 * success_rate + 0.25 * idle + 0.15 * experience)
        * priority_bonus
}

/// System-wide average load decides the concrete strategy:
/// under 50% favors proven workers, 50-80% blends, over 80% spreads load.
fn adaptive_strategy(workers: &[Worker]) -> Strategy {
    let schedulable: Vec<&Worker> = workers
        .iter()
        .filter(|w| w.status.is_schedulable())
        .collect();

    if schedulable.is_empty() {
        return Strategy::Intelligent;
    }

    let avg_load = schedulable.iter().map(|w| w.load_percentage()).sum::<f64>()
        / schedulable.len() as f64;

    if avg_load < 0.5 {
        Strategy::PerformanceBased
    } else if avg_load <= 0.8 {
        Strategy::Intelligent
    } else {
        Strategy::LeastLoaded
    }
}

/// First candidate with the strictly greatest score. The input is sorted
/// by worker id, so equal scores resolve to the smallest id.
fn argmax<'a, F>(eligible: &[&'a Worker], score: F) -> Option<&'a Worker>
where
    F: Fn(&Worker) -> f64,
{
    let mut best: Option<(&Worker, f64)> = None;
    for worker in eligible {
        let s = score(worker);
        match best {
            Some((_, best_score)) if s <= best_score => {}
            _ => best = Some((worker, s)),
        }
    }
    best.map(|(w, _)| w)
}
