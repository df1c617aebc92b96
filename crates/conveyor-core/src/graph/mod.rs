//! In-memory dependency DAG
//!
//! Tracks job-to-prerequisite edges in two mutually consistent adjacency
//! maps, enforces acyclicity at insertion time, and turns job status
//! changes into readiness events for the queue.
//!
//! All mutations happen under one exclusive section; long scans (full
//! cycle sweeps, structural validation) run over snapshot copies.

mod cycles;

pub use cycles::{CycleReport, CycleSeverity};

use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::DependencyConfig;
use crate::models::{DependencyKind, JobId, JobStatus, ELEVATED_PRIORITY};

/// Dependency graph error types
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("job {0} cannot depend on itself")]
    SelfDependency(JobId),

    #[error("unknown job {0}")]
    UnknownJob(JobId),

    #[error("edge would create a cycle through {} job(s)", path.len())]
    WouldCycle { path: Vec<JobId> },
}

impl GraphError {
    /// Reason tag for the uniform handler contract
    pub fn reason(&self) -> &'static str {
        match self {
            GraphError::SelfDependency(_) => "self_dependency",
            GraphError::UnknownJob(_) => "unknown_dep",
            GraphError::WouldCycle { .. } => "would_cycle",
        }
    }
}

/// Outcome of an edge insertion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeInsert {
    /// Edge added
    Added,

    /// Edge already present; nothing changed
    Duplicate,
}

/// Children released or permanently blocked by a status change
#[derive(Debug, Default, Clone)]
pub struct ReadinessChange {
    /// Children whose every incoming edge is now satisfied
    pub ready: Vec<JobId>,

    /// Children with an edge that can never be satisfied (e.g. a
    /// MUST_SUCCEED parent that failed)
    pub blocked: Vec<JobId>,
}

/// Structural warning from `validate`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphWarning {
    /// Node with no edges in either direction
    Orphan(JobId),

    /// Dependency chain deeper than the configured threshold
    DeepChain { depth: usize, head: JobId },
}

#[derive(Debug, Clone)]
struct NodeInfo {
    status: JobStatus,
    priority: u32,
}

#[derive(Debug, Clone)]
struct EdgeState {
    kind: DependencyKind,
    satisfied: bool,
}

#[derive(Debug, Default, Clone)]
struct GraphState {
    nodes: HashMap<JobId, NodeInfo>,

    /// child -> parents it waits on
    deps: HashMap<JobId, HashSet<JobId>>,

    /// parent -> children waiting on it
    dependents: HashMap<JobId, HashSet<JobId>>,

    /// (child, parent) -> edge state
    edges: HashMap<(JobId, JobId), EdgeState>,
}

impl GraphState {
    fn all_edges_satisfied(&self, child: &JobId) -> bool {
        match self.deps.get(child) {
            Some(parents) => parents.iter().all(|p| {
                self.edges
                    .get(&(*child, *p))
                    .map(|e| e.satisfied)
                    .unwrap_or(true)
            }),
            None => true,
        }
    }

    fn is_pending(&self, job_id: &JobId) -> bool {
        self.nodes
            .get(job_id)
            .map(|n| n.status == JobStatus::Pending)
            .unwrap_or(false)
    }
}

/// In-memory dependency DAG with cycle rejection
pub struct DependencyGraph {
    config: DependencyConfig,
    state: RwLock<GraphState>,
}

impl DependencyGraph {
    /// Create an empty graph
    pub fn new(config: DependencyConfig) -> Self {
        Self {
            config,
            state: RwLock::new(GraphState::default()),
        }
    }

    /// Register a job node. Idempotent; refreshes priority on re-add.
    pub async fn add_node(&self, job_id: JobId, priority: u32) {
        let mut state = self.state.write().await;
        state
            .nodes
            .entry(job_id)
            .and_modify(|n| n.priority = priority)
            .or_insert(NodeInfo {
                status: JobStatus::Pending,
                priority,
            });
    }

    /// Record a job's current status without computing readiness effects
    pub async fn set_node_status(&self, job_id: &JobId, status: JobStatus) {
        let mut state = self.state.write().await;
        if let Some(node) = state.nodes.get_mut(job_id) {
            node.status = status;
        }
    }

    /// Drop a node and every edge touching it
    pub async fn remove_node(&self, job_id: &JobId) {
        let mut state = self.state.write().await;

        let parents = state.deps.remove(job_id).unwrap_or_default();
        for parent in &parents {
            if let Some(children) = state.dependents.get_mut(parent) {
                children.remove(job_id);
            }
            state.edges.remove(&(*job_id, *parent));
        }

        let children = state.dependents.remove(job_id).unwrap_or_default();
        for child in &children {
            if let Some(ps) = state.deps.get_mut(child) {
                ps.remove(job_id);
            }
            state.edges.remove(&(*child, *job_id));
        }

        state.nodes.remove(job_id);
    }

    /// Add a dependency edge: `child` waits on `parent`.
    ///
    /// Rejects self-edges, unknown endpoints, and edges that would close a
    /// cycle. Re-adding an existing edge is a warning, not an error, and
    /// leaves the graph unchanged.
    pub async fn add_edge(
        &self,
        child: JobId,
        parent: JobId,
        kind: DependencyKind,
    ) -> Result<EdgeInsert, GraphError> {
        if child == parent {
            return Err(GraphError::SelfDependency(child));
        }

        let mut state = self.state.write().await;

        if !state.nodes.contains_key(&child) {
            return Err(GraphError::UnknownJob(child));
        }
        if !state.nodes.contains_key(&parent) {
            return Err(GraphError::UnknownJob(parent));
        }

        if state.edges.contains_key(&(child, parent)) {
            warn!("duplicate dependency edge ignored: child={}, parent={}", child, parent);
            return Ok(EdgeInsert::Duplicate);
        }

        // Exhaustive DFS from the parent along the deps direction: if the
        // child is reachable, this edge would close a cycle. Acyclicity
        // is enforced here, not by the periodic sweep.
        if let Some(mut path) = self.probe_cycle(&state, &child, &parent) {
            debug!(
                "edge rejected, would cycle: child={}, parent={}, path_len={}",
                child,
                parent,
                path.len()
            );
            path.truncate(self.config.max_cycle_probe_depth);
            return Err(GraphError::WouldCycle { path });
        }

        state.deps.entry(child).or_default().insert(parent);
        state.dependents.entry(parent).or_default().insert(child);

        // Edges against already-resolved parents are born satisfied
        let parent_status = state.nodes[&parent].status;
        let edge = EdgeState {
            kind,
            satisfied: crate::models::JobDependency::new(child, parent, kind)
                .is_satisfied_by(parent_status, self.config.conditional_propagation),
        };
        state.edges.insert((child, parent), edge);

        debug!("dependency edge added: child={}, parent={}, kind={}", child, parent, kind);
        Ok(EdgeInsert::Added)
    }

    /// Remove an edge. Idempotent.
    pub async fn remove_edge(&self, child: &JobId, parent: &JobId) {
        let mut state = self.state.write().await;

        if state.edges.remove(&(*child, *parent)).is_some() {
            if let Some(parents) = state.deps.get_mut(child) {
                parents.remove(parent);
                if parents.is_empty() {
                    state.deps.remove(child);
                }
            }
            if let Some(children) = state.dependents.get_mut(parent) {
                children.remove(child);
                if children.is_empty() {
                    state.dependents.remove(parent);
                }
            }
        }
    }

    /// PENDING jobs whose every incoming edge is satisfied
    pub async fn jobs_ready(&self) -> Vec<JobId> {
        let state = self.state.read().await;
        state
            .nodes
            .iter()
            .filter(|(_, node)| node.status == JobStatus::Pending)
            .filter(|(id, _)| state.all_edges_satisfied(id))
            .map(|(id, _)| *id)
            .collect()
    }

    /// A parent started running: satisfy MUST_START edges and return the
    /// children that became ready.
    pub async fn on_job_started(&self, job_id: &JobId) -> ReadinessChange {
        self.apply_status(job_id, JobStatus::Running).await
    }

    /// A parent reached a terminal outcome: satisfy every consistent
    /// outgoing edge and return the children that became ready, plus the
    /// children now permanently blocked.
    pub async fn on_job_completed(&self, job_id: &JobId, outcome: JobStatus) -> ReadinessChange {
        if !outcome.is_terminal() {
            warn!("on_job_completed called with non-terminal status: job={}, status={}", job_id, outcome);
            return ReadinessChange::default();
        }
        self.apply_status(job_id, outcome).await
    }

    async fn apply_status(&self, job_id: &JobId, status: JobStatus) -> ReadinessChange {
        let mut state = self.state.write().await;

        if let Some(node) = state.nodes.get_mut(job_id) {
            node.status = status;
        }

        let children: Vec<JobId> = state
            .dependents
            .get(job_id)
            .map(|c| c.iter().copied().collect())
            .unwrap_or_default();

        let mut change = ReadinessChange::default();

        for child in children {
            let Some(edge) = state.edges.get(&(child, *job_id)) else {
                continue;
            };

            let probe =
                crate::models::JobDependency::new(child, *job_id, edge.kind);

            if probe.is_satisfied_by(status, self.config.conditional_propagation) {
                if let Some(edge) = state.edges.get_mut(&(child, *job_id)) {
                    if edge.satisfied {
                        continue;
                    }
                    edge.satisfied = true;
                }
                if state.is_pending(&child) && state.all_edges_satisfied(&child) {
                    change.ready.push(child);
                }
            } else if probe.is_blocked_by(status, self.config.conditional_propagation)
                && state.is_pending(&child)
            {
                change.blocked.push(child);
            }
        }

        change
    }

    /// Full-graph cycle sweep over a snapshot (iterative Tarjan SCC).
    /// Insertion-time probing should keep this empty; the periodic
    /// invariant check calls it anyway.
    pub async fn detect_cycles(&self) -> Vec<CycleReport> {
        let (adjacency, priorities) = {
            let state = self.state.read().await;
            let adjacency: HashMap<JobId, Vec<JobId>> = state
                .nodes
                .keys()
                .map(|id| {
                    let parents = state
                        .deps
                        .get(id)
                        .map(|p| p.iter().copied().collect())
                        .unwrap_or_default();
                    (*id, parents)
                })
                .collect();
            let priorities: HashMap<JobId, u32> = state
                .nodes
                .iter()
                .map(|(id, node)| (*id, node.priority))
                .collect();
            (adjacency, priorities)
        };

        cycles::find_cycles(&adjacency, |jobs| {
            jobs.iter()
                .any(|id| priorities.get(id).copied().unwrap_or(0) >= ELEVATED_PRIORITY)
        })
    }

    /// Structural warnings: isolated nodes and unusually deep chains
    pub async fn validate(&self) -> Vec<GraphWarning> {
        let state = self.state.read().await;
        let mut warnings = Vec::new();

        for id in state.nodes.keys() {
            let has_parents = state.deps.get(id).map(|p| !p.is_empty()).unwrap_or(false);
            let has_children = state
                .dependents
                .get(id)
                .map(|c| !c.is_empty())
                .unwrap_or(false);
            if !has_parents && !has_children {
                warnings.push(GraphWarning::Orphan(*id));
            }
        }

        // Longest chain per node over the DAG, memoized
        let mut depth_memo: HashMap<JobId, usize> = HashMap::new();
        for id in state.nodes.keys() {
            let depth = chain_depth(&state.deps, id, &mut depth_memo);
            if depth > self.config.deep_chain_threshold {
                warnings.push(GraphWarning::DeepChain { depth, head: *id });
            }
        }

        warnings
    }

    /// Number of tracked nodes
    pub async fn node_count(&self) -> usize {
        self.state.read().await.nodes.len()
    }

    /// Number of tracked edges
    pub async fn edge_count(&self) -> usize {
        self.state.read().await.edges.len()
    }

    /// DFS from `parent` along deps: returns a probe path when `child` is
    /// reachable (the new edge would close a cycle). The search visits
    /// every reachable node once, so no cycle escapes insertion-time
    /// rejection whatever the chain length; the recorded path is capped
    /// for diagnostics by the caller.
    fn probe_cycle(
        &self,
        state: &GraphState,
        child: &JobId,
        parent: &JobId,
    ) -> Option<Vec<JobId>> {
        let mut stack: Vec<(JobId, usize)> = vec![(*parent, 0)];
        let mut path: Vec<JobId> = Vec::new();
        let mut visited: HashSet<JobId> = HashSet::new();

        while let Some((node, depth)) = stack.pop() {
            path.truncate(depth);
            path.push(node);

            if node == *child {
                return Some(path);
            }

            if !visited.insert(node) {
                continue;
            }

            if let Some(parents) = state.deps.get(&node) {
                for next in parents {
                    stack.push((*next, depth + 1));
                }
            }
        }

        None
    }
}

fn chain_depth(
    deps: &HashMap<JobId, HashSet<JobId>>,
    id: &JobId,
    memo: &mut HashMap<JobId, usize>,
) -> usize {
    if let Some(depth) = memo.get(id) {
        return *depth;
    }
    // Acyclicity is enforced at insertion, so plain recursion terminates
    let depth = deps
        .get(id)
        .map(|parents| {
            parents
                .iter()
                .map(|p| chain_depth(deps, p, memo) + 1)
                .max()
                .unwrap_or(0)
        })
        .unwrap_or(0);
    memo.insert(*id, depth);
    depth
}
