//! Full-graph cycle detection via iterative Tarjan SCC
//!
//! Any strongly connected component of size > 1, or any self-loop, is a
//! cycle. Runs over a snapshot copy of the adjacency, never under the
//! graph's write section.

use std::collections::HashMap;

use crate::models::JobId;

/// Cycle severity for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleSeverity {
    Low,
    High,
}

/// One elementary cycle found in the graph
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// Jobs participating in the cycle
    pub jobs: Vec<JobId>,

    /// Cycle length
    pub length: usize,

    /// High when the cycle is long (>= 3) or touches elevated-priority jobs
    pub severity: CycleSeverity,
}

impl CycleReport {
    fn new(jobs: Vec<JobId>, elevated: bool) -> Self {
        let length = jobs.len();
        let severity = if length >= 3 || elevated {
            CycleSeverity::High
        } else {
            CycleSeverity::Low
        };
        Self {
            jobs,
            length,
            severity,
        }
    }
}

#[derive(Default)]
struct TarjanState {
    index_counter: usize,
    indices: HashMap<JobId, usize>,
    lowlinks: HashMap<JobId, usize>,
    on_stack: HashMap<JobId, bool>,
    stack: Vec<JobId>,
    components: Vec<Vec<JobId>>,
}

/// Find all cycles in `adjacency`. `is_elevated` reports whether any job
/// in a candidate cycle carries elevated priority.
pub fn find_cycles<F>(adjacency: &HashMap<JobId, Vec<JobId>>, is_elevated: F) -> Vec<CycleReport>
where
    F: Fn(&[JobId]) -> bool,
{
    let mut state = TarjanState::default();

    let mut roots: Vec<JobId> = adjacency.keys().copied().collect();
    roots.sort(); // deterministic traversal order

    for root in roots {
        if !state.indices.contains_key(&root) {
            strong_connect(root, adjacency, &mut state);
        }
    }

    let mut reports = Vec::new();
    for mut component in state.components {
        if component.len() > 1 {
            component.sort();
            let elevated = is_elevated(&component);
            reports.push(CycleReport::new(component, elevated));
        } else if let Some(only) = component.first() {
            // SCC of one is a cycle only when the node points at itself
            let self_loop = adjacency
                .get(only)
                .map(|next| next.contains(only))
                .unwrap_or(false);
            if self_loop {
                let elevated = is_elevated(&component);
                reports.push(CycleReport::new(component, elevated));
            }
        }
    }

    reports
}

/// Iterative strongconnect: an explicit frame stack stands in for the
/// recursion in Tarjan's original formulation.
fn strong_connect(root: JobId, adjacency: &HashMap<JobId, Vec<JobId>>, state: &mut TarjanState) {
    // (node, index of the next neighbor to visit)
    let mut frames: Vec<(JobId, usize)> = vec![(root, 0)];

    while let Some((node, neighbor_idx)) = frames.pop() {
        if neighbor_idx == 0 {
            let idx = state.index_counter;
            state.index_counter += 1;
            state.indices.insert(node, idx);
            state.lowlinks.insert(node, idx);
            state.stack.push(node);
            state.on_stack.insert(node, true);
        }

        let neighbors = adjacency.get(&node).cloned().unwrap_or_default();
        let mut descended = false;

        for (i, next) in neighbors.iter().enumerate().skip(neighbor_idx) {
            match state.indices.get(next) {
                None => {
                    // Descend; resume this frame at the following neighbor
                    frames.push((node, i + 1));
                    frames.push((*next, 0));
                    descended = true;
                    break;
                }
                Some(next_index) => {
                    if state.on_stack.get(next).copied().unwrap_or(false) {
                        let low = state.lowlinks[&node].min(*next_index);
                        state.lowlinks.insert(node, low);
                    }
                }
            }
        }

        if descended {
            continue;
        }

        // Node finished: fold its lowlink into the parent frame
        if let Some((parent, _)) = frames.last() {
            let low = state.lowlinks[parent].min(state.lowlinks[&node]);
            state.lowlinks.insert(*parent, low);
        }

        if state.lowlinks[&node] == state.indices[&node] {
            let mut component = Vec::new();
            while let Some(top) = state.stack.pop() {
                state.on_stack.insert(top, false);
                component.push(top);
                if top == node {
                    break;
                }
            }
            state.components.push(component);
        }
    }
}
