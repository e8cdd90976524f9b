//! Ready-set bookkeeping for the executor.
//!
//! [`ReadyQueue`] orders dispatchable steps by explicit priority (higher
//! first), then by declaration order. [`Readiness`] decides whether a pending
//! step can be dispatched, is blocked, or must be skipped, from the states of
//! its dependencies.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashSet};

use weft_types::run::StepState;

use super::graph::Graph;

// ---------------------------------------------------------------------------
// ReadyQueue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    priority: i32,
    /// Declaration index; lower dispatches first on equal priority.
    index: usize,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.index.cmp(&self.index))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Max-heap of ready step indices.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    heap: BinaryHeap<Entry>,
    queued: HashSet<usize>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a step once; repeated pushes of a queued step are ignored.
    pub fn push(&mut self, index: usize, priority: i32) -> bool {
        if !self.queued.insert(index) {
            return false;
        }
        self.heap.push(Entry { priority, index });
        true
    }

    pub fn pop(&mut self) -> Option<usize> {
        let entry = self.heap.pop()?;
        self.queued.remove(&entry.index);
        Some(entry.index)
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.queued.clear();
    }
}

// ---------------------------------------------------------------------------
// Readiness
// ---------------------------------------------------------------------------

/// Where a pending step stands with respect to its dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Every dependency is terminal and satisfied; the condition may be evaluated.
    Satisfied,
    /// At least one dependency has not finished.
    Blocked,
    /// A dependency finished in a way that can never satisfy this step.
    Unsatisfiable { dependency: String },
}

/// Check the dependencies of step `index` against current step states.
pub fn readiness(graph: &Graph, index: usize, steps: &BTreeMap<String, StepState>) -> Readiness {
    let mut blocked = false;
    for &dep in &graph.node(index).deps {
        let dep_id = graph.node(dep).def.id.as_str();
        let Some(state) = steps.get(dep_id) else {
            return Readiness::Unsatisfiable {
                dependency: dep_id.to_string(),
            };
        };
        if !state.status.is_terminal() {
            blocked = true;
            continue;
        }
        if !state.satisfies_dependents() {
            return Readiness::Unsatisfiable {
                dependency: dep_id.to_string(),
            };
        }
    }
    if blocked {
        Readiness::Blocked
    } else {
        Readiness::Satisfied
    }
}
