use std::fmt;

use crate::graph::DependencyGraph;
use crate::model::Unit;

/// Serialisation domain a unit is dispatched into. At most one unit per
/// lane is in flight at any time, except for [`Lane::Free`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Lane {
    /// No constraint beyond pool capacity.
    Free,
    /// One unit of this class at a time.
    Class(String),
    /// One unit bound to this instance at a time.
    Instance(u64),
    /// A thread-affinity chain; runs on its own single-thread pool.
    Affinity(usize),
    /// The run-wide sequential lane.
    Sequential,
}

impl Lane {
    pub fn is_exclusive(&self) -> bool {
        !matches!(self, Self::Free)
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Class(c) => write!(f, "class:{c}"),
            Self::Instance(id) => write!(f, "instance:{id}"),
            Self::Affinity(chain) => write!(f, "affinity:{chain}"),
            Self::Sequential => write!(f, "sequential"),
        }
    }
}

/// Everything the scheduler needs, resolved before the first dispatch.
#[derive(Debug)]
pub struct ExecutionPlan {
    pub units: Vec<Unit>,
    pub graph: DependencyGraph,
    /// Layered topological order; see [`ready_sets`](crate::graph::layers::ready_sets).
    pub ready_sets: Vec<Vec<usize>>,
    /// Lane per unit, indexed like `units`.
    pub lanes: Vec<Lane>,
    /// Number of affinity chains (and single-thread pools) in use.
    pub affinity_chains: usize,
    /// Units that fell back to sequential execution.
    pub downgraded: Vec<usize>,
}

impl ExecutionPlan {
    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    pub fn is_downgraded(&self, unit: usize) -> bool {
        self.downgraded.binary_search(&unit).is_ok()
    }

    /// Unit names in layered order.
    pub fn order(&self) -> Vec<&str> {
        self.ready_sets
            .iter()
            .flatten()
            .map(|&u| self.units[u].name.as_str())
            .collect()
    }
}
