use std::collections::{BTreeMap, HashMap};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::debug;

use crate::error::ConfigError;
use crate::graph::analysis::find_cycle;
use crate::model::Unit;

/// Why an edge exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeKind {
    /// Explicit dependency on a unit by name.
    Unit,
    /// Membership of the upstream unit in a group the dependent depends on.
    Group(String),
}

/// Dependency graph over the declared units, backed by petgraph.
///
/// Node weights are indices into the unit table; an edge `a -> b` means `a`
/// must reach a terminal outcome before `b` is dispatched. All names are
/// resolved here, so nothing is looked up by name during a run.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    pub graph: DiGraph<usize, EdgeKind>,
    pub node_indices: Vec<NodeIndex>,
    pub(crate) names: Vec<String>,
}

impl DependencyGraph {
    pub fn unit_count(&self) -> usize {
        self.node_indices.len()
    }

    pub fn name(&self, unit: usize) -> &str {
        &self.names[unit]
    }

    /// Units that must finish before `unit`, ascending and deduplicated.
    pub fn predecessors(&self, unit: usize) -> Vec<usize> {
        self.neighbors(unit, Direction::Incoming)
    }

    /// Units waiting on `unit`, ascending and deduplicated.
    pub fn dependents(&self, unit: usize) -> Vec<usize> {
        self.neighbors(unit, Direction::Outgoing)
    }

    fn neighbors(&self, unit: usize, dir: Direction) -> Vec<usize> {
        let mut out: Vec<usize> = self
            .graph
            .neighbors_directed(self.node_indices[unit], dir)
            .map(|n| self.graph[n])
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Whether `unit` has any incoming or outgoing dependency edge.
    pub fn is_linked(&self, unit: usize) -> bool {
        let idx = self.node_indices[unit];
        self.graph
            .neighbors_directed(idx, Direction::Incoming)
            .next()
            .is_some()
            || self
                .graph
                .neighbors_directed(idx, Direction::Outgoing)
                .next()
                .is_some()
    }
}

/// Resolve every dependency of `units` into graph edges.
///
/// # Errors
///
/// Returns a [`ConfigError`] if:
/// - two units share a name
/// - a unit depends on a unit name that does not exist
/// - an instance-bound source is declared on a unit without an instance
/// - the dependencies form a cycle
///
/// A dependency on a group nobody belongs to is satisfied vacuously.
pub fn build(units: &[Unit]) -> Result<DependencyGraph, ConfigError> {
    let mut by_name: HashMap<&str, usize> = HashMap::with_capacity(units.len());
    for (i, unit) in units.iter().enumerate() {
        if by_name.insert(unit.name.as_str(), i).is_some() {
            return Err(ConfigError::DuplicateUnit(unit.name.clone()));
        }
        if let Some(source) = &unit.source
            && source.is_instance_bound()
            && unit.instance.is_none()
        {
            return Err(ConfigError::InstanceBoundWithoutInstance {
                unit: unit.name.clone(),
                provider: source.name().to_owned(),
            });
        }
    }

    let mut members: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, unit) in units.iter().enumerate() {
        for group in &unit.groups {
            members.entry(group.as_str()).or_default().push(i);
        }
    }

    let mut graph = DiGraph::with_capacity(units.len(), 0);
    let node_indices: Vec<NodeIndex> = (0..units.len()).map(|i| graph.add_node(i)).collect();

    for (i, unit) in units.iter().enumerate() {
        for dep in &unit.depends_on {
            let Some(&from) = by_name.get(dep.as_str()) else {
                return Err(ConfigError::UnresolvedDependency {
                    unit: unit.name.clone(),
                    dependency: dep.clone(),
                });
            };
            graph.update_edge(node_indices[from], node_indices[i], EdgeKind::Unit);
        }
        for group in &unit.depends_on_groups {
            let Some(group_members) = members.get(group.as_str()) else {
                debug!(unit = %unit.name, %group, "dependency on empty group");
                continue;
            };
            for &from in group_members.iter().filter(|&&m| m != i) {
                if graph.find_edge(node_indices[from], node_indices[i]).is_none() {
                    graph.add_edge(
                        node_indices[from],
                        node_indices[i],
                        EdgeKind::Group(group.clone()),
                    );
                }
            }
        }
    }

    let dg = DependencyGraph {
        graph,
        node_indices,
        names: units.iter().map(|u| u.name.clone()).collect(),
    };

    if let Some(cycle) = find_cycle(&dg) {
        return Err(ConfigError::DependencyCycle(cycle));
    }

    debug!(
        units = dg.unit_count(),
        edges = dg.graph.edge_count(),
        "built dependency graph"
    );
    Ok(dg)
}
