use std::collections::{BTreeMap, HashMap};

use crate::graph::builder::{DependencyGraph, EdgeKind};
use crate::model::Unit;

/// Layer the graph into ready sets with Kahn's algorithm.
///
/// Every unit in a layer has all of its predecessors in earlier layers.
/// Within a layer, units are ordered by `(priority, declaration index)`.
/// The graph must be acyclic, which [`build`](crate::graph::builder::build)
/// guarantees.
pub fn ready_sets(dg: &DependencyGraph, units: &[Unit]) -> Vec<Vec<usize>> {
    let n = dg.unit_count();
    let mut in_degree: Vec<usize> = (0..n).map(|u| dg.predecessors(u).len()).collect();
    let mut current: Vec<usize> = (0..n).filter(|&u| in_degree[u] == 0).collect();
    let mut layers = Vec::new();

    while !current.is_empty() {
        current.sort_by_key(|&u| (units[u].priority, u));
        let mut next = Vec::new();
        for &u in &current {
            for d in dg.dependents(u) {
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    next.push(d);
                }
            }
        }
        layers.push(std::mem::replace(&mut current, next));
    }

    layers
}

/// Topological order: the ready sets, flattened.
pub fn execution_order(dg: &DependencyGraph, units: &[Unit]) -> Vec<usize> {
    ready_sets(dg, units).into_iter().flatten().collect()
}

/// Group units into thread-affinity chains.
///
/// A unit with exactly one direct unit dependency (and no group
/// dependency) joins its predecessor's chain. Units left unchained that
/// declare a non-zero priority share one chain per class. Chains with a
/// single member are dropped, so the result only pins units that are
/// actually linked. Returned ids are dense, starting at zero, in the order
/// chains are first seen along the topological order.
pub fn affinity_chains(dg: &DependencyGraph, units: &[Unit]) -> Vec<Option<usize>> {
    let order = execution_order(dg, units);
    let mut chain: Vec<Option<usize>> = vec![None; units.len()];
    let mut next_chain = 0;

    for &u in &order {
        let preds = dg.predecessors(u);
        let only_unit_edge = preds.len() == 1
            && units[u].depends_on_groups.is_empty()
            && dg
                .graph
                .find_edge(dg.node_indices[preds[0]], dg.node_indices[u])
                .is_some_and(|e| dg.graph[e] == EdgeKind::Unit);
        if !only_unit_edge {
            continue;
        }
        let pred = preds[0];
        let id = *chain[pred].get_or_insert_with(|| {
            next_chain += 1;
            next_chain - 1
        });
        chain[u] = Some(id);
    }

    let mut by_class: HashMap<&str, usize> = HashMap::new();
    for &u in &order {
        if chain[u].is_some() || units[u].priority == 0 {
            continue;
        }
        let id = *by_class.entry(units[u].class.as_str()).or_insert_with(|| {
            next_chain += 1;
            next_chain - 1
        });
        chain[u] = Some(id);
    }

    let mut members: BTreeMap<usize, usize> = BTreeMap::new();
    for id in chain.iter().flatten() {
        *members.entry(*id).or_default() += 1;
    }

    let mut dense: HashMap<usize, usize> = HashMap::new();
    for &u in &order {
        chain[u] = match chain[u] {
            Some(id) if members[&id] > 1 => {
                let len = dense.len();
                Some(*dense.entry(id).or_insert(len))
            }
            _ => None,
        };
    }
    chain
}
