use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::Direction;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::NodeIndex;

use crate::graph::builder::DependencyGraph;

/// Returns `true` if the graph contains a cycle.
pub fn has_cycle(dg: &DependencyGraph) -> bool {
    toposort(&dg.graph, None).is_err()
}

/// Find a cycle in the graph, returning the unit names along it with the
/// first name repeated at the end. Returns `None` if the graph is acyclic.
///
/// The cycle reported is the one through the earliest declared unit that
/// sits on any cycle. No step recurses, so long dependency chains are fine.
pub fn find_cycle(dg: &DependencyGraph) -> Option<Vec<String>> {
    if !has_cycle(dg) {
        return None;
    }

    let (start, component) = tarjan_scc(&dg.graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || dg.graph.contains_edge(scc[0], scc[0]))
        .filter_map(|scc| {
            let start = scc.iter().copied().min_by_key(|&n| dg.graph[n])?;
            Some((start, scc.into_iter().collect::<HashSet<_>>()))
        })
        .min_by_key(|(start, _)| dg.graph[*start])?;

    let path = shortest_loop(dg, start, &component)?;
    let mut names: Vec<String> = path
        .iter()
        .map(|&n| dg.name(dg.graph[n]).to_owned())
        .collect();
    names.push(dg.name(dg.graph[start]).to_owned());
    Some(names)
}

/// Breadth-first search inside one strongly connected component for the
/// shortest path that leaves `start` and comes back to it.
fn shortest_loop(
    dg: &DependencyGraph,
    start: NodeIndex,
    component: &HashSet<NodeIndex>,
) -> Option<Vec<NodeIndex>> {
    let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut queue = VecDeque::from([start]);

    while let Some(node) = queue.pop_front() {
        let mut next: Vec<NodeIndex> = dg
            .graph
            .neighbors_directed(node, Direction::Outgoing)
            .filter(|n| component.contains(n))
            .collect();
        next.sort_by_key(|&n| dg.graph[n]);

        for neighbor in next {
            if neighbor == start {
                let mut path = vec![node];
                let mut current = node;
                while let Some(&p) = parent.get(&current) {
                    path.push(p);
                    current = p;
                }
                path.reverse();
                return Some(path);
            }
            if !parent.contains_key(&neighbor) {
                parent.insert(neighbor, node);
                queue.push_back(neighbor);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use petgraph::graph::DiGraph;

    use crate::graph::builder::{EdgeKind, build};
    use crate::model::{InvocationContext, Unit};

    fn noop(_: &InvocationContext<'_>) -> Result<(), crate::error::InvocationError> {
        Ok(())
    }

    #[test]
    fn acyclic_graph_has_no_cycle() {
        let dg = build(&[
            Unit::new("a", noop),
            Unit::new("b", noop).depends_on(["a"]),
        ])
        .unwrap();
        assert!(!has_cycle(&dg));
        assert!(find_cycle(&dg).is_none());
    }

    fn chain(len: usize) -> Vec<Unit> {
        (0..len)
            .map(|i| {
                let unit = Unit::new(format!("u{i}"), noop);
                if i == 0 {
                    unit
                } else {
                    unit.depends_on([format!("u{}", i - 1)])
                }
            })
            .collect()
    }

    #[test]
    fn long_chain_is_acyclic() {
        let dg = build(&chain(20_000)).unwrap();
        assert!(find_cycle(&dg).is_none());
    }

    #[test]
    fn long_cycle_is_reported_in_full() {
        let mut units = chain(5_000);
        units[0] = Unit::new("u0", noop).depends_on(["u4999"]);
        let err = build(&units).unwrap_err();
        let crate::error::ConfigError::DependencyCycle(path) = err else {
            panic!("expected a cycle error");
        };
        assert_eq!(path.len(), 5_001);
        assert_eq!(path.first().map(String::as_str), Some("u0"));
        assert_eq!(path.last().map(String::as_str), Some("u0"));
    }

    #[test]
    fn detects_cycle_on_raw_graph() {
        // `build` refuses cycles, so assemble one by hand.
        let dg = build(&[Unit::new("a", noop), Unit::new("b", noop)]).unwrap();
        let mut graph: DiGraph<usize, EdgeKind> = dg.graph.clone();
        graph.add_edge(dg.node_indices[0], dg.node_indices[1], EdgeKind::Unit);
        graph.add_edge(dg.node_indices[1], dg.node_indices[0], EdgeKind::Unit);
        let cyclic = DependencyGraph { graph, ..dg };
        assert!(has_cycle(&cyclic));
        assert_eq!(
            find_cycle(&cyclic),
            Some(vec!["a".to_owned(), "b".to_owned(), "a".to_owned()])
        );
    }
}
