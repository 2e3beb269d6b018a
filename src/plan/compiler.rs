use tracing::debug;

use crate::config::{ParallelMode, RunConfig};
use crate::error::ConfigError;
use crate::graph::layers::{affinity_chains, ready_sets};
use crate::graph::{self, DependencyGraph};
use crate::model::{ParallelHint, Unit};
use crate::plan::types::{ExecutionPlan, Lane};

/// Compile declared units into an execution plan.
///
/// Resolves the dependency graph, layers it, and assigns every unit a lane
/// according to the run's parallel mode, thread affinity and strictness.
///
/// # Errors
///
/// Returns [`ConfigError`] if the graph cannot be built.
pub fn compile(units: Vec<Unit>, config: &RunConfig) -> Result<ExecutionPlan, ConfigError> {
    let graph = graph::build(&units)?;
    let ready_sets = ready_sets(&graph, &units);

    let chains = if config.thread_affinity && config.parallel != ParallelMode::None {
        affinity_chains(&graph, &units)
    } else {
        vec![None; units.len()]
    };
    let affinity_count = chains.iter().flatten().max().map_or(0, |m| m + 1);

    let mut lanes = Vec::with_capacity(units.len());
    let mut downgraded = Vec::new();
    for (i, unit) in units.iter().enumerate() {
        let lane = if let Some(chain) = chains[i] {
            Lane::Affinity(chain)
        } else if is_ambiguous(unit, i, &graph, config) {
            debug!(unit = %unit.name, "ambiguous parallel unit falls back to sequential");
            downgraded.push(i);
            Lane::Sequential
        } else {
            lane_for(unit, config.parallel)
        };
        lanes.push(lane);
    }

    debug!(
        units = units.len(),
        layers = ready_sets.len(),
        affinity_chains = affinity_count,
        downgraded = downgraded.len(),
        "compiled execution plan"
    );

    Ok(ExecutionPlan {
        units,
        graph,
        ready_sets,
        lanes,
        affinity_chains: affinity_count,
        downgraded,
    })
}

/// A unit that does not say how it wants to run but whose ordering
/// constraints make concurrent execution questionable.
fn is_ambiguous(unit: &Unit, index: usize, graph: &DependencyGraph, config: &RunConfig) -> bool {
    !config.strict_parallel
        && config.parallel != ParallelMode::None
        && unit.parallel == ParallelHint::Inherit
        && (graph.is_linked(index) || unit.priority != 0)
}

fn lane_for(unit: &Unit, mode: ParallelMode) -> Lane {
    if unit.parallel == ParallelHint::Sequential {
        return Lane::Sequential;
    }
    match mode {
        ParallelMode::None => Lane::Sequential,
        ParallelMode::Methods => Lane::Free,
        ParallelMode::Classes => Lane::Class(unit.class.clone()),
        ParallelMode::Instances => match &unit.instance {
            Some(instance) => Lane::Instance(instance.id()),
            None => Lane::Class(unit.class.clone()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InvocationError;
    use crate::model::{Instance, InvocationContext};

    fn noop(_: &InvocationContext<'_>) -> Result<(), InvocationError> {
        Ok(())
    }

    fn unit(name: &str) -> Unit {
        Unit::new(name, noop)
    }

    fn config(parallel: ParallelMode) -> RunConfig {
        RunConfig {
            parallel,
            ..RunConfig::default()
        }
    }

    #[test]
    fn no_parallelism_is_one_sequential_lane() {
        let plan = compile(vec![unit("a"), unit("b")], &RunConfig::default()).unwrap();
        assert_eq!(plan.lanes, vec![Lane::Sequential, Lane::Sequential]);
        assert!(plan.downgraded.is_empty());
    }

    #[test]
    fn methods_mode_frees_independent_units() {
        let plan = compile(vec![unit("a"), unit("b")], &config(ParallelMode::Methods)).unwrap();
        assert_eq!(plan.lanes, vec![Lane::Free, Lane::Free]);
    }

    #[test]
    fn classes_mode_lanes_by_class() {
        let plan = compile(
            vec![unit("a").in_class("A"), unit("b").in_class("B")],
            &config(ParallelMode::Classes),
        )
        .unwrap();
        assert_eq!(
            plan.lanes,
            vec![Lane::Class("A".into()), Lane::Class("B".into())]
        );
    }

    #[test]
    fn instances_mode_lanes_by_instance() {
        let i1 = Instance::new("Sample", 1);
        let i2 = Instance::new("Sample", 2);
        let plan = compile(
            vec![
                unit("a").on_instance(i1.clone()),
                unit("b").on_instance(i2.clone()),
            ],
            &config(ParallelMode::Instances),
        )
        .unwrap();
        assert_eq!(
            plan.lanes,
            vec![Lane::Instance(i1.id()), Lane::Instance(i2.id())]
        );
    }

    #[test]
    fn ambiguous_units_are_downgraded() {
        let plan = compile(
            vec![unit("a"), unit("b").depends_on(["a"]), unit("c")],
            &config(ParallelMode::Methods),
        )
        .unwrap();
        assert_eq!(plan.lanes, vec![Lane::Sequential, Lane::Sequential, Lane::Free]);
        assert_eq!(plan.downgraded, vec![0, 1]);
        assert!(plan.is_downgraded(1));
        assert!(!plan.is_downgraded(2));
    }

    #[test]
    fn strict_parallel_never_downgrades() {
        let cfg = RunConfig {
            strict_parallel: true,
            ..config(ParallelMode::Methods)
        };
        let plan = compile(vec![unit("a"), unit("b").depends_on(["a"])], &cfg).unwrap();
        assert_eq!(plan.lanes, vec![Lane::Free, Lane::Free]);
        assert!(plan.downgraded.is_empty());
    }

    #[test]
    fn explicit_hints_are_honoured() {
        let plan = compile(
            vec![
                unit("a").parallel(ParallelHint::Parallel),
                unit("b")
                    .depends_on(["a"])
                    .parallel(ParallelHint::Sequential),
            ],
            &config(ParallelMode::Methods),
        )
        .unwrap();
        assert_eq!(plan.lanes, vec![Lane::Free, Lane::Sequential]);
        assert!(plan.downgraded.is_empty());
    }

    #[test]
    fn affinity_assigns_chain_lanes() {
        let cfg = RunConfig {
            thread_affinity: true,
            ..config(ParallelMode::Methods)
        };
        let plan = compile(
            vec![unit("a"), unit("b").depends_on(["a"]), unit("c")],
            &cfg,
        )
        .unwrap();
        assert_eq!(
            plan.lanes,
            vec![Lane::Affinity(0), Lane::Affinity(0), Lane::Free]
        );
        assert_eq!(plan.affinity_chains, 1);
    }

    #[test]
    fn configuration_errors_surface() {
        let err = compile(vec![unit("a").depends_on(["missing"])], &RunConfig::default());
        assert!(matches!(err, Err(ConfigError::UnresolvedDependency { .. })));
    }

    #[test]
    fn order_follows_layers() {
        let plan = compile(
            vec![unit("b").depends_on(["a"]), unit("a")],
            &RunConfig::default(),
        )
        .unwrap();
        assert_eq!(plan.order(), vec!["a", "b"]);
    }
}
