use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::error::{Cause, ConfigError, InvocationError, RunError};
use crate::model::Unit;
use crate::plan::{ExecutionPlan, Lane, compile};
use crate::runner::context::{AbortHandle, RunContext};
use crate::runner::executor::execute_unit;
use crate::runner::notify::{Notifier, RunListener};
use crate::runner::pool::{Executor, ExecutorFactory, Job, WorkerPoolFactory};
use crate::runner::result::{InvocationRecord, Outcome, RunResult, UnitResult};
use crate::util::panic_message;

/// The test-orchestration engine.
///
/// Built from a [`RunConfig`], optionally with listeners and a custom
/// executor factory, then handed the declared units.
pub struct TestEngine {
    config: RunConfig,
    listeners: Vec<Arc<dyn RunListener>>,
    executor_factory: Option<Arc<dyn ExecutorFactory>>,
    abort: AbortHandle,
}

impl TestEngine {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            listeners: Vec::new(),
            executor_factory: None,
            abort: AbortHandle::default(),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn RunListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Replace the built-in worker pools. Not compatible with a shared
    /// data-provider pool.
    pub fn with_executor_factory(mut self, factory: Arc<dyn ExecutorFactory>) -> Self {
        self.executor_factory = Some(factory);
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Validate the configuration and compile `units` without running them.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for invalid option combinations, unresolved
    /// dependencies and cycles.
    pub fn plan(&self, units: Vec<Unit>) -> Result<ExecutionPlan, ConfigError> {
        self.config.validate(self.executor_factory.is_some())?;
        compile(units, &self.config)
    }

    /// Run `units` to completion.
    ///
    /// Every unit ends up in the result, even after an abort.
    ///
    /// # Errors
    ///
    /// Returns [`RunError::Configuration`] before anything is dispatched if
    /// the run cannot be planned, and [`RunError::AllTestsSkipped`] (with
    /// the full result) when that policy is on and nothing but skips came
    /// out of the run.
    pub fn run(&self, units: Vec<Unit>) -> Result<RunResult, RunError> {
        let plan = self.plan(units)?;
        let started = Instant::now();
        info!(
            units = plan.unit_count(),
            parallel = %self.config.parallel,
            threads = self.config.main_pool_size(),
            dry_run = self.config.dry_run,
            "starting run"
        );

        let notifier = Notifier::new(
            self.listeners.clone(),
            self.config.symmetric_listener_execution,
        );
        notifier.run_started(&plan);

        let factory: Arc<dyn ExecutorFactory> = match &self.executor_factory {
            Some(f) => Arc::clone(f),
            None => Arc::new(WorkerPoolFactory),
        };
        let shared_data_pool = self.config.share_data_provider_thread_pool.then(|| {
            factory.create(
                "testloom-data",
                self.config.data_provider_thread_count,
            )
        });
        let main_pool = factory.create("testloom-worker", self.config.main_pool_size());
        let affinity_pools: Vec<Arc<dyn Executor>> = (0..plan.affinity_chains)
            .map(|c| factory.create(&format!("testloom-affinity-{c}"), 1))
            .collect();

        let ctx = Arc::new(RunContext {
            plan,
            config: self.config.clone(),
            notifier,
            abort: self.abort.clone(),
            factory,
            shared_data_pool,
        });

        let units = Dispatcher::new(&ctx, Arc::clone(&main_pool), affinity_pools.clone()).drain();

        main_pool.shutdown();
        for pool in &affinity_pools {
            pool.shutdown();
        }
        if let Some(pool) = &ctx.shared_data_pool {
            pool.shutdown();
        }

        let result = RunResult::new(units, started.elapsed(), self.abort.reason());
        info!(
            invocations = result.summary.invocations,
            passed = result.summary.passed,
            failed = result.summary.failed,
            skipped = result.summary.skipped,
            duration_ms = result.duration.as_millis() as u64,
            "run finished"
        );
        ctx.notifier.run_finished(&result);

        if self.config.fail_if_all_tests_skipped && result.summary.all_skipped() {
            warn!(skipped = result.summary.skipped, "every invocation was skipped");
            return Err(RunError::AllTestsSkipped {
                skipped: result.summary.skipped,
                result: Box::new(result),
            });
        }
        Ok(result)
    }
}

type Completion = (usize, UnitResult);

/// Readiness bookkeeping for one run, owned by the scheduling thread.
struct Dispatcher<'a> {
    ctx: &'a Arc<RunContext>,
    main_pool: Arc<dyn Executor>,
    affinity_pools: Vec<Arc<dyn Executor>>,
    /// Unfinished predecessors per unit.
    waiting_on: Vec<usize>,
    results: Vec<Option<UnitResult>>,
    ready: BinaryHeap<Reverse<(i32, usize)>>,
    busy: HashSet<Lane>,
    class_remaining: HashMap<String, usize>,
    in_flight: usize,
    tx: mpsc::Sender<Completion>,
    rx: mpsc::Receiver<Completion>,
}

impl<'a> Dispatcher<'a> {
    fn new(
        ctx: &'a Arc<RunContext>,
        main_pool: Arc<dyn Executor>,
        affinity_pools: Vec<Arc<dyn Executor>>,
    ) -> Self {
        let plan = &ctx.plan;
        let n = plan.unit_count();
        let waiting_on: Vec<usize> = (0..n).map(|u| plan.graph.predecessors(u).len()).collect();
        let ready = (0..n)
            .filter(|&u| waiting_on[u] == 0)
            .map(|u| Reverse((plan.units[u].priority, u)))
            .collect();
        let mut class_remaining = HashMap::new();
        for unit in plan.units.iter().filter(|u| !u.class.is_empty()) {
            *class_remaining.entry(unit.class.clone()).or_insert(0) += 1;
        }
        let (tx, rx) = mpsc::channel();
        Self {
            ctx,
            main_pool,
            affinity_pools,
            waiting_on,
            results: vec![None; n],
            ready,
            busy: HashSet::new(),
            class_remaining,
            in_flight: 0,
            tx,
            rx,
        }
    }

    fn drain(mut self) -> Vec<UnitResult> {
        let ctx = self.ctx;
        loop {
            self.dispatch_ready();
            if self.in_flight == 0 {
                break;
            }
            let Ok((unit, result)) = self.rx.recv() else {
                break;
            };
            self.in_flight -= 1;
            let lane = &ctx.plan.lanes[unit];
            if lane.is_exclusive() {
                self.busy.remove(lane);
            }
            self.complete(unit, result);
        }

        for u in 0..self.results.len() {
            if self.results[u].is_none() {
                let reason = ctx.aborted_reason();
                self.skip(u, Cause::Aborted { reason });
            }
        }
        self.results.into_iter().flatten().collect()
    }

    /// Dispatch everything that is ready and whose lane is free. Units that
    /// are blocked or aborted are resolved on the spot, which may make more
    /// units ready within the same pass.
    fn dispatch_ready(&mut self) {
        let ctx = self.ctx;
        let mut deferred = Vec::new();
        while let Some(Reverse((priority, u))) = self.ready.pop() {
            if ctx.abort.is_aborted() {
                let reason = ctx.aborted_reason();
                self.skip(u, Cause::Aborted { reason });
                continue;
            }
            if let Some(upstream) = self.blocking_predecessor(u) {
                debug!(unit = %ctx.plan.units[u].name, %upstream, "dependency did not succeed, skipping");
                self.skip(u, Cause::DependencyBlocked { upstream });
                continue;
            }
            let lane = &ctx.plan.lanes[u];
            if lane.is_exclusive() && self.busy.contains(lane) {
                deferred.push(Reverse((priority, u)));
                continue;
            }
            match self.submit(u) {
                Ok(()) => {
                    if lane.is_exclusive() {
                        self.busy.insert(lane.clone());
                    }
                    self.in_flight += 1;
                }
                Err(reason) => {
                    warn!(unit = %ctx.plan.units[u].name, %reason, "could not dispatch unit");
                    self.skip(u, Cause::Aborted { reason });
                }
            }
        }
        self.ready.extend(deferred);
    }

    fn blocking_predecessor(&self, u: usize) -> Option<String> {
        let plan = &self.ctx.plan;
        if plan.units[u].always_run {
            return None;
        }
        plan.graph
            .predecessors(u)
            .into_iter()
            .find(|&p| {
                self.results[p]
                    .as_ref()
                    .is_some_and(UnitResult::blocks_dependents)
            })
            .map(|p| plan.units[p].name.clone())
    }

    fn submit(&self, u: usize) -> Result<(), String> {
        let ctx = Arc::clone(self.ctx);
        let tx = self.tx.clone();
        let job: Job = Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(|| execute_unit(&ctx, u)))
                .unwrap_or_else(|payload| crashed(&ctx.plan.units[u], &panic_message(payload.as_ref())));
            let _ = tx.send((u, result));
        });

        let lane = &self.ctx.plan.lanes[u];
        let pool = match lane {
            Lane::Affinity(chain) => &self.affinity_pools[*chain],
            _ => &self.main_pool,
        };
        debug!(unit = %self.ctx.plan.units[u].name, %lane, pool = pool.label(), "dispatching unit");
        pool.execute(job).map_err(|e| e.to_string())
    }

    /// Resolve a unit that will never run.
    fn skip(&mut self, u: usize, cause: Cause) {
        let ctx = self.ctx;
        let result = UnitResult::skipped(&ctx.plan.units[u], cause);
        for record in &result.invocations {
            ctx.notifier.invocation_finished(record);
        }
        self.complete(u, result);
    }

    fn complete(&mut self, u: usize, result: UnitResult) {
        let ctx = self.ctx;
        let plan = &ctx.plan;
        debug!(
            unit = %result.name,
            outcome = ?result.outcome,
            invocations = result.invocations.len(),
            "unit finished"
        );

        let closes_class = match self.class_remaining.get_mut(&result.class) {
            Some(remaining) => {
                *remaining -= 1;
                *remaining == 0
            }
            None => false,
        };
        ctx.notifier.unit_finished(&result, closes_class);
        self.results[u] = Some(result);

        for d in plan.graph.dependents(u) {
            self.waiting_on[d] -= 1;
            if self.waiting_on[d] == 0 {
                self.ready.push(Reverse((plan.units[d].priority, d)));
            }
        }
    }
}

/// The result for a unit whose task panicked outside any test body.
fn crashed(unit: &Unit, message: &str) -> UnitResult {
    warn!(unit = %unit.name, %message, "unit task panicked");
    let record = InvocationRecord::synthetic(
        unit,
        Outcome::Failure,
        Cause::Invocation(InvocationError::panicked(message)),
    );
    UnitResult::new(unit, vec![record], None, Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::config::ParallelMode;
    use crate::runner::result::RunStatus;
    use crate::model::{InvocationContext, ParallelHint};
    use crate::params::ParameterSource;

    fn ok(_: &InvocationContext<'_>) -> Result<(), InvocationError> {
        Ok(())
    }

    fn fail(_: &InvocationContext<'_>) -> Result<(), InvocationError> {
        Err(InvocationError::failed("nope"))
    }

    fn outcome(result: &RunResult, name: &str) -> Option<Outcome> {
        result.unit(name).and_then(|u| u.outcome)
    }

    #[test]
    fn runs_in_dependency_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let unit = |name: &'static str| {
            let log = Arc::clone(&log);
            Unit::new(name, move |_: &InvocationContext<'_>| {
                log.lock().push(name);
                Ok(())
            })
        };
        let units = vec![
            unit("c").depends_on(["b"]),
            unit("b").depends_on(["a"]),
            unit("a"),
        ];
        let result = TestEngine::new(RunConfig::default()).run(units).unwrap();
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
        assert_eq!(result.units.len(), 3);
        assert_eq!(result.units[0].name, "c");
    }

    #[test]
    fn priority_orders_independent_units() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let unit = |name: &'static str, priority: i32| {
            let log = Arc::clone(&log);
            Unit::new(name, move |_: &InvocationContext<'_>| {
                log.lock().push(name);
                Ok(())
            })
            .priority(priority)
        };
        let units = vec![unit("late", 5), unit("early", -5), unit("middle", 0)];
        TestEngine::new(RunConfig::default()).run(units).unwrap();
        assert_eq!(*log.lock(), vec!["early", "middle", "late"]);
    }

    #[test]
    fn skips_propagate_transitively() {
        let units = vec![
            Unit::new("a", fail),
            Unit::new("b", ok).depends_on(["a"]),
            Unit::new("c", ok).depends_on(["b"]),
            Unit::new("d", ok),
        ];
        let result = TestEngine::new(RunConfig::default()).run(units).unwrap();
        assert_eq!(outcome(&result, "a"), Some(Outcome::Failure));
        assert_eq!(outcome(&result, "b"), Some(Outcome::Skip));
        assert_eq!(outcome(&result, "c"), Some(Outcome::Skip));
        assert_eq!(outcome(&result, "d"), Some(Outcome::Success));
        let c = result.unit("c").unwrap();
        assert_eq!(
            c.invocations[0].cause,
            Some(Cause::DependencyBlocked {
                upstream: "b".into()
            })
        );
    }

    #[test]
    fn always_run_ignores_failed_dependencies() {
        let units = vec![
            Unit::new("setup", fail),
            Unit::new("cleanup", ok).depends_on(["setup"]).always_run(),
        ];
        let result = TestEngine::new(RunConfig::default()).run(units).unwrap();
        assert_eq!(outcome(&result, "cleanup"), Some(Outcome::Success));
    }

    #[test]
    fn empty_source_has_no_outcome_and_does_not_block() {
        let units = vec![
            Unit::new("empty", ok).with_source(ParameterSource::table("none", vec![])),
            Unit::new("after", ok).depends_on(["empty"]),
        ];
        let result = TestEngine::new(RunConfig::default()).run(units).unwrap();
        assert_eq!(outcome(&result, "empty"), None);
        assert!(result.unit("empty").unwrap().invocations.is_empty());
        assert_eq!(outcome(&result, "after"), Some(Outcome::Success));
    }

    #[test]
    fn provider_failure_suppresses_invocations() {
        let units = vec![Unit::new("f", ok).with_source(ParameterSource::supplier(
            "broken",
            |_| Err("no fixtures".into()),
        ))];
        let result = TestEngine::new(RunConfig::default()).run(units).unwrap();
        let f = result.unit("f").unwrap();
        assert_eq!(f.outcome, Some(Outcome::Failure));
        assert!(f.invocations.is_empty());
        assert!(f.source_error.is_some());
    }

    #[test]
    fn provider_failure_can_propagate_as_test_failure() {
        let config = RunConfig {
            propagate_data_provider_failure_as_test_failure: true,
            ..RunConfig::default()
        };
        let units = vec![Unit::new("f", ok).with_source(ParameterSource::supplier(
            "broken",
            |_| Err("no fixtures".into()),
        ))];
        let result = TestEngine::new(config).run(units).unwrap();
        let f = result.unit("f").unwrap();
        assert_eq!(f.invocations.len(), 1);
        assert_eq!(f.invocations[0].outcome, Outcome::Failure);
        assert!(matches!(
            f.invocations[0].cause,
            Some(Cause::DataSource(_))
        ));
    }

    #[test]
    fn dry_run_never_invokes_bodies() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let config = RunConfig {
            dry_run: true,
            ..RunConfig::default()
        };
        let units = vec![
            Unit::new("a", move |_: &InvocationContext<'_>| {
                counted.fetch_add(1, Ordering::SeqCst);
                Err(InvocationError::failed("should not run"))
            })
            .with_source(ParameterSource::values("v", [1, 2])),
            Unit::new("b", ok).depends_on(["a"]),
        ];
        let result = TestEngine::new(config).run(units).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(outcome(&result, "a"), Some(Outcome::Success));
        assert_eq!(outcome(&result, "b"), Some(Outcome::Success));
        assert_eq!(result.summary.invocations, 2);
    }

    #[test]
    fn abort_skips_remaining_units() {
        let engine = TestEngine::new(RunConfig::default());
        let handle = engine.abort_handle();
        let units = vec![
            Unit::new("first", move |_: &InvocationContext<'_>| {
                handle.abort("stop here");
                Ok(())
            }),
            Unit::new("second", ok).depends_on(["first"]),
            Unit::new("third", ok).depends_on(["second"]),
        ];
        let result = engine.run(units).unwrap();
        assert_eq!(outcome(&result, "first"), Some(Outcome::Success));
        assert_eq!(outcome(&result, "second"), Some(Outcome::Skip));
        assert_eq!(outcome(&result, "third"), Some(Outcome::Skip));
        assert_eq!(result.aborted.as_deref(), Some("stop here"));
        assert!(matches!(
            result.unit("third").unwrap().invocations[0].cause,
            Some(Cause::Aborted { .. })
        ));
    }

    #[test]
    fn class_isolation_keeps_one_unit_per_class_in_flight() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let unit = |name: &str| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            Unit::new(name, move |_: &InvocationContext<'_>| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(10));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
            .in_class("Same")
        };
        let config = RunConfig {
            parallel: ParallelMode::Classes,
            thread_count: 4,
            ..RunConfig::default()
        };
        let units = vec![unit("a"), unit("b"), unit("c")];
        TestEngine::new(config).run(units).unwrap();
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sequential_hint_runs_parallel_source_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in = Arc::clone(&seen);
        let units = vec![Unit::new("ordered", move |ctx: &InvocationContext<'_>| {
            seen_in.lock().push(ctx.param(0).cloned());
            Ok(())
        })
        .with_source(ParameterSource::values("v", [1, 2, 3, 4]).parallel())
        .parallel(ParallelHint::Sequential)];
        TestEngine::new(RunConfig::default()).run(units).unwrap();
        assert_eq!(
            *seen.lock(),
            vec![Some(json!(1)), Some(json!(2)), Some(json!(3)), Some(json!(4))]
        );
    }

    #[test]
    fn configuration_errors_prevent_execution() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let units = vec![
            Unit::new("a", move |_: &InvocationContext<'_>| {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            Unit::new("b", ok).depends_on(["ghost"]),
        ];
        let err = TestEngine::new(RunConfig::default()).run(units).unwrap_err();
        assert!(matches!(
            err,
            RunError::Configuration(ConfigError::UnresolvedDependency { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn all_skipped_policy_keeps_the_result() {
        let config = RunConfig {
            fail_if_all_tests_skipped: true,
            ..RunConfig::default()
        };
        let units = vec![Unit::new("s", |_: &InvocationContext<'_>| {
            Err(InvocationError::skip("not applicable"))
        })];
        let err = TestEngine::new(config).run(units).unwrap_err();
        let RunError::AllTestsSkipped { skipped, result } = err else {
            panic!("expected AllTestsSkipped");
        };
        assert_eq!(skipped, 1);
        assert_eq!(result.units.len(), 1);
    }

    #[test]
    fn panicking_listener_leaves_outcomes_alone() {
        struct Grumpy;
        impl RunListener for Grumpy {
            fn on_invocation_start(&self, invocation: &crate::model::Invocation, _attempt: u32) {
                assert_ne!(invocation.unit, "cursed", "listener refuses this unit");
            }

            fn on_unit_finish(&self, result: &UnitResult) {
                assert_ne!(result.name, "fine", "listener refuses this unit");
            }
        }
        let units = vec![Unit::new("cursed", ok), Unit::new("fine", ok)];
        let result = TestEngine::new(RunConfig::default())
            .with_listener(Arc::new(Grumpy))
            .run(units)
            .unwrap();
        assert_eq!(outcome(&result, "cursed"), Some(Outcome::Success));
        assert_eq!(outcome(&result, "fine"), Some(Outcome::Success));
    }

    #[test]
    fn abort_inside_a_unit_skips_its_remaining_tuples() {
        let engine = TestEngine::new(RunConfig::default());
        let handle = engine.abort_handle();
        let units = vec![Unit::new("f", move |ctx: &InvocationContext<'_>| {
            if ctx.param(0) == Some(&json!(1)) {
                handle.abort("enough");
            }
            Ok(())
        })
        .with_source(ParameterSource::values("v", [1, 2, 3]))];
        let result = engine.run(units).unwrap();
        let f = result.unit("f").unwrap();
        let outcomes: Vec<_> = f.invocations.iter().map(|r| r.outcome).collect();
        assert_eq!(outcomes, vec![Outcome::Success, Outcome::Skip, Outcome::Skip]);
        assert_eq!(
            f.invocations[2].cause,
            Some(Cause::Aborted {
                reason: "enough".into()
            })
        );
        assert_eq!(result.summary.skipped, 2);
        assert_eq!(result.status(), RunStatus::HasSkips);
    }
}
