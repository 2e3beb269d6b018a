//! Execution of a single unit on a worker thread.
//!
//! The unit's worker owns the [`Expander`]: it pulls tuples one at a time and
//! either runs each invocation in place or, for parallel sources, hands it to
//! a data-provider pool and collects the records.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{Cause, DataSourceError, InvocationError};
use crate::model::{Invocation, ParallelHint, Unit};
use crate::params::{Expander, ParameterSource};
use crate::runner::context::RunContext;
use crate::runner::pool::{Executor, Job};
use crate::runner::result::{InvocationRecord, Outcome, UnitResult};
use crate::runner::retry::RetryCoordinator;
use crate::util::panic_message;

/// Run every invocation of unit `index` to a terminal outcome.
pub(crate) fn execute_unit(ctx: &Arc<RunContext>, index: usize) -> UnitResult {
    let unit = &ctx.plan.units[index];
    let started = Instant::now();

    if ctx.config.dry_run {
        return dry_run(ctx, index, unit);
    }

    let expander = match Expander::open(index, unit) {
        Ok(expander) => expander,
        Err(err) => return source_failed(ctx, unit, err, Vec::new(), started),
    };

    let (records, source_error) = if runs_on_data_pool(ctx, index, unit) {
        fan_out(ctx, unit, expander)
    } else {
        in_order(ctx, unit, expander)
    };

    match source_error {
        Some(err) => source_failed(ctx, unit, err, records, started),
        None => UnitResult::new(unit, records, None, started.elapsed()),
    }
}

fn runs_on_data_pool(ctx: &RunContext, index: usize, unit: &Unit) -> bool {
    unit.source.as_ref().is_some_and(ParameterSource::is_parallel)
        && unit.parallel != ParallelHint::Sequential
        && !ctx.plan.is_downgraded(index)
}

type Collected = (Vec<InvocationRecord>, Option<DataSourceError>);

fn in_order(ctx: &RunContext, unit: &Unit, mut expander: Expander<'_>) -> Collected {
    let mut records = Vec::new();
    let mut interrupted = None;
    for item in expander.by_ref() {
        match item {
            Ok(invocation) if ctx.abort.is_aborted() => {
                interrupted = Some(invocation);
                break;
            }
            Ok(invocation) => records.push(run_guarded(ctx, unit, &invocation)),
            Err(err) => return (records, Some(err)),
        }
    }
    if let Some(invocation) = interrupted {
        records.extend(aborted(ctx, unit, &invocation, expander));
    }
    (records, None)
}

fn fan_out(ctx: &Arc<RunContext>, unit: &Unit, mut expander: Expander<'_>) -> Collected {
    let (pool, owned) = match &ctx.shared_data_pool {
        Some(shared) => (Arc::clone(shared), false),
        None => (
            ctx.factory.create(
                &format!("testloom-data-{}", unit.name),
                ctx.config.data_provider_thread_count,
            ),
            true,
        ),
    };

    let (tx, rx) = mpsc::channel();
    let mut inline = Vec::new();
    let mut source_error = None;
    let mut interrupted = None;
    for item in expander.by_ref() {
        match item {
            Ok(invocation) if ctx.abort.is_aborted() => {
                interrupted = Some(invocation);
                break;
            }
            Ok(invocation) => {
                if let Err(e) = pool.execute(invocation_job(ctx, invocation.clone(), tx.clone())) {
                    warn!(unit = %unit.name, error = %e, "data-provider pool rejected invocation, running it in place");
                    inline.push(run_guarded(ctx, unit, &invocation));
                }
            }
            Err(err) => {
                source_error = Some(err);
                break;
            }
        }
    }
    drop(tx);

    let mut records: Vec<InvocationRecord> = rx.iter().collect();
    records.append(&mut inline);
    if owned {
        pool.shutdown();
    }
    if let Some(invocation) = interrupted {
        records.extend(aborted(ctx, unit, &invocation, expander));
    }
    (records, source_error)
}

fn invocation_job(
    ctx: &Arc<RunContext>,
    invocation: Invocation,
    tx: mpsc::Sender<InvocationRecord>,
) -> Job {
    let ctx = Arc::clone(ctx);
    Box::new(move || {
        let unit = &ctx.plan.units[invocation.unit_index];
        let record = run_guarded(&ctx, unit, &invocation);
        let _ = tx.send(record);
    })
}

/// Run one invocation to a terminal record. A panic outside the body (a
/// retry policy, say) fails this invocation only.
fn run_guarded(ctx: &RunContext, unit: &Unit, invocation: &Invocation) -> InvocationRecord {
    catch_unwind(AssertUnwindSafe(|| {
        RetryCoordinator::new(unit, &ctx.notifier).run(invocation)
    }))
    .unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        warn!(invocation = %invocation.display_name(), %message, "invocation panicked outside its body");
        let mut record = InvocationRecord::for_invocation(unit, invocation, Outcome::Failure);
        record.cause = Some(Cause::Invocation(InvocationError::panicked(message)));
        ctx.notifier.invocation_finished(&record);
        record
    })
}

/// Skip records for the tuple in hand when the abort was seen and, for a
/// static source, for every tuple left in it. A stream is not pulled again.
fn aborted(
    ctx: &RunContext,
    unit: &Unit,
    first: &Invocation,
    expander: Expander<'_>,
) -> Vec<InvocationRecord> {
    let reason = ctx.aborted_reason();
    let skip = |invocation: &Invocation| {
        let mut record = InvocationRecord::for_invocation(unit, invocation, Outcome::Skip);
        record.cause = Some(Cause::Aborted {
            reason: reason.clone(),
        });
        ctx.notifier.invocation_finished(&record);
        record
    };

    let mut records = vec![skip(first)];
    match expander.size_hint() {
        Some(total) => {
            debug!(
                unit = %unit.name,
                remaining = total.saturating_sub(expander.produced()),
                "abort requested, skipping remaining tuples"
            );
            records.extend(expander.filter_map(Result::ok).map(|inv| skip(&inv)));
        }
        None => {
            debug!(unit = %unit.name, produced = expander.produced(), "abort requested, leaving stream unread");
        }
    }
    records
}

/// A null data set always leaves one failing record behind. A provider
/// that raised (or asked for a skip) does so only when failures are
/// propagated; otherwise the unit ends through its source error alone.
fn source_failed(
    ctx: &RunContext,
    unit: &Unit,
    err: DataSourceError,
    mut records: Vec<InvocationRecord>,
    started: Instant,
) -> UnitResult {
    let synthesize = matches!(err, DataSourceError::NullDataSet { .. })
        || ctx.config.propagate_data_provider_failure_as_test_failure;
    if synthesize {
        let outcome = if err.is_skip() {
            Outcome::Skip
        } else {
            Outcome::Failure
        };
        let mut record = InvocationRecord::synthetic(unit, outcome, Cause::DataSource(err.clone()));
        record.index = records.len();
        ctx.notifier.invocation_finished(&record);
        records.push(record);
    }
    UnitResult::new(unit, records, Some(err), started.elapsed())
}

/// Dry-run bookkeeping is per unit: one successful record, without opening
/// the parameter source or running the body.
fn dry_run(ctx: &RunContext, index: usize, unit: &Unit) -> UnitResult {
    let invocation = Invocation {
        unit_index: index,
        unit: unit.name.clone(),
        index: 0,
        params: Vec::new(),
        instance: unit.instance.clone(),
    };
    let record = InvocationRecord::for_invocation(unit, &invocation, Outcome::Success);
    ctx.notifier.invocation_finished(&record);
    UnitResult::new(unit, vec![record], None, Duration::ZERO)
}
