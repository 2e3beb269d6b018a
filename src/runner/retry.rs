//! Retry coordinator.
//!
//! Each invocation gets its own [`RetryPolicy`] instance, created from the
//! unit's [`RetryPolicyFactory`] when the invocation starts and dropped when
//! it reaches a terminal outcome. Nothing is shared between invocations.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::{Cause, InvocationError};
use crate::model::{Invocation, InvocationContext, Unit};
use crate::runner::notify::Notifier;
use crate::runner::result::{InvocationRecord, Outcome};
use crate::util::panic_message;

/// What a policy sees when deciding on a retry.
#[derive(Debug)]
pub struct AttemptContext<'a> {
    pub invocation: &'a Invocation,
    pub error: &'a InvocationError,
    /// The attempt that just failed, starting at 1.
    pub attempt: u32,
}

/// Decides whether a failed attempt runs again. May keep state across the
/// attempts of a single invocation.
pub trait RetryPolicy: Send {
    fn should_retry(&mut self, ctx: &AttemptContext<'_>) -> bool;
}

impl<F> RetryPolicy for F
where
    F: FnMut(&AttemptContext<'_>) -> bool + Send,
{
    fn should_retry(&mut self, ctx: &AttemptContext<'_>) -> bool {
        self(ctx)
    }
}

/// Supplies a fresh policy per invocation, or `None` for no retries.
pub trait RetryPolicyFactory: Send + Sync {
    fn policy_for(&self, invocation: &Invocation) -> Option<Box<dyn RetryPolicy>>;
}

impl<F> RetryPolicyFactory for F
where
    F: Fn(&Invocation) -> Option<Box<dyn RetryPolicy>> + Send + Sync,
{
    fn policy_for(&self, invocation: &Invocation) -> Option<Box<dyn RetryPolicy>> {
        self(invocation)
    }
}

/// Retry up to `n` times after the first failure.
#[derive(Debug, Clone, Copy)]
pub struct MaxRetries(pub u32);

impl RetryPolicyFactory for MaxRetries {
    fn policy_for(&self, _invocation: &Invocation) -> Option<Box<dyn RetryPolicy>> {
        Some(Box::new(Countdown { remaining: self.0 }))
    }
}

struct Countdown {
    remaining: u32,
}

impl RetryPolicy for Countdown {
    fn should_retry(&mut self, _ctx: &AttemptContext<'_>) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }
}

/// Tuple-specific policy first, then the unit's, then none.
pub fn resolve_policy(unit: &Unit, invocation: &Invocation) -> Option<Box<dyn RetryPolicy>> {
    unit.param_retry
        .as_ref()
        .and_then(|f| f.policy_for(invocation))
        .or_else(|| unit.retry.as_ref().and_then(|f| f.policy_for(invocation)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Pending,
    Running,
    RetryPending,
    Success,
    Failure,
    Skipped,
}

impl AttemptState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Skipped)
    }
}

/// Per-invocation retry bookkeeping.
#[derive(Debug)]
pub struct RetryState {
    state: AttemptState,
    attempts: u32,
    last_cause: Option<InvocationError>,
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryState {
    pub fn new() -> Self {
        Self {
            state: AttemptState::Pending,
            attempts: 0,
            last_cause: None,
        }
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_cause(&self) -> Option<&InvocationError> {
        self.last_cause.as_ref()
    }

    /// `Pending | RetryPending -> Running`. Returns the attempt number.
    pub fn begin_attempt(&mut self) -> u32 {
        debug_assert!(matches!(
            self.state,
            AttemptState::Pending | AttemptState::RetryPending
        ));
        self.state = AttemptState::Running;
        self.attempts += 1;
        self.attempts
    }

    pub fn succeed(&mut self) {
        debug_assert_eq!(self.state, AttemptState::Running);
        self.state = AttemptState::Success;
    }

    pub fn skip(&mut self, cause: InvocationError) {
        debug_assert_eq!(self.state, AttemptState::Running);
        self.state = AttemptState::Skipped;
        self.last_cause = Some(cause);
    }

    /// `Running -> RetryPending` when `retry`, else `Running -> Failure`.
    pub fn fail(&mut self, cause: InvocationError, retry: bool) {
        debug_assert_eq!(self.state, AttemptState::Running);
        self.state = if retry {
            AttemptState::RetryPending
        } else {
            AttemptState::Failure
        };
        self.last_cause = Some(cause);
    }
}

/// Runs one invocation to a terminal outcome on the calling thread.
pub struct RetryCoordinator<'a> {
    unit: &'a Unit,
    notifier: &'a Notifier,
}

impl<'a> RetryCoordinator<'a> {
    pub fn new(unit: &'a Unit, notifier: &'a Notifier) -> Self {
        Self { unit, notifier }
    }

    /// Run the body, retrying per policy. The same tuple and instance are
    /// reused for every attempt; the parameter source is never consulted.
    pub fn run(&self, invocation: &Invocation) -> InvocationRecord {
        let mut policy = resolve_policy(self.unit, invocation);
        let mut state = RetryState::new();

        loop {
            let attempt = state.begin_attempt();
            self.notifier.invocation_started(invocation, attempt);

            let started = Instant::now();
            let result = self.attempt(invocation, attempt);
            let duration = started.elapsed();
            let result = result.and_then(|()| self.check_timeout(duration));

            let mut record =
                InvocationRecord::for_invocation(self.unit, invocation, Outcome::Success);
            record.attempts = attempt;
            record.duration = duration;

            match result {
                Ok(()) => state.succeed(),
                Err(e) if e.is_skip() => {
                    record.outcome = Outcome::Skip;
                    record.cause = Some(Cause::Invocation(e.clone()));
                    state.skip(e);
                }
                Err(e) => {
                    let retry = policy.as_mut().is_some_and(|p| {
                        p.should_retry(&AttemptContext {
                            invocation,
                            error: &e,
                            attempt,
                        })
                    });
                    record.outcome = Outcome::Failure;
                    record.cause = Some(Cause::Invocation(e.clone()));
                    record.retried = retry;
                    state.fail(e, retry);
                }
            }

            self.notifier.invocation_finished(&record);
            if state.state().is_terminal() {
                trace!(
                    invocation = %invocation.display_name(),
                    attempts = state.attempts(),
                    state = ?state.state(),
                    "invocation terminal"
                );
                return record;
            }
            debug!(
                invocation = %invocation.display_name(),
                attempt,
                cause = ?state.last_cause().map(ToString::to_string),
                "retrying invocation"
            );
        }
    }

    fn attempt(&self, invocation: &Invocation, attempt: u32) -> Result<(), InvocationError> {
        let ctx = InvocationContext {
            invocation,
            attempt,
        };
        catch_unwind(AssertUnwindSafe(|| self.unit.body().invoke(&ctx)))
            .unwrap_or_else(|payload| Err(InvocationError::panicked(panic_message(payload.as_ref()))))
    }

    /// A body that returned after the unit's timeout fails even if it
    /// reported success. The body itself is never interrupted.
    fn check_timeout(&self, elapsed: Duration) -> Result<(), InvocationError> {
        match self.unit.timeout {
            Some(limit) if elapsed > limit => Err(InvocationError::timed_out(format!(
                "took {}ms, limit is {}ms",
                elapsed.as_millis(),
                limit.as_millis()
            ))),
            _ => Ok(()),
        }
    }
}
