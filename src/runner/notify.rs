use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::{trace, warn};

use crate::model::Invocation;
use crate::plan::ExecutionPlan;
use crate::runner::result::{InvocationRecord, RunResult, UnitResult};
use crate::util::panic_message;

/// Observer of a run. Every hook has an empty default.
///
/// Invocation hooks are called from worker threads, possibly concurrently;
/// unit, class and run hooks are called from the scheduling thread.
pub trait RunListener: Send + Sync {
    fn on_run_start(&self, _plan: &ExecutionPlan) {}

    /// Called before every attempt, retries included.
    fn on_invocation_start(&self, _invocation: &Invocation, _attempt: u32) {}

    /// Called after every attempt. Non-terminal attempts carry `retried`.
    /// Synthetic records (blocked, aborted) arrive here without a start.
    fn on_invocation_finish(&self, _record: &InvocationRecord) {}

    fn on_unit_finish(&self, _result: &UnitResult) {}

    /// Called once, when the last unit of `class` has finished.
    fn on_class_finish(&self, _class: &str) {}

    fn on_run_finish(&self, _result: &RunResult) {}
}

/// Fans notifications out to listeners, in registration order. A listener
/// that panics is logged and skipped; the run and the other listeners carry on.
#[derive(Clone, Default)]
pub struct Notifier {
    listeners: Vec<Arc<dyn RunListener>>,
    symmetric: bool,
}

impl Notifier {
    pub fn new(listeners: Vec<Arc<dyn RunListener>>, symmetric: bool) -> Self {
        Self {
            listeners,
            symmetric,
        }
    }

    pub fn run_started(&self, plan: &ExecutionPlan) {
        self.each("on_run_start", |l| l.on_run_start(plan));
    }

    pub fn invocation_started(&self, invocation: &Invocation, attempt: u32) {
        trace!(invocation = %invocation.display_name(), attempt, "invocation started");
        self.each("on_invocation_start", |l| l.on_invocation_start(invocation, attempt));
    }

    pub fn invocation_finished(&self, record: &InvocationRecord) {
        trace!(
            invocation = %record.display_name(),
            outcome = %record.outcome,
            retried = record.retried,
            "invocation finished"
        );
        self.each("on_invocation_finish", |l| l.on_invocation_finish(record));
    }

    /// Report a finished unit, and its class when `closes_class` is set.
    ///
    /// Symmetric mode runs the unit hook before the class hook; the default
    /// asymmetric mode runs the class hook first.
    pub fn unit_finished(&self, result: &UnitResult, closes_class: bool) {
        if !closes_class {
            self.unit_hooks(result);
        } else if self.symmetric {
            self.unit_hooks(result);
            self.class_hooks(&result.class);
        } else {
            self.class_hooks(&result.class);
            self.unit_hooks(result);
        }
    }

    pub fn run_finished(&self, result: &RunResult) {
        self.each("on_run_finish", |l| l.on_run_finish(result));
    }

    fn unit_hooks(&self, result: &UnitResult) {
        self.each("on_unit_finish", |l| l.on_unit_finish(result));
    }

    fn class_hooks(&self, class: &str) {
        self.each("on_class_finish", |l| l.on_class_finish(class));
    }

    fn each(&self, hook: &'static str, call: impl Fn(&dyn RunListener)) {
        for l in &self.listeners {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| call(l.as_ref()))) {
                warn!(hook, message = %panic_message(payload.as_ref()), "listener panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::error::InvocationError;
    use crate::model::{InvocationContext, Unit};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl RunListener for Recorder {
        fn on_unit_finish(&self, result: &UnitResult) {
            self.0.lock().push(format!("unit:{}", result.name));
        }

        fn on_class_finish(&self, class: &str) {
            self.0.lock().push(format!("class:{class}"));
        }
    }

    fn result() -> UnitResult {
        let unit = Unit::new("t", |_: &InvocationContext<'_>| -> Result<(), InvocationError> {
            Ok(())
        })
        .in_class("Sample");
        UnitResult::new(&unit, vec![], None, Duration::ZERO)
    }

    fn events(symmetric: bool, closes_class: bool) -> Vec<String> {
        let recorder = Arc::new(Recorder::default());
        let notifier = Notifier::new(vec![recorder.clone() as Arc<dyn RunListener>], symmetric);
        notifier.unit_finished(&result(), closes_class);
        recorder.0.lock().clone()
    }

    #[test]
    fn symmetric_runs_unit_hook_first() {
        assert_eq!(events(true, true), vec!["unit:t", "class:Sample"]);
    }

    #[test]
    fn asymmetric_runs_class_hook_first() {
        assert_eq!(events(false, true), vec!["class:Sample", "unit:t"]);
    }

    struct Grumpy;

    impl RunListener for Grumpy {
        fn on_unit_finish(&self, result: &UnitResult) {
            assert_ne!(result.name, "t", "listener refuses this unit");
        }
    }

    #[test]
    fn panicking_listener_does_not_silence_the_others() {
        let recorder = Arc::new(Recorder::default());
        let notifier = Notifier::new(
            vec![
                Arc::new(Grumpy) as Arc<dyn RunListener>,
                recorder.clone() as Arc<dyn RunListener>,
            ],
            true,
        );
        notifier.unit_finished(&result(), true);
        assert_eq!(*recorder.0.lock(), vec!["unit:t", "class:Sample"]);
    }

    #[test]
    fn class_hook_only_when_class_closes() {
        assert_eq!(events(true, false), vec!["unit:t"]);
        assert_eq!(events(false, false), vec!["unit:t"]);
    }
}
