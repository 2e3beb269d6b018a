use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::warn;

use crate::config::RunConfig;
use crate::plan::ExecutionPlan;
use crate::runner::notify::Notifier;
use crate::runner::pool::{Executor, ExecutorFactory};

/// Requests a run-level abort from any thread.
///
/// After an abort no new unit or invocation is dispatched. Running bodies
/// finish normally; units that never started are recorded as skipped. The
/// handle stays tripped for every later run of the same engine.
#[derive(Clone, Default)]
pub struct AbortHandle {
    inner: Arc<AbortState>,
}

#[derive(Default)]
struct AbortState {
    aborted: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl AbortHandle {
    /// Trip the handle. Only the first reason is kept.
    pub fn abort(&self, reason: impl Into<String>) {
        let mut slot = self.inner.reason.lock();
        if slot.is_none() {
            let reason = reason.into();
            warn!(%reason, "run aborted");
            *slot = Some(reason);
        }
        self.inner.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().clone()
    }
}

impl fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortHandle")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}

/// State shared by the scheduling thread and every worker for one run.
pub(crate) struct RunContext {
    pub plan: ExecutionPlan,
    pub config: RunConfig,
    pub notifier: Notifier,
    pub abort: AbortHandle,
    pub factory: Arc<dyn ExecutorFactory>,
    /// The run-wide data-provider pool, when sharing is on.
    pub shared_data_pool: Option<Arc<dyn Executor>>,
}

impl RunContext {
    pub fn aborted_reason(&self) -> String {
        self.abort
            .reason()
            .unwrap_or_else(|| "abort requested".to_owned())
    }
}
