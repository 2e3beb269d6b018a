//! Scheduling, retries, pools, results and notifications.

pub mod context;
pub(crate) mod executor;
pub mod notify;
pub mod pool;
pub mod report;
pub mod result;
pub mod retry;
pub mod scheduler;

pub use context::AbortHandle;
pub use notify::RunListener;
pub use pool::{Executor, ExecutorFactory, Job, WorkerPool, WorkerPoolFactory};
pub use result::{InvocationRecord, Outcome, RunResult, RunStatus, UnitResult};
pub use retry::{AttemptContext, MaxRetries, RetryPolicy, RetryPolicyFactory};
pub use scheduler::TestEngine;
