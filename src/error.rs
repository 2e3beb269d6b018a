use std::fmt;

use serde::{Deserialize, Serialize};

use crate::runner::result::RunResult;

/// Errors detected while building a run: nothing has been dispatched yet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("duplicate unit name '{0}'")]
    DuplicateUnit(String),

    #[error("unit '{unit}' depends on unknown unit '{dependency}'")]
    UnresolvedDependency { unit: String, dependency: String },

    #[error("dependency cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    #[error(
        "shared thread-pool for data providers is not compatible with a custom pool executor"
    )]
    SharedPoolWithCustomExecutor,

    #[error("{option} must be at least 1, got {value}")]
    InvalidThreadCount { option: &'static str, value: usize },

    #[error("unit '{unit}' uses instance-bound provider '{provider}' but has no instance")]
    InstanceBoundWithoutInstance { unit: String, provider: String },

    #[error("invalid run configuration: {0}")]
    Parse(String),

    #[error("cannot read {path}: {message}")]
    Io { path: String, message: String },
}

/// A parameter source could not produce a usable data set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum DataSourceError {
    #[error("data provider '{provider}' for '{unit}' returned a null value")]
    NullDataSet { unit: String, provider: String },

    #[error("data provider '{provider}' for '{unit}' failed: {message}")]
    ProviderFailed {
        unit: String,
        provider: String,
        message: String,
    },

    #[error("data provider '{provider}' for '{unit}' skipped: {reason}")]
    Skipped {
        unit: String,
        provider: String,
        reason: String,
    },
}

impl DataSourceError {
    /// The provider asked for its unit to be skipped rather than failed.
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }
}

/// Failure raised by a test body (or synthesised around one).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct InvocationError {
    pub kind: InvocationErrorKind,
    pub message: String,
}

impl InvocationError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            kind: InvocationErrorKind::Failed,
            message: message.into(),
        }
    }

    /// Ask for the invocation to be recorded as skipped. Skips are never retried.
    pub fn skip(message: impl Into<String>) -> Self {
        Self {
            kind: InvocationErrorKind::SkipRequested,
            message: message.into(),
        }
    }

    pub(crate) fn panicked(message: impl Into<String>) -> Self {
        Self {
            kind: InvocationErrorKind::Panicked,
            message: message.into(),
        }
    }

    pub(crate) fn timed_out(message: impl Into<String>) -> Self {
        Self {
            kind: InvocationErrorKind::TimedOut,
            message: message.into(),
        }
    }

    pub fn is_skip(&self) -> bool {
        self.kind == InvocationErrorKind::SkipRequested
    }
}

/// Classification of invocation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationErrorKind {
    Failed,
    Panicked,
    TimedOut,
    SkipRequested,
}

impl fmt::Display for InvocationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed => write!(f, "failed"),
            Self::Panicked => write!(f, "panicked"),
            Self::TimedOut => write!(f, "timed out"),
            Self::SkipRequested => write!(f, "skip requested"),
        }
    }
}

/// Why an invocation did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum Cause {
    #[error(transparent)]
    Invocation(InvocationError),

    #[error(transparent)]
    DataSource(DataSourceError),

    #[error("depends on '{upstream}' which did not succeed")]
    DependencyBlocked { upstream: String },

    #[error("run aborted: {reason}")]
    Aborted { reason: String },
}

/// Error returned from a run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    /// Every invocation in the run was skipped. The drained result is kept.
    #[error("all {skipped} invocations were skipped")]
    AllTestsSkipped {
        skipped: usize,
        result: Box<RunResult>,
    },
}

/// Errors from a worker pool.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("pool '{0}' is shut down")]
    ShutDown(String),

    #[error("pool '{pool}' could not start a worker: {message}")]
    Spawn { pool: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_joins_path() {
        let err = ConfigError::DependencyCycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "dependency cycle: a -> b -> a");
    }

    #[test]
    fn shared_pool_conflict_message() {
        assert!(
            ConfigError::SharedPoolWithCustomExecutor
                .to_string()
                .contains("not compatible with a custom pool executor")
        );
    }

    #[test]
    fn null_data_set_message_names_provider() {
        let err = DataSourceError::NullDataSet {
            unit: "f".into(),
            provider: "getData".into(),
        };
        assert_eq!(
            err.to_string(),
            "data provider 'getData' for 'f' returned a null value"
        );
    }

    #[test]
    fn invocation_error_display() {
        assert_eq!(
            InvocationError::failed("boom").to_string(),
            "failed: boom"
        );
        assert!(InvocationError::skip("later").is_skip());
        assert!(!InvocationError::failed("x").is_skip());
    }

    #[test]
    fn cause_is_transparent_for_invocation_errors() {
        let cause = Cause::Invocation(InvocationError::failed("expected 2"));
        assert_eq!(cause.to_string(), "failed: expected 2");
        let blocked = Cause::DependencyBlocked {
            upstream: "method1".into(),
        };
        assert_eq!(
            blocked.to_string(),
            "depends on 'method1' which did not succeed"
        );
    }
}
