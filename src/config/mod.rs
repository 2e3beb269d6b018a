//! Run-level configuration.
//!
//! A [`RunConfig`] is built once (from defaults, a YAML file and environment
//! overrides) and then handed by value to the engine. Nothing reads ambient
//! state during a run.

pub mod env;
pub mod file;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Isolation granularity for concurrent execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParallelMode {
    /// Everything runs one unit at a time.
    #[default]
    None,
    /// Any two units may run concurrently.
    Methods,
    /// Units of the same class run one at a time; classes run concurrently.
    Classes,
    /// Units bound to the same instance run one at a time.
    Instances,
}

impl ParallelMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "false" => Some(Self::None),
            "methods" | "tests" | "true" => Some(Self::Methods),
            "classes" => Some(Self::Classes),
            "instances" => Some(Self::Instances),
            _ => None,
        }
    }
}

impl fmt::Display for ParallelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Methods => write!(f, "methods"),
            Self::Classes => write!(f, "classes"),
            Self::Instances => write!(f, "instances"),
        }
    }
}

/// Configuration for a test run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RunConfig {
    /// Isolation granularity.
    pub parallel: ParallelMode,
    /// Size of the main worker pool.
    pub thread_count: usize,
    /// Size of each data-provider pool (or of the shared one).
    pub data_provider_thread_count: usize,
    /// Route every parallel data-provider invocation through one pool.
    pub share_data_provider_thread_pool: bool,
    /// Never downgrade ambiguous units to sequential execution.
    pub strict_parallel: bool,
    /// Pin dependency-linked and priority-ordered units to one thread.
    pub thread_affinity: bool,
    /// Fire unit-level finish hooks before class-level ones.
    pub symmetric_listener_execution: bool,
    /// Record a failing invocation when a data provider raises.
    pub propagate_data_provider_failure_as_test_failure: bool,
    /// Fail the run when every invocation ended in Skip.
    pub fail_if_all_tests_skipped: bool,
    /// Walk the graph without invoking bodies.
    pub dry_run: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            parallel: ParallelMode::None,
            thread_count: 5,
            data_provider_thread_count: 10,
            share_data_provider_thread_pool: false,
            strict_parallel: false,
            thread_affinity: false,
            symmetric_listener_execution: false,
            propagate_data_provider_failure_as_test_failure: false,
            fail_if_all_tests_skipped: false,
            dry_run: false,
        }
    }
}

impl RunConfig {
    /// Effective size of the main pool for the configured parallel mode.
    pub fn main_pool_size(&self) -> usize {
        match self.parallel {
            ParallelMode::None => 1,
            _ => self.thread_count,
        }
    }

    /// Check option combinations that can never run.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for zero-sized pools, or when a shared
    /// data-provider pool is requested together with a custom executor.
    pub fn validate(&self, custom_executor: bool) -> Result<(), ConfigError> {
        if self.thread_count == 0 {
            return Err(ConfigError::InvalidThreadCount {
                option: "threadCount",
                value: self.thread_count,
            });
        }
        if self.data_provider_thread_count == 0 {
            return Err(ConfigError::InvalidThreadCount {
                option: "dataProviderThreadCount",
                value: self.data_provider_thread_count,
            });
        }
        if self.share_data_provider_thread_pool && custom_executor {
            return Err(ConfigError::SharedPoolWithCustomExecutor);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RunConfig::default();
        assert_eq!(config.parallel, ParallelMode::None);
        assert_eq!(config.thread_count, 5);
        assert_eq!(config.data_provider_thread_count, 10);
        assert!(!config.share_data_provider_thread_pool);
        assert!(!config.thread_affinity);
        assert!(!config.dry_run);
        assert_eq!(config.main_pool_size(), 1);
    }

    #[test]
    fn main_pool_follows_thread_count_when_parallel() {
        let config = RunConfig {
            parallel: ParallelMode::Classes,
            thread_count: 3,
            ..RunConfig::default()
        };
        assert_eq!(config.main_pool_size(), 3);
    }

    #[test]
    fn parallel_mode_parse() {
        assert_eq!(ParallelMode::parse("Methods"), Some(ParallelMode::Methods));
        assert_eq!(ParallelMode::parse("classes"), Some(ParallelMode::Classes));
        assert_eq!(ParallelMode::parse("instances"), Some(ParallelMode::Instances));
        assert_eq!(ParallelMode::parse("none"), Some(ParallelMode::None));
        assert_eq!(ParallelMode::parse("sideways"), None);
    }

    #[test]
    fn validate_rejects_shared_pool_with_custom_executor() {
        let config = RunConfig {
            share_data_provider_thread_pool: true,
            ..RunConfig::default()
        };
        assert!(config.validate(false).is_ok());
        assert_eq!(
            config.validate(true),
            Err(ConfigError::SharedPoolWithCustomExecutor)
        );
    }

    #[test]
    fn validate_rejects_zero_threads() {
        let config = RunConfig {
            data_provider_thread_count: 0,
            ..RunConfig::default()
        };
        assert!(matches!(
            config.validate(false),
            Err(ConfigError::InvalidThreadCount {
                option: "dataProviderThreadCount",
                ..
            })
        ));
    }
}
