//! Environment variable overrides.
//!
//! Read once while the configuration is being built, then applied onto a
//! [`RunConfig`]. The engine itself never looks at the environment.

use tracing::warn;

use crate::config::{ParallelMode, RunConfig};

/// Environment variable prefix
const ENV_PREFIX: &str = "TESTLOOM";

/// Overrides collected from `TESTLOOM_*` variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    /// TESTLOOM_PARALLEL
    pub parallel: Option<ParallelMode>,
    /// TESTLOOM_THREAD_COUNT
    pub thread_count: Option<usize>,
    /// TESTLOOM_DATA_PROVIDER_THREAD_COUNT
    pub data_provider_thread_count: Option<usize>,
    /// TESTLOOM_SHARE_DATA_PROVIDER_POOL
    pub share_data_provider_thread_pool: Option<bool>,
    /// TESTLOOM_STRICT_PARALLEL
    pub strict_parallel: Option<bool>,
    /// TESTLOOM_THREAD_AFFINITY
    pub thread_affinity: Option<bool>,
    /// TESTLOOM_SYMMETRIC_LISTENERS
    pub symmetric_listener_execution: Option<bool>,
    /// TESTLOOM_DRY_RUN
    pub dry_run: Option<bool>,
}

impl EnvOverrides {
    /// Load overrides from the process environment.
    pub fn load() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load overrides through an arbitrary lookup (keys include the prefix).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}_{name}"));
        let get_bool = |name: &str| get(name).and_then(|v| parse_bool(name, &v));
        let get_usize = |name: &str| {
            get(name).and_then(|v| match v.trim().parse::<usize>() {
                Ok(n) => Some(n),
                Err(_) => {
                    warn!("ignoring {ENV_PREFIX}_{name}={v:?}: not a number");
                    None
                }
            })
        };

        Self {
            parallel: get("PARALLEL").and_then(|v| {
                let mode = ParallelMode::parse(&v);
                if mode.is_none() {
                    warn!("ignoring {ENV_PREFIX}_PARALLEL={v:?}: unknown mode");
                }
                mode
            }),
            thread_count: get_usize("THREAD_COUNT"),
            data_provider_thread_count: get_usize("DATA_PROVIDER_THREAD_COUNT"),
            share_data_provider_thread_pool: get_bool("SHARE_DATA_PROVIDER_POOL"),
            strict_parallel: get_bool("STRICT_PARALLEL"),
            thread_affinity: get_bool("THREAD_AFFINITY"),
            symmetric_listener_execution: get_bool("SYMMETRIC_LISTENERS"),
            dry_run: get_bool("DRY_RUN"),
        }
    }

    /// Check if any override is set
    pub fn has_any(&self) -> bool {
        *self != Self::default()
    }

    /// Apply the overrides that are set.
    pub fn apply(&self, config: &mut RunConfig) {
        if let Some(v) = self.parallel {
            config.parallel = v;
        }
        if let Some(v) = self.thread_count {
            config.thread_count = v;
        }
        if let Some(v) = self.data_provider_thread_count {
            config.data_provider_thread_count = v;
        }
        if let Some(v) = self.share_data_provider_thread_pool {
            config.share_data_provider_thread_pool = v;
        }
        if let Some(v) = self.strict_parallel {
            config.strict_parallel = v;
        }
        if let Some(v) = self.thread_affinity {
            config.thread_affinity = v;
        }
        if let Some(v) = self.symmetric_listener_execution {
            config.symmetric_listener_execution = v;
        }
        if let Some(v) = self.dry_run {
            config.dry_run = v;
        }
    }
}

fn parse_bool(name: &str, value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!("ignoring {ENV_PREFIX}_{name}={value:?}: not a boolean");
            None
        }
    }
}
