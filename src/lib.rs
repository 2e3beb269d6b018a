//! Test orchestration: dependency ordering, data-driven expansion, retries
//! and concurrent dispatch of declared test units.

pub mod config;
pub mod emit;
pub mod error;
pub mod graph;
pub mod model;
pub mod params;
pub mod plan;
pub mod runner;
pub mod util;

pub use config::{ParallelMode, RunConfig};
pub use error::{Cause, ConfigError, DataSourceError, InvocationError, RunError};
pub use model::{Instance, Invocation, InvocationContext, ParallelHint, Params, TestBody, Unit};
pub use params::{ParameterSource, SkipSource};
pub use runner::{Outcome, RunListener, RunResult, TestEngine};
