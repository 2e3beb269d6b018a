//! Declared test units and the invocations produced from them.

pub mod unit;

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

use crate::error::InvocationError;

pub use unit::{ParallelHint, Unit};

/// One parameter tuple.
pub type Params = Vec<Value>;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// A live test-class instance that units and data providers may be bound to.
///
/// Cloning shares the same instance; identity is the `id`.
#[derive(Clone)]
pub struct Instance {
    id: u64,
    class: String,
    state: Arc<dyn Any + Send + Sync>,
}

impl Instance {
    pub fn new<T: Any + Send + Sync>(class: impl Into<String>, state: T) -> Self {
        Self {
            id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            class: class.into(),
            state: Arc::new(state),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    /// Borrow the instance state as `T`.
    pub fn state<T: Any>(&self) -> Option<&T> {
        self.state.downcast_ref::<T>()
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("class", &self.class)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// One concrete execution of a unit.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Index of the unit in the declared unit table.
    pub unit_index: usize,
    pub unit: String,
    /// Position in the unit's parameter sequence.
    pub index: usize,
    pub params: Params,
    pub instance: Option<Instance>,
}

impl Invocation {
    /// `name(p1,p2)`, or just `name` without parameters.
    pub fn display_name(&self) -> String {
        display_name(&self.unit, &self.params)
    }
}

pub(crate) fn display_name(unit: &str, params: &[Value]) -> String {
    if params.is_empty() {
        return unit.to_owned();
    }
    let rendered: Vec<String> = params
        .iter()
        .map(|p| match p {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect();
    format!("{unit}({})", rendered.join(","))
}

/// What a test body sees when it is called.
#[derive(Debug)]
pub struct InvocationContext<'a> {
    pub invocation: &'a Invocation,
    /// 1 for the first attempt, incremented on every retry.
    pub attempt: u32,
}

impl InvocationContext<'_> {
    pub fn params(&self) -> &[Value] {
        &self.invocation.params
    }

    pub fn param(&self, i: usize) -> Option<&Value> {
        self.invocation.params.get(i)
    }

    pub fn instance(&self) -> Option<&Instance> {
        self.invocation.instance.as_ref()
    }
}

/// The executable part of a unit.
pub trait TestBody: Send + Sync {
    fn invoke(&self, ctx: &InvocationContext<'_>) -> Result<(), InvocationError>;
}

impl<F> TestBody for F
where
    F: Fn(&InvocationContext<'_>) -> Result<(), InvocationError> + Send + Sync,
{
    fn invoke(&self, ctx: &InvocationContext<'_>) -> Result<(), InvocationError> {
        self(ctx)
    }
}
