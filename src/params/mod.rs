//! Parameter sources.
//!
//! Every concrete shape (a table, a list of single values, a supplier bound to
//! an instance, a lazy iterator) is adapted into one capability: a
//! [`ParamStream`] that yields the next tuple or signals exhaustion.

pub mod expander;

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde_json::Value;

use crate::model::{Instance, Params};

pub use expander::Expander;

/// Error type returned by user-supplied provider code.
pub type ProviderError = Box<dyn std::error::Error + Send + Sync>;

/// Result type returned by user-supplied provider code.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Returned (boxed) by provider code to skip the owning unit instead of
/// failing it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct SkipSource {
    pub reason: String,
}

impl SkipSource {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// A lazy iterator of parameter tuples.
pub type ParamIter = Box<dyn Iterator<Item = ProviderResult<Params>> + Send>;

type SupplierFn = dyn Fn(&SourceContext<'_>) -> ProviderResult<Option<Vec<Params>>> + Send + Sync;
type StreamFn = dyn Fn(&SourceContext<'_>) -> ProviderResult<Option<ParamIter>> + Send + Sync;

/// Produce the next parameter tuple, or `None` when exhausted.
pub trait ParamStream: Send {
    fn next_params(&mut self) -> ProviderResult<Option<Params>>;

    /// Number of tuples, when known up front.
    fn size_hint(&self) -> Option<usize> {
        None
    }
}

/// Whether a source is materialized before dispatch or pulled on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Static,
    Streaming,
}

/// What a provider sees when it is opened.
#[derive(Debug)]
pub struct SourceContext<'a> {
    pub unit: &'a str,
    pub instance: Option<&'a Instance>,
}

#[derive(Clone)]
enum Shape {
    Table(Arc<Vec<Params>>),
    Supplier(Arc<SupplierFn>),
    Stream(Arc<StreamFn>),
}

/// A declared supplier of parameter tuples for one unit.
#[derive(Clone)]
pub struct ParameterSource {
    name: String,
    shape: Shape,
    parallel: bool,
    instance_bound: bool,
}

impl ParameterSource {
    /// A fixed table of tuples.
    pub fn table(name: impl Into<String>, rows: Vec<Params>) -> Self {
        Self::from_shape(name, Shape::Table(Arc::new(rows)))
    }

    /// A fixed list of values; each becomes a one-element tuple.
    pub fn values<I>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        let rows = values.into_iter().map(|v| vec![v.into()]).collect();
        Self::table(name, rows)
    }

    /// A supplier evaluated once per run; the returned set is materialized
    /// before the first invocation. Returning `Ok(None)` is a null data set.
    pub fn supplier<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&SourceContext<'_>) -> ProviderResult<Option<Vec<Params>>> + Send + Sync + 'static,
    {
        Self::from_shape(name, Shape::Supplier(Arc::new(f)))
    }

    /// A lazy, possibly unbounded, non-restartable sequence.
    pub fn stream<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&SourceContext<'_>) -> ProviderResult<Option<ParamIter>> + Send + Sync + 'static,
    {
        Self::from_shape(name, Shape::Stream(Arc::new(f)))
    }

    fn from_shape(name: impl Into<String>, shape: Shape) -> Self {
        Self {
            name: name.into(),
            shape,
            parallel: false,
            instance_bound: false,
        }
    }

    /// Dispatch this source's invocations onto a data-provider pool.
    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    /// All invocations must run against the owning unit's instance.
    pub fn bound_to_instance(mut self) -> Self {
        self.instance_bound = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    pub fn is_instance_bound(&self) -> bool {
        self.instance_bound
    }

    pub fn kind(&self) -> SourceKind {
        match self.shape {
            Shape::Table(_) | Shape::Supplier(_) => SourceKind::Static,
            Shape::Stream(_) => SourceKind::Streaming,
        }
    }

    /// Evaluate the provider. `Ok(None)` means it produced a null data set.
    /// Panics in provider code are reported as errors.
    pub(crate) fn open(&self, ctx: &SourceContext<'_>) -> ProviderResult<Option<Box<dyn ParamStream>>> {
        match &self.shape {
            Shape::Table(rows) => Ok(Some(Box::new(TableStream::new(rows.as_ref().clone())))),
            Shape::Supplier(f) => {
                let rows = guard(|| f(ctx))?;
                Ok(rows.map(|r| Box::new(TableStream::new(r)) as Box<dyn ParamStream>))
            }
            Shape::Stream(f) => {
                let iter = guard(|| f(ctx))?;
                Ok(iter.map(|it| Box::new(IterStream(it)) as Box<dyn ParamStream>))
            }
        }
    }
}

impl fmt::Debug for ParameterSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterSource")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("parallel", &self.parallel)
            .field("instance_bound", &self.instance_bound)
            .finish()
    }
}

/// A materialized set of tuples.
struct TableStream {
    rows: std::vec::IntoIter<Params>,
}

impl TableStream {
    fn new(rows: Vec<Params>) -> Self {
        Self {
            rows: rows.into_iter(),
        }
    }
}

impl ParamStream for TableStream {
    fn next_params(&mut self) -> ProviderResult<Option<Params>> {
        Ok(self.rows.next())
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.rows.len())
    }
}

struct IterStream(ParamIter);

impl ParamStream for IterStream {
    fn next_params(&mut self) -> ProviderResult<Option<Params>> {
        guard(|| self.0.next().transpose())
    }
}

/// Run provider code, turning a panic into an error.
fn guard<T>(f: impl FnOnce() -> ProviderResult<T>) -> ProviderResult<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(crate::util::panic_message(payload.as_ref()).into()),
    }
}
