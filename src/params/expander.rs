use tracing::{debug, warn};

use crate::error::DataSourceError;
use crate::model::{Invocation, Unit};
use crate::params::{ParamStream, ProviderError, SkipSource, SourceContext, TableStream};

/// Turns one unit (and its parameter source, if any) into invocations.
///
/// The expander is the only reader of the underlying stream: it pulls one
/// tuple at a time on the thread that owns the unit, even when the resulting
/// invocations are dispatched to a pool. Retries reuse an already produced
/// [`Invocation`] and never come back here.
pub struct Expander<'a> {
    unit_index: usize,
    unit: &'a Unit,
    stream: Box<dyn ParamStream>,
    next_index: usize,
    size_hint: Option<usize>,
    done: bool,
}

impl<'a> Expander<'a> {
    /// Evaluate the unit's source. Static sources are fully materialized here.
    ///
    /// # Errors
    ///
    /// Returns [`DataSourceError`] if the provider raised or returned a null
    /// data set.
    pub fn open(unit_index: usize, unit: &'a Unit) -> Result<Self, DataSourceError> {
        let stream: Box<dyn ParamStream> = match &unit.source {
            None => Box::new(TableStream::new(vec![Vec::new()])),
            Some(source) => {
                let ctx = SourceContext {
                    unit: &unit.name,
                    instance: unit.instance.as_ref(),
                };
                match source.open(&ctx) {
                    Ok(Some(stream)) => stream,
                    Ok(None) => {
                        warn!(unit = %unit.name, provider = source.name(), "data provider returned null");
                        return Err(DataSourceError::NullDataSet {
                            unit: unit.name.clone(),
                            provider: source.name().to_owned(),
                        });
                    }
                    Err(e) => return Err(provider_failed(unit, &e)),
                }
            }
        };
        let size_hint = stream.size_hint();
        debug!(unit = %unit.name, ?size_hint, "expanded parameter source");
        Ok(Self {
            unit_index,
            unit,
            stream,
            next_index: 0,
            size_hint,
            done: false,
        })
    }

    /// Total number of invocations, known for static sources only.
    pub fn size_hint(&self) -> Option<usize> {
        self.size_hint
    }

    /// Number of invocations produced so far.
    pub fn produced(&self) -> usize {
        self.next_index
    }
}

impl Iterator for Expander<'_> {
    type Item = Result<Invocation, DataSourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.stream.next_params() {
            Ok(Some(params)) => {
                let invocation = Invocation {
                    unit_index: self.unit_index,
                    unit: self.unit.name.clone(),
                    index: self.next_index,
                    params,
                    instance: self.unit.instance.clone(),
                };
                self.next_index += 1;
                Some(Ok(invocation))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(provider_failed(self.unit, &e)))
            }
        }
    }
}

fn provider_failed(unit: &Unit, err: &ProviderError) -> DataSourceError {
    let provider = unit
        .source
        .as_ref()
        .map(|s| s.name().to_owned())
        .unwrap_or_default();
    if let Some(skip) = err.downcast_ref::<SkipSource>() {
        debug!(unit = %unit.name, %provider, reason = %skip.reason, "data provider skipped its unit");
        return DataSourceError::Skipped {
            unit: unit.name.clone(),
            provider,
            reason: skip.reason.clone(),
        };
    }
    warn!(unit = %unit.name, %provider, error = %err, "data provider failed");
    DataSourceError::ProviderFailed {
        unit: unit.name.clone(),
        provider,
        message: err.to_string(),
    }
}
