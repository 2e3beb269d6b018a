use std::fmt;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Cause, DataSourceError};
use crate::model::{Invocation, Unit, display_name};

/// Terminal outcome of an invocation or unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
    Skip,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Skip => write!(f, "skip"),
        }
    }
}

/// The thread an invocation ran on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ThreadInfo {
    pub fn current() -> Self {
        let current = thread::current();
        Self {
            id: format!("{:?}", current.id()),
            name: current.name().map(str::to_owned),
        }
    }
}

/// Outcome of one attempt of one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationRecord {
    pub unit: String,
    pub class: String,
    /// Position in the unit's parameter sequence.
    pub index: usize,
    pub params: Vec<Value>,
    pub instance: Option<u64>,
    pub outcome: Outcome,
    pub cause: Option<Cause>,
    /// Attempts made so far, including this one. Zero if the body never ran.
    pub attempts: u32,
    /// Set on a failed attempt that is followed by a retry.
    pub retried: bool,
    pub duration: Duration,
    pub thread: ThreadInfo,
}

impl InvocationRecord {
    pub(crate) fn for_invocation(unit: &Unit, invocation: &Invocation, outcome: Outcome) -> Self {
        Self {
            unit: unit.name.clone(),
            class: unit.class.clone(),
            index: invocation.index,
            params: invocation.params.clone(),
            instance: invocation.instance.as_ref().map(|i| i.id()),
            outcome,
            cause: None,
            attempts: 0,
            retried: false,
            duration: Duration::ZERO,
            thread: ThreadInfo::current(),
        }
    }

    /// A record for a unit whose body never ran: blocked, aborted, or the
    /// stand-in for a failed data source.
    pub(crate) fn synthetic(unit: &Unit, outcome: Outcome, cause: Cause) -> Self {
        Self {
            unit: unit.name.clone(),
            class: unit.class.clone(),
            index: 0,
            params: Vec::new(),
            instance: unit.instance.as_ref().map(|i| i.id()),
            outcome,
            cause: Some(cause),
            attempts: 0,
            retried: false,
            duration: Duration::ZERO,
            thread: ThreadInfo::current(),
        }
    }

    /// `name(p1,p2)`, or just `name` without parameters.
    pub fn display_name(&self) -> String {
        display_name(&self.unit, &self.params)
    }
}

/// Aggregated result of one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitResult {
    pub name: String,
    pub class: String,
    /// `None` when a valid but empty source produced no invocations.
    pub outcome: Option<Outcome>,
    /// Terminal invocation records, ordered by sequence index.
    pub invocations: Vec<InvocationRecord>,
    pub source_error: Option<DataSourceError>,
    pub duration: Duration,
}

impl UnitResult {
    pub(crate) fn new(
        unit: &Unit,
        mut invocations: Vec<InvocationRecord>,
        source_error: Option<DataSourceError>,
        duration: Duration,
    ) -> Self {
        invocations.sort_by_key(|r| r.index);
        let outcome = aggregate(&invocations, source_error.as_ref());
        Self {
            name: unit.name.clone(),
            class: unit.class.clone(),
            outcome,
            invocations,
            source_error,
            duration,
        }
    }

    /// A unit that never dispatched, carrying one synthetic Skip.
    pub(crate) fn skipped(unit: &Unit, cause: Cause) -> Self {
        Self::new(
            unit,
            vec![InvocationRecord::synthetic(unit, Outcome::Skip, cause)],
            None,
            Duration::ZERO,
        )
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Some(Outcome::Success)
    }

    /// Whether dependents must be skipped.
    pub fn blocks_dependents(&self) -> bool {
        matches!(self.outcome, Some(Outcome::Failure | Outcome::Skip))
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.invocations
            .iter()
            .filter(|r| r.outcome == outcome)
            .count()
    }
}

/// Any Failure fails the unit, all Skip skips it, otherwise Success.
/// A failed data source always fails the unit; a source that asked to be
/// skipped skips it unless an invocation already failed. No invocations and
/// no source error means no outcome.
pub fn aggregate(
    invocations: &[InvocationRecord],
    source_error: Option<&DataSourceError>,
) -> Option<Outcome> {
    let any_failed = invocations.iter().any(|r| r.outcome == Outcome::Failure);
    match source_error {
        Some(err) if !err.is_skip() => return Some(Outcome::Failure),
        Some(_) if any_failed => return Some(Outcome::Failure),
        Some(_) => return Some(Outcome::Skip),
        None => {}
    }
    if invocations.is_empty() {
        return None;
    }
    if any_failed {
        Some(Outcome::Failure)
    } else if invocations.iter().all(|r| r.outcome == Outcome::Skip) {
        Some(Outcome::Skip)
    } else {
        Some(Outcome::Success)
    }
}

/// Counts across a whole run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub units: usize,
    pub invocations: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub units_failed: usize,
    pub units_skipped: usize,
}

impl RunSummary {
    pub fn from_units(units: &[UnitResult]) -> Self {
        let mut summary = Self {
            units: units.len(),
            ..Self::default()
        };
        for unit in units {
            match unit.outcome {
                Some(Outcome::Failure) => summary.units_failed += 1,
                Some(Outcome::Skip) => summary.units_skipped += 1,
                _ => {}
            }
            for record in &unit.invocations {
                summary.invocations += 1;
                match record.outcome {
                    Outcome::Success => summary.passed += 1,
                    Outcome::Failure => summary.failed += 1,
                    Outcome::Skip => summary.skipped += 1,
                }
            }
        }
        summary
    }

    /// Every invocation in the run was skipped, and there was at least one.
    pub fn all_skipped(&self) -> bool {
        self.invocations > 0 && self.skipped == self.invocations
    }
}

/// Process-level status of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Passed,
    HasFailures,
    HasSkips,
}

impl RunStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Passed => 0,
            Self::HasFailures => 1,
            Self::HasSkips => 2,
        }
    }
}

/// Result of a complete run. Partial results are kept even when the run
/// was aborted.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    /// Unit results in declaration order.
    pub units: Vec<UnitResult>,
    pub duration: Duration,
    /// Reason given to the abort handle, if the run was aborted.
    pub aborted: Option<String>,
    pub summary: RunSummary,
}

impl RunResult {
    pub fn new(units: Vec<UnitResult>, duration: Duration, aborted: Option<String>) -> Self {
        let summary = RunSummary::from_units(&units);
        Self {
            units,
            duration,
            aborted,
            summary,
        }
    }

    pub fn unit(&self, name: &str) -> Option<&UnitResult> {
        self.units.iter().find(|u| u.name == name)
    }

    pub fn invocations(&self) -> impl Iterator<Item = &InvocationRecord> {
        self.units.iter().flat_map(|u| u.invocations.iter())
    }

    pub fn status(&self) -> RunStatus {
        if self.summary.failed > 0 || self.summary.units_failed > 0 {
            RunStatus::HasFailures
        } else if self.summary.skipped > 0 || self.summary.units_skipped > 0 {
            RunStatus::HasSkips
        } else {
            RunStatus::Passed
        }
    }
}
