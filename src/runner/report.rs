use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Cause;
use crate::runner::result::{Outcome, RunResult, RunStatus, RunSummary, ThreadInfo};

/// Serializable run result for emitter output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run: RunMetadata,
    pub units: Vec<UnitReport>,
    pub summary: RunSummary,
}

/// Metadata about the run execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub status: RunStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

/// One unit's aggregate result in the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitReport {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invocations: Vec<InvocationReport>,
}

/// One terminal invocation in the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationReport {
    pub name: String,
    pub index: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<Value>,
    pub outcome: Outcome,
    pub attempts: u32,
    pub duration_ms: u64,
    pub thread: ThreadInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Cause>,
}

/// Convert a [`RunResult`] into a serializable [`RunReport`].
pub fn to_report(result: &RunResult) -> RunReport {
    let units = result
        .units
        .iter()
        .map(|unit| UnitReport {
            name: unit.name.clone(),
            class: unit.class.clone(),
            outcome: unit.outcome,
            duration_ms: unit.duration.as_millis() as u64,
            source_error: unit.source_error.as_ref().map(ToString::to_string),
            invocations: unit
                .invocations
                .iter()
                .map(|r| InvocationReport {
                    name: r.display_name(),
                    index: r.index,
                    params: r.params.clone(),
                    outcome: r.outcome,
                    attempts: r.attempts,
                    duration_ms: r.duration.as_millis() as u64,
                    thread: r.thread.clone(),
                    cause: r.cause.clone(),
                })
                .collect(),
        })
        .collect();

    RunReport {
        run: RunMetadata {
            status: result.status(),
            duration_ms: result.duration.as_millis() as u64,
            aborted: result.aborted.clone(),
        },
        units,
        summary: result.summary.clone(),
    }
}
