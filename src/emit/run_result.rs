use crate::runner::report::RunReport;

/// Emit run results as YAML.
pub fn emit_run_yaml(report: &RunReport) -> String {
    serde_yaml::to_string(report).unwrap_or_else(|e| format!("# Error serializing report: {e}"))
}

/// Emit run results as JSON.
pub fn emit_run_json(report: &RunReport) -> String {
    serde_json::to_string_pretty(report).unwrap_or_else(|e| format!("{{ \"error\": \"{e}\" }}"))
}
