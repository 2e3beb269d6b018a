pub mod run_result;

pub use run_result::{emit_run_json, emit_run_yaml};
