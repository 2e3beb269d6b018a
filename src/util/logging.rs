//! Logging setup.
//!
//! The engine only emits `tracing` events; embedding applications and tests
//! decide whether to install a subscriber.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Parse a level name ("trace", "debug", "info", "warn"/"warning", "error").
pub fn parse_level(s: &str) -> Option<Level> {
    match s.trim().to_ascii_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" | "warning" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

/// Install a compact fmt subscriber filtered to this crate at `level`.
///
/// `RUST_LOG` directives, when present, are added on top. Returns `false` if a
/// global subscriber was already installed.
pub fn init_logging(level: Level) -> bool {
    let mut filter = EnvFilter::new(format!("testloom={level}"));
    if let Ok(extra) = std::env::var("RUST_LOG") {
        for directive in extra.split(',').filter_map(|d| d.parse().ok()) {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .compact()
        .try_init()
        .is_ok()
}
