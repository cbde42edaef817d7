//! Log level control.
//!
//! The library only emits `tracing` events; installing a subscriber is left to the application.
//! With the `log-init` feature, [`init`] installs a `fmt` subscriber at the level named by
//! `RATEWINDOW_LOG_LEVEL`.

use tracing::Level;

pub const LOG_LEVEL_ENV: &str = "RATEWINDOW_LOG_LEVEL";

/// Parse a level name: `DEBUG`, `INFO`, `WARN`/`WARNING` or `ERROR`, any case.
pub fn parse_level(value: &str) -> Option<Level> {
    match value.trim().to_ascii_uppercase().as_str() {
        "DEBUG" => Some(Level::DEBUG),
        "INFO" => Some(Level::INFO),
        "WARN" | "WARNING" => Some(Level::WARN),
        "ERROR" => Some(Level::ERROR),
        _ => None,
    }
}

/// Level from `RATEWINDOW_LOG_LEVEL`, if set to a known name.
pub fn level_from_env() -> Option<Level> {
    std::env::var(LOG_LEVEL_ENV).ok().as_deref().and_then(parse_level)
}

/// Install a global `fmt` subscriber at the env level (default `INFO`).
///
/// Returns `false` if a global subscriber was already set.
#[cfg(feature = "log-init")]
pub fn init() -> bool {
    let level = level_from_env().unwrap_or(Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).with_target(true).try_init().is_ok()
}
