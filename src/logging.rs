//! Log output.
//!
//! Components log through `tracing` with structured fields (`stream`,
//! `partition`, `checkpoint_id`, `instance`). Call [`init_tracing`] once at
//! startup to print them; without it, events are discarded.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Installs a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `config.filter`.
///
/// Returns `false` when a global subscriber was already installed, which
/// makes the call safe to repeat from tests.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.ansi)
        .with_target(true)
        .try_init()
        .is_ok()
}
