//! Process-wide log setup for blockscript hosts and tools.

/// Initialize structured logging from the environment.
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(&tracing::LogConfig::from_env());
}

/// Subscriber configuration (filters, output format).
pub mod tracing;

pub use tracing::{LogConfig, LogFormat};
