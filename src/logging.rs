//! Logging setup
//!
//! Structured logs go to stderr so stdout carries nothing but the output
//! CSV. `RUST_LOG` takes precedence over the level passed in.

use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber
///
/// # Arguments
/// * `level` - Default filter (e.g. "info", "purchase_settlement=debug")
///
/// Calling it again once a subscriber is installed does nothing.
pub fn init_logger(level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logger_twice_is_harmless() {
        init_logger("warn");
        init_logger("debug");
        tracing::info!("logger installed");
    }
}
