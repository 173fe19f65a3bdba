// ABOUTME: Structured logging setup for the binary
// ABOUTME: RUST_LOG takes precedence over the configured level

use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber. Call once, from `main`.
pub fn init(log_level: &str, json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
