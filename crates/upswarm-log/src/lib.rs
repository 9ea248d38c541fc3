// ABOUTME: Shared logging setup for upswarm binaries
// ABOUTME: init() for the supervisor daemon, init_worker() for spawned service instances

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Build an env filter with `default` as the baseline level. RUST_LOG directives win.
fn filter(default: Level) -> EnvFilter {
    EnvFilter::from_default_env().add_directive(default.into())
}

/// Supervisor logging to stderr. Default: INFO level, RUST_LOG override.
pub fn init() {
    tracing_subscriber::fmt().with_env_filter(filter(Level::INFO)).init();
}

/// Logging for a spawned service instance.
///
/// The supervisor relays every child output line into its own log with the
/// service name attached, so workers write plain lines: no ANSI colors, no
/// timestamps, no level padding noise beyond the level itself.
pub fn init_worker() {
    tracing_subscriber::fmt()
        .with_env_filter(filter(Level::INFO))
        .with_ansi(false)
        .without_time()
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
