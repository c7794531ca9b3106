pub mod config;
pub mod pipeline;

use tracing_subscriber::EnvFilter;

/// Install the global subscriber, writing to stderr so stdout stays clean.
///
/// Priority: explicit `filter` (CLI), then `RUST_LOG`, then the default.
pub fn init_tracing(filter: Option<&str>) {
    let filter = match filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
