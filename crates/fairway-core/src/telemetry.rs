use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber with `info` as the default level.
///
/// - Debug builds: human-readable output
/// - Release builds, or `FAIRWAY_LOG_FORMAT=json`: JSON lines
///
/// `RUST_LOG` overrides the level. Thread names are included so dispatcher
/// and ingest lines can be told apart from handler tasks.
pub fn init_tracing() {
    init_tracing_with("info");
}

/// Same as [`init_tracing`] with a different fallback filter. Does nothing
/// if a global subscriber is already installed.
pub fn init_tracing_with(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let json = std::env::var("FAIRWAY_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"))
        || !cfg!(debug_assertions);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.with_target(true).try_init()
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
