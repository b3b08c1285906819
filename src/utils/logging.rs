use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Installs the global `fmt` subscriber.
///
/// Directives in `RUST_LOG` win over `default_level`. When a subscriber is
/// already installed the call leaves it in place.
pub fn init(default_level: &str) {
    let filter = EnvFilter::builder()
        .with_default_directive(parse_level(default_level).into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Maps a configured level name onto a filter, defaulting to `INFO`.
pub fn parse_level(name: &str) -> LevelFilter {
    match name.to_lowercase().as_str() {
        "off" => LevelFilter::OFF,
        "error" => LevelFilter::ERROR,
        "warn" | "warning" => LevelFilter::WARN,
        "debug" => LevelFilter::DEBUG,
        "trace" => LevelFilter::TRACE,
        _ => LevelFilter::INFO,
    }
}
