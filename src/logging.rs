//! Logging setup

use tracing::Level;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Noisy dependencies held at `warn`
const QUIET_TARGETS: &[&str] = &["tokio=warn", "ipstack=warn"];

/// Map a level name to a [`Level`], defaulting to `INFO`
#[must_use]
pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Filter combining `RUST_LOG` with the configured level
#[must_use]
pub fn build_filter(config: &LogConfig) -> EnvFilter {
    QUIET_TARGETS.iter().filter_map(|d| d.parse::<Directive>().ok()).fold(
        EnvFilter::from_default_env().add_directive(parse_level(&config.level).into()),
        EnvFilter::add_directive,
    )
}

/// Install the global subscriber
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(
    config: &LogConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(build_filter(config))
        .with_target(config.target);

    if config.format == "json" {
        subscriber.json().try_init()
    } else {
        subscriber.try_init()
    }
}
