// ABOUTME: Tracing subscriber setup for the fleet binary
// ABOUTME: RUST_LOG wins, then FLEET_LOG_LEVEL, then info

use fleet_config::constants::RUST_LOG;
use tracing_subscriber::EnvFilter;

/// Filter directive from an optional `RUST_LOG` value and the configured level
pub fn filter_directive(rust_log: Option<&str>, level: &str) -> String {
    rust_log
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| Some(level.trim()).filter(|v| !v.is_empty()))
        .unwrap_or("info")
        .to_string()
}

pub fn init(level: &str) {
    let rust_log = std::env::var(RUST_LOG).ok();
    let directive = filter_directive(rust_log.as_deref(), level);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();
}
