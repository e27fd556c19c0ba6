//! Logging setup for the CLI.
//!
//! The `logging` section of `config.yaml` picks the level and format; the
//! environment overrides it:
//!
//! - `APIMIGRATE_DEBUG=1|true|yes` - debug level
//! - `APIMIGRATE_LOG_LEVEL=trace|debug|info|warn|error` (or any filter directive)
//! - `APIMIGRATE_LOG_FORMAT=pretty|compact|json`
//!
//! Logs go to stderr so command output on stdout stays clean.

use std::env;
use std::sync::Once;

use apimigrate::{LogFormat, LoggingConfig};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

static INIT: Once = Once::new();

/// Check if debug logging is enabled via `APIMIGRATE_DEBUG`.
pub fn is_debug_enabled() -> bool {
    env::var("APIMIGRATE_DEBUG")
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

/// Effective filter directive.
pub fn resolve_level(config: &LoggingConfig, override_level: Option<&str>, debug: bool) -> String {
    match override_level.map(str::trim).filter(|l| !l.is_empty()) {
        Some(level) => level.to_lowercase(),
        None if debug => "debug".to_string(),
        None => config.level.clone(),
    }
}

/// Effective output format. Unknown overrides fall back to the config.
pub fn resolve_format(config: &LoggingConfig, override_format: Option<&str>) -> LogFormat {
    match override_format.map(str::to_lowercase).as_deref() {
        Some("pretty") => LogFormat::Pretty,
        Some("compact") => LogFormat::Compact,
        Some("json") => LogFormat::Json,
        _ => config.format,
    }
}

/// Install the global subscriber. Subsequent calls are no-ops.
pub fn init(config: &LoggingConfig) {
    INIT.call_once(|| {
        let level = resolve_level(
            config,
            env::var("APIMIGRATE_LOG_LEVEL").ok().as_deref(),
            is_debug_enabled(),
        );
        let format = resolve_format(config, env::var("APIMIGRATE_LOG_FORMAT").ok().as_deref());

        let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(filter);
        let result = match format {
            LogFormat::Json => registry
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .try_init(),
            LogFormat::Compact => registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .try_init(),
            LogFormat::Pretty => registry
                .with(fmt::layer().pretty().with_writer(std::io::stderr))
                .try_init(),
        };

        if result.is_ok() {
            tracing::debug!(level = %level, format = ?format, "Logging initialized");
        }
    });
}
