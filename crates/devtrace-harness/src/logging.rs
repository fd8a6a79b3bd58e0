//! Subscriber installation.
//!
//! The engine crates only emit `tracing` events; binaries and test suites
//! call [`init_logging`] once to route them somewhere. Repeated calls are
//! no-ops, so every test can call [`init_test_logging`] unconditionally.

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

/// Environment variable holding the filter directives.
pub const LOG_ENV_VAR: &str = "DEVTRACE_LOG";
/// Directive used when [`LOG_ENV_VAR`] is unset or unparsable.
pub const DEFAULT_LOG_DIRECTIVE: &str = "info";

static INSTALLED: OnceLock<LogFormat> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable single-line output.
    Text,
    /// One JSON object per event.
    Json,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_DIRECTIVE))
}

/// Install the global subscriber.
///
/// Returns the format that is in effect: the requested one on first call,
/// the previously installed one afterwards. If another subscriber was set
/// outside this crate, that one stays in place.
pub fn init_logging(format: LogFormat) -> LogFormat {
    *INSTALLED.get_or_init(|| {
        let installed = match format {
            LogFormat::Text => tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .try_init(),
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(env_filter())
                .with_current_span(false)
                .try_init(),
        };
        if installed.is_err() {
            tracing::debug!(?format, "global subscriber already set elsewhere");
        }
        format
    })
}

/// Text subscriber writing through the test harness capture.
pub fn init_test_logging() {
    INSTALLED.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_test_writer()
            .try_init();
        LogFormat::Text
    });
}
