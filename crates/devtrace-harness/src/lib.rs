//! Shared test support for the devtrace workspace.
//!
//! - [`logging`]: one-shot `tracing` subscriber setup driven by `DEVTRACE_LOG`
//! - [`fixtures`]: synthetic slice files (with aging prefixes and arbitrary
//!   file cuts) and step-trace builders

pub mod fixtures;
pub mod logging;

pub use fixtures::{
    SliceFixture, aged_prefix, aic_sample, encode_aic, encode_hwts, end, even_cuts, start, step,
};
pub use logging::{DEFAULT_LOG_DIRECTIVE, LOG_ENV_VAR, LogFormat, init_logging, init_test_logging};
