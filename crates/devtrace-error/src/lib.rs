//! Error type shared by every devtrace crate.
//!
//! Only conditions that stop a reconstruction pass are represented here.
//! Recoverable anomalies (oversized slice files, short windows, orphaned task
//! records, tail scans without a match) are logged and reported as values by
//! the crates that detect them.

use std::path::PathBuf;

/// Convenience alias used throughout the workspace.
pub type Result<T, E = TraceError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    /// Opening or reading a slice file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record category the caller required has no slice files.
    #[error("no slice files for required category `{category}` under {}", dir.display())]
    MissingCategory { category: String, dir: PathBuf },

    /// Caller passed an argument the engine cannot work with.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A fixed-size record could not be decoded.
    #[error("cannot decode {category} record: {detail}")]
    RecordDecode { category: &'static str, detail: String },

    /// An iteration id was requested that the index does not know about.
    #[error("unknown iteration {0}")]
    UnknownIteration(u32),

    /// An operation was attempted in a state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Configuration could not be parsed or failed validation.
    #[error("configuration error: {0}")]
    Config(String),
}

impl TraceError {
    /// Shorthand for [`TraceError::InvalidArgument`].
    pub fn invalid_argument(detail: impl Into<String>) -> Self {
        Self::InvalidArgument(detail.into())
    }

    /// Shorthand for [`TraceError::InvalidState`].
    pub fn invalid_state(detail: impl Into<String>) -> Self {
        Self::InvalidState(detail.into())
    }

    /// Whether the error stems from the filesystem rather than from the data.
    #[must_use]
    pub const fn is_resource_failure(&self) -> bool {
        matches!(self, Self::Io(_) | Self::MissingCategory { .. })
    }
}
