//! Stream reconstruction settings.

use std::path::Path;

use devtrace_error::{Result, TraceError};
use devtrace_types::{AIC_PMU_RECORD_SIZE, HWTS_RECORD_SIZE};
use serde::Deserialize;

/// Hard cap on bytes read from a single slice file (64 MiB).
pub const DEFAULT_MAX_READ_FILE_BYTES: u64 = 64 * 1024 * 1024;

/// Settings shared by every calculator of one reconstruction pass.
///
/// Every field has a default, so a TOML document only needs the keys it
/// overrides:
///
/// ```toml
/// max_read_file_bytes = 1048576
/// require_aic = true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamConfig {
    /// Files larger than this are treated as corrupt size metadata.
    pub max_read_file_bytes: u64,
    /// Record size of the HWTS log category.
    pub hwts_record_size: usize,
    /// Record size of the AI-core PMU category.
    pub aic_record_size: usize,
    /// Whether a missing AI-core PMU category stops the pass.
    pub require_aic: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_read_file_bytes: DEFAULT_MAX_READ_FILE_BYTES,
            hwts_record_size: HWTS_RECORD_SIZE,
            aic_record_size: AIC_PMU_RECORD_SIZE,
            require_aic: false,
        }
    }
}

impl StreamConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|err| TraceError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hwts_record_size == 0 || self.aic_record_size == 0 {
            return Err(TraceError::Config(
                "record sizes must be non-zero".to_owned(),
            ));
        }
        if self.max_read_file_bytes == 0 {
            return Err(TraceError::Config(
                "max_read_file_bytes must be non-zero".to_owned(),
            ));
        }
        Ok(())
    }
}
