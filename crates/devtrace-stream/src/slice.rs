//! Slice file naming and discovery.
//!
//! Slice files are named `<category>.data.<device>.slice_<index>`. Within one
//! (category, device) pair the index orders the files of the logical stream.

use std::fs;
use std::path::{Path, PathBuf};

use devtrace_error::{Result, TraceError};
use tracing::{debug, error, info};

const LOG_COMPONENT: &str = "devtrace.stream::slice";
const SLICE_MARKER: &str = ".slice_";

/// One physical slice file of a record category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceFile {
    pub path: PathBuf,
    pub category: String,
    pub device_id: u32,
    /// Sequence index parsed from the file name.
    pub index: u32,
    /// Size in bytes captured at discovery time.
    pub size: u64,
}

impl SliceFile {
    /// Build from a path, reading the size from file metadata.
    ///
    /// Returns `Ok(None)` when the file name does not follow the slice
    /// naming scheme.
    pub fn from_path(path: &Path) -> Result<Option<Self>> {
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            return Ok(None);
        };
        let Some((category, device_id, index)) = parse_slice_name(name) else {
            return Ok(None);
        };
        let size = fs::metadata(path)?.len();
        Ok(Some(Self {
            path: path.to_path_buf(),
            category: category.to_owned(),
            device_id,
            index,
            size,
        }))
    }
}

/// Build a slice file name: `<category>.data.<device>.slice_<index>`.
#[must_use]
pub fn slice_file_name(category: &str, device_id: u32, index: u32) -> String {
    format!("{category}.data.{device_id}{SLICE_MARKER}{index}")
}

/// List the slices of one (category, device) pair in sequence order.
///
/// A missing directory yields an empty list; use [`require_slices`] when the
/// category is mandatory.
pub fn discover_slices(dir: &Path, category: &str, device_id: u32) -> Result<Vec<SliceFile>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut slices = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        let Some(slice) = SliceFile::from_path(&path)? else {
            debug!(
                component = LOG_COMPONENT,
                path = %path.display(),
                "skipping file outside the slice naming scheme"
            );
            continue;
        };
        if slice.category == category && slice.device_id == device_id {
            slices.push(slice);
        }
    }
    slices.sort_by_key(|slice| slice.index);

    debug!(
        component = LOG_COMPONENT,
        dir = %dir.display(),
        category,
        device_id,
        slice_count = slices.len(),
        "discovered slice files"
    );
    Ok(slices)
}

/// Like [`discover_slices`], but an empty result is a hard failure.
pub fn require_slices(dir: &Path, category: &str, device_id: u32) -> Result<Vec<SliceFile>> {
    let slices = discover_slices(dir, category, device_id)?;
    if slices.is_empty() {
        error!(
            component = LOG_COMPONENT,
            dir = %dir.display(),
            category,
            device_id,
            "required trace category has no slice files"
        );
        return Err(TraceError::MissingCategory {
            category: category.to_owned(),
            dir: dir.to_path_buf(),
        });
    }
    info!(
        component = LOG_COMPONENT,
        category,
        device_id,
        slice_count = slices.len(),
        total_bytes = slices.iter().map(|slice| slice.size).sum::<u64>(),
        "located required trace category"
    );
    Ok(slices)
}

fn parse_slice_name(name: &str) -> Option<(&str, u32, u32)> {
    let (prefix, index_text) = name.rsplit_once(SLICE_MARKER)?;
    let index = index_text.parse::<u32>().ok()?;
    let mut parts = prefix.split('.');
    let category = parts.next()?;
    if category.is_empty() || parts.next()? != "data" {
        return None;
    }
    let device_id = parts.next()?.parse::<u32>().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((category, device_id, index))
}
