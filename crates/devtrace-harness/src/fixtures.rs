//! Synthetic trace directories.
//!
//! A [`SliceFixture`] owns a temporary directory and writes logical streams
//! into it as numbered slice files. Streams are built from encoded records
//! behind an optional aging prefix and cut at caller-chosen byte positions,
//! so records can be split across files exactly the way the device does.

use std::fs;
use std::path::{Path, PathBuf};

use devtrace_error::Result;
use devtrace_types::{
    AicPmuRecord, IterId, PMU_EVENT_COUNT, RecordKind, StepTraceRecord, TaskRecord,
};
use tempfile::TempDir;
use tracing::debug;

const LOG_COMPONENT: &str = "devtrace.harness::fixtures";

/// Temporary directory of slice files.
#[derive(Debug)]
pub struct SliceFixture {
    dir: TempDir,
}

impl SliceFixture {
    pub fn new() -> Result<Self> {
        Ok(Self {
            dir: tempfile::tempdir()?,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `stream` as slices `0..=cuts.len()` of `category` on `device_id`.
    ///
    /// `cuts` are byte positions into `stream`; they are sorted and clamped,
    /// and duplicate cuts produce empty slice files.
    pub fn write_stream(
        &self,
        category: &str,
        device_id: u32,
        stream: &[u8],
        cuts: &[usize],
    ) -> Result<Vec<PathBuf>> {
        let mut bounds: Vec<usize> = cuts.iter().map(|&cut| cut.min(stream.len())).collect();
        bounds.sort_unstable();
        bounds.insert(0, 0);
        bounds.push(stream.len());

        let mut paths = Vec::with_capacity(bounds.len() - 1);
        for (index, window) in bounds.windows(2).enumerate() {
            let index = u32::try_from(index).unwrap_or(u32::MAX);
            let path = self
                .dir
                .path()
                .join(format!("{category}.data.{device_id}.slice_{index}"));
            fs::write(&path, &stream[window[0]..window[1]])?;
            paths.push(path);
        }
        debug!(
            component = LOG_COMPONENT,
            category,
            device_id,
            stream_bytes = stream.len(),
            slice_count = paths.len(),
            "wrote fixture stream"
        );
        Ok(paths)
    }

    /// Encode `records` behind `aged` filler bytes and write them as HWTS slices.
    pub fn write_hwts(
        &self,
        device_id: u32,
        records: &[TaskRecord],
        aged: usize,
        cuts: &[usize],
    ) -> Result<Vec<PathBuf>> {
        let mut stream = aged_prefix(aged);
        stream.extend(encode_hwts(records)?);
        self.write_stream("hwts", device_id, &stream, cuts)
    }

    /// Encode `records` behind `aged` filler bytes and write them as AI-core slices.
    pub fn write_aic(
        &self,
        device_id: u32,
        records: &[AicPmuRecord],
        aged: usize,
        cuts: &[usize],
    ) -> Result<Vec<PathBuf>> {
        let mut stream = aged_prefix(aged);
        stream.extend(encode_aic(records)?);
        self.write_stream("aicore", device_id, &stream, cuts)
    }

    /// Drop a file that must be ignored by slice discovery.
    pub fn write_stray(&self, name: &str) -> Result<PathBuf> {
        let path = self.dir.path().join(name);
        fs::write(&path, b"not a slice")?;
        Ok(path)
    }
}

/// Filler standing in for the partial record the capture buffer aged out.
#[must_use]
pub fn aged_prefix(len: usize) -> Vec<u8> {
    vec![0xA5; len]
}

pub fn encode_hwts(records: &[TaskRecord]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(records.len() * 64);
    for record in records {
        out.extend_from_slice(&record.encode()?);
    }
    Ok(out)
}

pub fn encode_aic(records: &[AicPmuRecord]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(records.len() * 128);
    for record in records {
        out.extend_from_slice(&record.encode()?);
    }
    Ok(out)
}

/// `parts - 1` cut points splitting `len` bytes into near-equal slices.
#[must_use]
pub fn even_cuts(len: usize, parts: usize) -> Vec<usize> {
    let parts = parts.max(1);
    (1..parts).map(|i| len * i / parts).collect()
}

fn task_record(kind: RecordKind, stream_id: u32, task_id: u32, timestamp: i64) -> TaskRecord {
    TaskRecord {
        kind,
        ai_core: true,
        counter: 0,
        stream_id,
        task_id,
        timestamp,
        batch_id: 0,
        core_id: 0,
    }
}

/// AI-core start record.
#[must_use]
pub fn start(stream_id: u32, task_id: u32, timestamp: i64) -> TaskRecord {
    task_record(RecordKind::Start, stream_id, task_id, timestamp)
}

/// AI-core end record.
#[must_use]
pub fn end(stream_id: u32, task_id: u32, timestamp: i64) -> TaskRecord {
    task_record(RecordKind::End, stream_id, task_id, timestamp)
}

/// Step-trace row for model 1, index 0.
#[must_use]
pub const fn step(iter_id: IterId, start_time: i64, end_time: i64) -> StepTraceRecord {
    StepTraceRecord {
        model_id: 1,
        index_id: 0,
        iter_id,
        start_time,
        end_time,
    }
}

/// PMU sample with `total_cycles` derived from the key.
#[must_use]
pub fn aic_sample(stream_id: u32, task_id: u32, start_ticks: i64) -> AicPmuRecord {
    AicPmuRecord {
        tag: 0x01,
        stream_id,
        task_id,
        total_cycles: u64::from(stream_id) * 1_000 + u64::from(task_id),
        start_ticks,
        events: [0; PMU_EVENT_COUNT],
    }
}
