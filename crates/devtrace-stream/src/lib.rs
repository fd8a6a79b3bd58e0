//! Logical byte-stream reconstruction over sliced, aged trace files.
//!
//! A record category (HWTS log, AI-core PMU samples, ...) is written as a
//! numbered family of slice files holding back-to-back fixed-size records.
//! The on-device capture buffer is circular, so the oldest retained file may
//! start in the middle of a record. This crate treats a family of slices as
//! one logical stream and hands out record-aligned byte buffers:
//!
//! - [`OffsetCalculator`]: sequential aligned reads, one file at a time
//! - [`FileCalculator`]: exact `[offset, offset + count)` record windows
//! - [`FileReverseCalculator`]: tail-first scans for a task key

pub mod cache;
pub mod config;
pub mod offset;
pub mod reverse;
pub mod slice;
pub mod telemetry;
pub mod window;

pub use cache::ByteWindowCache;
pub use config::{DEFAULT_MAX_READ_FILE_BYTES, StreamConfig};
pub use offset::OffsetCalculator;
pub use reverse::{FileReverseCalculator, TailScan, TailWalk};
pub use slice::{SliceFile, discover_slices, require_slices, slice_file_name};
pub use telemetry::{
    NoOpObserver, StreamObserver, StreamTelemetryEvent, TelemetryRingBuffer, noop_observer,
};
pub use window::{FileCalculator, WindowRead, read_window};
