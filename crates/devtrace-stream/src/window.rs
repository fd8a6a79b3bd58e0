//! Exact record windows over a logical stream.
//!
//! A window `[offset_count, offset_count + total_count)` is addressed in
//! records as the sequential reader yields them: the first whole record
//! after the aging bytes is record 0. With no rejected files, record `k`
//! starts at logical byte `record_size * k + aging_offset`. A file over the
//! size cap is skipped exactly as the sequential reader skips it, so the
//! records it touches are not counted and numbering resumes at the next
//! record boundary.
//!
//! Only the files overlapping the window are opened.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use devtrace_error::{Result, TraceError};
use devtrace_types::{FixedRecord, decode_records};
use tracing::{debug, error, warn};

use crate::config::StreamConfig;
use crate::offset::{OffsetCalculator, boundary_skip};
use crate::slice::SliceFile;
use crate::telemetry::{StreamObserver, StreamTelemetryEvent, noop_observer};

const LOG_COMPONENT: &str = "devtrace.stream::window";

/// Bytes of one extracted window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowRead {
    bytes: Vec<u8>,
    record_size: usize,
    requested_records: u64,
}

impl WindowRead {
    fn empty(record_size: usize) -> Self {
        Self {
            bytes: Vec::new(),
            record_size,
            requested_records: 0,
        }
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Whole records actually assembled.
    #[must_use]
    pub fn record_count(&self) -> u64 {
        (self.bytes.len() / self.record_size) as u64
    }

    #[must_use]
    pub const fn requested_records(&self) -> u64 {
        self.requested_records
    }

    /// The stream ran out before the window was full (data partially aged out).
    #[must_use]
    pub fn is_short(&self) -> bool {
        self.record_count() < self.requested_records
    }

    /// Decode the window's records.
    pub fn decode<R: FixedRecord>(&self) -> Result<Vec<R>> {
        if R::SIZE != self.record_size {
            return Err(TraceError::invalid_argument(format!(
                "window holds {}-byte records, {} records are {} bytes",
                self.record_size,
                R::CATEGORY,
                R::SIZE
            )));
        }
        decode_records(&self.bytes)
    }
}

/// Exact-window reader; shares aging and size settings with [`OffsetCalculator`].
pub struct FileCalculator {
    offset: OffsetCalculator,
    max_read_file_bytes: u64,
    observer: Arc<dyn StreamObserver>,
}

impl std::fmt::Debug for FileCalculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCalculator")
            .field("offset", &self.offset)
            .field("max_read_file_bytes", &self.max_read_file_bytes)
            .finish_non_exhaustive()
    }
}

impl FileCalculator {
    pub fn new(files: &[SliceFile], record_size: usize, config: &StreamConfig) -> Result<Self> {
        Ok(Self {
            offset: OffsetCalculator::new(files, record_size, config)?,
            max_read_file_bytes: config.max_read_file_bytes,
            observer: noop_observer(),
        })
    }

    pub fn for_record<R: FixedRecord>(files: &[SliceFile], config: &StreamConfig) -> Result<Self> {
        Self::new(files, R::SIZE, config)
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn StreamObserver>) -> Self {
        self.offset = self.offset.with_observer(Arc::clone(&observer));
        self.observer = observer;
        self
    }

    /// The underlying aligned reader (aging offset, record size).
    #[must_use]
    pub const fn offset_calculator(&self) -> &OffsetCalculator {
        &self.offset
    }

    /// Extract records `[offset_count, offset_count + total_count)`.
    ///
    /// Returns exactly `total_count` records unless the stream is too short,
    /// in which case the assembled prefix is returned and
    /// [`WindowRead::is_short`] reports it.
    pub fn read_window(
        &self,
        files: &[SliceFile],
        offset_count: u64,
        total_count: u64,
    ) -> Result<WindowRead> {
        let record_size = self.offset.record_size();
        if total_count == 0 {
            return Ok(WindowRead::empty(record_size));
        }

        let record_bytes = record_size as u64;
        let requested = record_bytes.checked_mul(total_count).ok_or_else(|| {
            TraceError::invalid_argument(format!("window of {total_count} records overflows"))
        })?;
        let window_end = offset_count.checked_add(total_count).ok_or_else(|| {
            TraceError::invalid_argument(format!("window offset {offset_count} overflows"))
        })?;
        let aging = self.offset.aging_offset() as u64;

        let mut bytes =
            Vec::with_capacity(usize::try_from(requested.min(self.max_read_file_bytes)).unwrap_or(0));
        // Walk the files the way the sequential reader does, counting the
        // records each file completes without reading them until the window
        // is reached.
        let mut position = 0_u64;
        let mut skip = aging;
        let mut emitted = 0_u64;
        let mut pending: Vec<Segment<'_>> = Vec::new();

        for file in files {
            if emitted >= window_end {
                break;
            }
            position = position.saturating_add(file.size);
            if file.size > self.max_read_file_bytes {
                pending.clear();
                skip = boundary_skip(position, aging, record_bytes);
                warn!(
                    component = LOG_COMPONENT,
                    path = %file.path.display(),
                    file_size = file.size,
                    limit = self.max_read_file_bytes,
                    realign = skip,
                    "skipping slice file in window: size exceeds cap"
                );
                self.observer.on_event(&StreamTelemetryEvent::FileRejected {
                    category: file.category.clone(),
                    path: file.path.display().to_string(),
                    size: file.size,
                    limit: self.max_read_file_bytes,
                });
                continue;
            }

            let skipped = skip.min(file.size);
            skip -= skipped;
            pending.push(Segment {
                file,
                start: skipped,
                len: file.size - skipped,
            });
            let available: u64 = pending.iter().map(|segment| segment.len).sum();
            let complete = available / record_bytes;

            let first = offset_count.max(emitted);
            let last = window_end.min(emitted + complete);
            if first < last {
                let from = (first - emitted) * record_bytes;
                let to = (last - emitted) * record_bytes;
                let read = collect_range(&pending, from, to, &mut bytes)?;
                debug!(
                    component = LOG_COMPONENT,
                    path = %file.path.display(),
                    index = file.index,
                    first_record = first,
                    records = last - first,
                    read,
                    "collected window bytes"
                );
            }
            emitted += complete;
            keep_tail(&mut pending, available % record_bytes);
        }

        let assembled = bytes.len() as u64;
        bytes.truncate(bytes.len() - bytes.len() % record_size);
        let window = WindowRead {
            bytes,
            record_size,
            requested_records: total_count,
        };

        if window.is_short() {
            warn!(
                component = LOG_COMPONENT,
                category = %self.offset.category(),
                offset_count,
                total_count,
                assembled_records = window.record_count(),
                "window partially aged out or truncated"
            );
            self.observer.on_event(&StreamTelemetryEvent::WindowShort {
                category: self.offset.category().to_owned(),
                requested_bytes: requested,
                assembled_bytes: assembled,
            });
        }
        Ok(window)
    }
}

/// Unread bytes of one file that belong to records not yet completed.
#[derive(Debug, Clone, Copy)]
struct Segment<'f> {
    file: &'f SliceFile,
    start: u64,
    len: u64,
}

/// Append bytes `[from, to)` of the concatenated `segments` to `out`.
fn collect_range(segments: &[Segment<'_>], from: u64, to: u64, out: &mut Vec<u8>) -> Result<u64> {
    let mut cursor = 0_u64;
    let mut read = 0_u64;
    for segment in segments {
        let segment_end = cursor + segment.len;
        let lo = from.max(cursor);
        let hi = to.min(segment_end);
        if lo < hi {
            let mut handle = File::open(&segment.file.path).map_err(|err| {
                error!(
                    component = LOG_COMPONENT,
                    path = %segment.file.path.display(),
                    error = %err,
                    "cannot open slice file"
                );
                TraceError::Io(err)
            })?;
            handle.seek(SeekFrom::Start(segment.start + (lo - cursor)))?;
            read += handle.take(hi - lo).read_to_end(out)? as u64;
        }
        cursor = segment_end;
        if cursor >= to {
            break;
        }
    }
    Ok(read)
}

/// Keep only the last `keep` bytes of `segments`.
fn keep_tail(segments: &mut Vec<Segment<'_>>, keep: u64) {
    let mut keep = keep;
    let mut kept = Vec::new();
    for segment in segments.iter().rev() {
        if keep == 0 {
            break;
        }
        let take = keep.min(segment.len);
        kept.push(Segment {
            file: segment.file,
            start: segment.start + segment.len - take,
            len: take,
        });
        keep -= take;
    }
    kept.reverse();
    *segments = kept;
}

/// One-shot window extraction with a fresh [`FileCalculator`].
pub fn read_window(
    files: &[SliceFile],
    record_size: usize,
    offset_count: u64,
    total_count: u64,
    config: &StreamConfig,
) -> Result<WindowRead> {
    FileCalculator::new(files, record_size, config)?.read_window(files, offset_count, total_count)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use devtrace_types::{RecordKind, TaskRecord};
    use proptest::prelude::*;
    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::slice::{discover_slices, slice_file_name};
    use crate::telemetry::TelemetryRingBuffer;

    fn write_stream(stream: &[u8], cuts: &[usize]) -> (TempDir, Vec<SliceFile>) {
        let dir = tempdir().expect("tempdir");
        let mut bounds = cuts.to_vec();
        bounds.insert(0, 0);
        bounds.push(stream.len());
        for (index, w) in bounds.windows(2).enumerate() {
            let path = dir.path().join(slice_file_name("hwts", 0, index as u32));
            fs::write(path, &stream[w[0]..w[1]]).expect("write slice");
        }
        let files = discover_slices(dir.path(), "hwts", 0).expect("discover");
        (dir, files)
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_window_spanning_three_files() {
        // 10 aged bytes + 8 records of 16 bytes.
        let stream = patterned(10 + 8 * 16);
        let (_dir, files) = write_stream(&stream, &[20, 50, 90]);
        let window = read_window(&files, 16, 1, 5, &StreamConfig::default()).expect("window");
        assert!(!window.is_short());
        assert_eq!(window.record_count(), 5);
        assert_eq!(window.bytes(), &stream[10 + 16..10 + 6 * 16]);
    }

    #[test]
    fn test_window_starting_on_file_boundary() {
        let stream = patterned(4 * 32);
        let (_dir, files) = write_stream(&stream, &[64]);
        let window = read_window(&files, 32, 2, 2, &StreamConfig::default()).expect("window");
        assert_eq!(window.bytes(), &stream[64..128]);
    }

    #[test]
    fn test_short_window_reports_insufficient_data() {
        let stream = patterned(3 * 16);
        let (_dir, files) = write_stream(&stream, &[16]);
        let ring = Arc::new(TelemetryRingBuffer::new(4));
        let calc = FileCalculator::new(&files, 16, &StreamConfig::default())
            .expect("calc")
            .with_observer(ring.clone());
        let window = calc.read_window(&files, 1, 10).expect("window");
        assert!(window.is_short());
        assert_eq!(window.record_count(), 2);
        assert_eq!(window.requested_records(), 10);
        assert_eq!(ring.events_of_kind("window_short").len(), 1);

        let past_end = calc.read_window(&files, 50, 1).expect("window");
        assert_eq!(past_end.record_count(), 0);
        assert!(past_end.is_short());
    }

    fn capped(max_read_file_bytes: u64) -> StreamConfig {
        StreamConfig {
            max_read_file_bytes,
            ..StreamConfig::default()
        }
    }

    #[test]
    fn test_rejected_middle_file_is_skipped_like_sequential_reads() {
        // Records at 0, 64, ..., 320; the 200-byte middle file is over the cap
        // and cuts records 1 and 4, so the readable records are 0 and 5.
        let stream = patterned(384);
        let (_dir, files) = write_stream(&stream, &[100, 300]);
        let ring = Arc::new(TelemetryRingBuffer::new(8));
        let calc = FileCalculator::new(&files, 64, &capped(128))
            .expect("calc")
            .with_observer(ring.clone());

        let second = calc.read_window(&files, 1, 1).expect("window");
        assert!(!second.is_short());
        assert_eq!(second.bytes(), &stream[320..384]);

        let both = calc.read_window(&files, 0, 2).expect("window");
        assert_eq!(&both.bytes()[..64], &stream[..64]);
        assert_eq!(&both.bytes()[64..], &stream[320..384]);
        assert_eq!(ring.events_of_kind("file_rejected").len(), 2);

        let mut sequential = OffsetCalculator::new(&files, 64, &capped(128)).expect("calc");
        let mut joined = Vec::new();
        for file in &files {
            joined.extend(sequential.read_file(file).expect("read"));
        }
        assert_eq!(joined, both.into_bytes());
    }

    #[test]
    fn test_cap_applies_to_file_size_not_chunk() {
        // The window needs only the first 64 bytes of the 256-byte file, which
        // is below the cap, but the file itself is over it.
        let stream = patterned(384);
        let (_dir, files) = write_stream(&stream, &[64, 320]);
        let ring = Arc::new(TelemetryRingBuffer::new(8));
        let calc = FileCalculator::new(&files, 64, &capped(128))
            .expect("calc")
            .with_observer(ring.clone());
        let window = calc.read_window(&files, 1, 1).expect("window");
        assert_eq!(window.bytes(), &stream[320..384]);
        assert_eq!(ring.events_of_kind("file_rejected").len(), 1);
    }

    #[test]
    fn test_zero_count_window_touches_nothing() {
        let files = vec![SliceFile {
            path: "/nonexistent/hwts.data.0.slice_0".into(),
            category: "hwts".to_owned(),
            device_id: 0,
            index: 0,
            size: 640,
        }];
        let window = read_window(&files, 64, 3, 0, &StreamConfig::default()).expect("window");
        assert!(!window.is_short());
        assert!(window.bytes().is_empty());
    }

    #[test]
    fn test_window_decodes_task_records() {
        let mut stream = vec![0xEE_u8; 7];
        for task_id in 0..6_u32 {
            let record = TaskRecord {
                kind: RecordKind::Start,
                ai_core: false,
                counter: task_id as u16,
                stream_id: 1,
                task_id,
                timestamp: i64::from(task_id) * 100,
                batch_id: 0,
                core_id: 0,
            };
            stream.extend_from_slice(&record.encode().expect("encode"));
        }
        let (_dir, files) = write_stream(&stream, &[100, 200]);
        let calc = FileCalculator::for_record::<TaskRecord>(&files, &StreamConfig::default())
            .expect("calc");
        assert_eq!(calc.offset_calculator().aging_offset(), 7);
        let records: Vec<TaskRecord> = calc
            .read_window(&files, 2, 3)
            .expect("window")
            .decode()
            .expect("decode");
        let ids: Vec<u32> = records.iter().map(|r| r.task_id).collect();
        assert_eq!(ids, vec![2, 3, 4]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_window_equals_logical_subslice(
            record_size in 1_usize..24,
            records in 1_usize..30,
            aged in 0_usize..24,
            cuts in proptest::collection::vec(0_usize..1000, 0..4),
            k in 0_usize..30,
            n in 0_usize..30,
        ) {
            let aged = aged % record_size;
            let total = aged + records * record_size;
            let stream = patterned(total);
            let mut cuts: Vec<usize> = cuts.into_iter().map(|c| c % (total + 1)).collect();
            cuts.sort_unstable();
            let (_dir, files) = write_stream(&stream, &cuts);

            let k = k % records;
            let n = n % (records - k + 1);
            let window = read_window(&files, record_size, k as u64, n as u64, &StreamConfig::default())
                .expect("window");
            prop_assert!(!window.is_short());
            let lo = aged + k * record_size;
            let hi = aged + (k + n) * record_size;
            prop_assert_eq!(window.bytes(), &stream[lo..hi]);
        }

        #[test]
        fn prop_window_matches_sequential_records_under_cap(
            record_size in 1_usize..24,
            total in 0_usize..400,
            cuts in proptest::collection::vec(0_usize..1000, 0..5),
            cap in 1_u64..200,
            k in 0_u64..20,
            n in 1_u64..20,
        ) {
            let stream = patterned(total);
            let mut cuts: Vec<usize> = cuts.into_iter().map(|c| c % (total + 1)).collect();
            cuts.sort_unstable();
            let (_dir, files) = write_stream(&stream, &cuts);
            let config = capped(cap);

            let mut sequential = OffsetCalculator::new(&files, record_size, &config).expect("calc");
            let mut joined = Vec::new();
            for file in &files {
                joined.extend(sequential.read_file(file).expect("read"));
            }
            let available = (joined.len() / record_size) as u64;

            let window = read_window(&files, record_size, k, n, &config).expect("window");
            let lo = (k.min(available) as usize) * record_size;
            let hi = ((k + n).min(available) as usize) * record_size;
            prop_assert_eq!(window.bytes(), &joined[lo..hi]);
            prop_assert_eq!(window.is_short(), k + n > available);
        }
    }
}
