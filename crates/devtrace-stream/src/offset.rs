//! Sequential, record-aligned reads over a logical stream.
//!
//! The stream is the concatenation of all slices of one category. Because the
//! capture buffer ages out its oldest bytes, the stream length is generally
//! not a multiple of the record size; the excess
//! (`total_bytes % record_size`) sits at the very start of the oldest file and
//! is skipped once, on the first read. After that, every read prepends the
//! fragment left over by the previous file and returns only whole records.
//!
//! A file rejected by the size cap is never read. Its bytes still count
//! toward the logical position, and reading resumes at the first record
//! boundary after it.

use std::fs::File;
use std::io::{self, Read};
use std::sync::Arc;

use devtrace_error::{Result, TraceError};
use devtrace_types::FixedRecord;
use tracing::{debug, error, warn};

use crate::cache::ByteWindowCache;
use crate::config::StreamConfig;
use crate::slice::SliceFile;
use crate::telemetry::{StreamObserver, StreamTelemetryEvent, noop_observer};

const LOG_COMPONENT: &str = "devtrace.stream::offset";

/// Aligned sequential reader for one logical stream.
pub struct OffsetCalculator {
    category: String,
    record_size: usize,
    aging_offset: usize,
    /// Bytes to drop before the next record boundary: the aging prefix, or
    /// the tail of a record cut by a rejected file.
    skip_remaining: u64,
    /// Logical stream bytes consumed so far, rejected files included.
    position: u64,
    /// Set once the first read happened; freezes the aging offset.
    has_read: bool,
    cache: ByteWindowCache,
    max_read_file_bytes: u64,
    observer: Arc<dyn StreamObserver>,
}

impl std::fmt::Debug for OffsetCalculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffsetCalculator")
            .field("category", &self.category)
            .field("record_size", &self.record_size)
            .field("aging_offset", &self.aging_offset)
            .field("has_read", &self.has_read)
            .field("position", &self.position)
            .field("cached_bytes", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl OffsetCalculator {
    /// Create a reader for `files` with an explicit record size.
    pub fn new(files: &[SliceFile], record_size: usize, config: &StreamConfig) -> Result<Self> {
        if record_size == 0 {
            return Err(TraceError::invalid_argument("record size must be non-zero"));
        }
        let aging_offset = Self::compute_aging_offset(files, record_size);
        let category = files
            .first()
            .map_or_else(|| "unknown".to_owned(), |file| file.category.clone());
        debug!(
            component = LOG_COMPONENT,
            category = %category,
            record_size,
            aging_offset,
            file_count = files.len(),
            "computed aging offset"
        );
        Ok(Self {
            category,
            record_size,
            aging_offset,
            skip_remaining: aging_offset as u64,
            position: 0,
            has_read: false,
            cache: ByteWindowCache::new(),
            max_read_file_bytes: config.max_read_file_bytes,
            observer: noop_observer(),
        })
    }

    /// Create a reader sized for record type `R`.
    pub fn for_record<R: FixedRecord>(files: &[SliceFile], config: &StreamConfig) -> Result<Self> {
        Self::new(files, R::SIZE, config)
    }

    /// Route telemetry events to `observer`.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn StreamObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Bytes at the start of the oldest file that precede the first whole record.
    #[must_use]
    pub fn compute_aging_offset(files: &[SliceFile], record_size: usize) -> usize {
        if record_size == 0 {
            return 0;
        }
        let total: u64 = files.iter().map(|file| file.size).sum();
        // The remainder is below record_size, so it always fits in usize.
        usize::try_from(total % record_size as u64).unwrap_or(0)
    }

    /// Recompute the aging offset for a changed file list.
    ///
    /// Ignored once reading has started: bytes already returned are aligned by
    /// construction, so the historical aging point no longer applies. Returns
    /// whether the offset was updated.
    pub fn update_aging_offset(&mut self, files: &[SliceFile]) -> bool {
        if self.has_read {
            return false;
        }
        self.aging_offset = Self::compute_aging_offset(files, self.record_size);
        self.skip_remaining = self.aging_offset as u64;
        true
    }

    #[must_use]
    pub const fn aging_offset(&self) -> usize {
        self.aging_offset
    }

    #[must_use]
    pub const fn record_size(&self) -> usize {
        self.record_size
    }

    #[must_use]
    pub fn category(&self) -> &str {
        &self.category
    }

    #[must_use]
    pub const fn has_read(&self) -> bool {
        self.has_read
    }

    /// Logical stream bytes consumed so far, rejected files included.
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.position
    }

    /// Bytes currently carried over to the next read.
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.cache.len()
    }

    /// Read one file's worth of bytes and return the record-aligned part.
    ///
    /// `file_size` above the configured cap is treated as corrupt metadata:
    /// nothing is read, an empty buffer is returned, and the next read
    /// starts at the first record boundary past the rejected bytes.
    pub fn read_aligned<R: Read>(&mut self, reader: &mut R, file_size: u64) -> Result<Vec<u8>> {
        if file_size > self.max_read_file_bytes {
            self.reject(String::new(), file_size);
            return Ok(Vec::new());
        }

        let mut remaining = file_size;
        if self.skip_remaining > 0 {
            let skip = remaining.min(self.skip_remaining);
            let skipped = io::copy(&mut reader.by_ref().take(skip), &mut io::sink())?;
            self.skip_remaining -= skipped;
            remaining -= skipped;
        }
        self.has_read = true;
        self.position = self.position.saturating_add(file_size);

        let mut buf = self.cache.take();
        reader.by_ref().take(remaining).read_to_end(&mut buf)?;

        let leftover = buf.len() % self.record_size;
        let aligned_len = buf.len() - leftover;
        self.cache.store(&buf[aligned_len..]);
        buf.truncate(aligned_len);
        Ok(buf)
    }

    /// Open `file` and read it through [`Self::read_aligned`].
    ///
    /// Failing to open the file is fatal for the pass and propagates.
    pub fn read_file(&mut self, file: &SliceFile) -> Result<Vec<u8>> {
        if file.size > self.max_read_file_bytes {
            self.reject(file.path.display().to_string(), file.size);
            return Ok(Vec::new());
        }

        let mut handle = File::open(&file.path).map_err(|err| {
            error!(
                component = LOG_COMPONENT,
                path = %file.path.display(),
                error = %err,
                "cannot open slice file"
            );
            TraceError::Io(err)
        })?;
        let bytes = self.read_aligned(&mut handle, file.size)?;

        debug!(
            component = LOG_COMPONENT,
            path = %file.path.display(),
            index = file.index,
            bytes_returned = bytes.len(),
            leftover = self.cache.len(),
            "read aligned slice"
        );
        self.observer.on_event(&StreamTelemetryEvent::FileRead {
            category: file.category.clone(),
            index: file.index,
            bytes_returned: bytes.len() as u64,
            leftover: self.cache.len() as u64,
        });
        Ok(bytes)
    }

    /// Step over a rejected file without reading it.
    ///
    /// The cached fragment belonged to a record that continues inside the
    /// rejected bytes, so it is dropped along with the partial record that
    /// ends after them.
    fn reject(&mut self, path: String, file_size: u64) {
        let dropped = self.cache.len();
        self.cache.clear();
        self.has_read = true;
        self.position = self.position.saturating_add(file_size);
        self.skip_remaining = boundary_skip(
            self.position,
            self.aging_offset as u64,
            self.record_size as u64,
        );
        warn!(
            component = LOG_COMPONENT,
            category = %self.category,
            path = %path,
            file_size,
            limit = self.max_read_file_bytes,
            dropped,
            realign = self.skip_remaining,
            "rejecting slice file: size exceeds cap"
        );
        self.observer.on_event(&StreamTelemetryEvent::FileRejected {
            category: self.category.clone(),
            path,
            size: file_size,
            limit: self.max_read_file_bytes,
        });
    }

    /// Finish the stream, returning the number of dangling bytes that never
    /// completed a record.
    pub fn finish(mut self) -> usize {
        let dangling = self.cache.len();
        if dangling > 0 {
            warn!(
                component = LOG_COMPONENT,
                category = %self.category,
                dangling,
                "stream ended inside a record; trailing bytes dropped"
            );
        }
        self.cache.clear();
        dangling
    }
}

/// Bytes from logical `position` to the next record boundary.
///
/// Records start at `aging + k * record_size`; a position inside the aging
/// prefix resumes at the first record.
pub(crate) const fn boundary_skip(position: u64, aging: u64, record_size: u64) -> u64 {
    if position < aging {
        return aging - position;
    }
    (record_size - (position - aging) % record_size) % record_size
}
