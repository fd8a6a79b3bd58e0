//! Structured telemetry for stream reconstruction.
//!
//! Every recovered anomaly (rejected file, short window, tail scan without a
//! match, orphaned task record) is both logged through `tracing` and handed to
//! a [`StreamObserver`], so tests and callers can assert on what was skipped
//! without scraping log output.
//!
//! Observers MUST NOT block or perform I/O.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

/// Structured event emitted by the reconstruction engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StreamTelemetryEvent {
    /// A slice file was not read because its size exceeded the cap.
    FileRejected {
        category: String,
        path: String,
        size: u64,
        limit: u64,
    },

    /// A slice file was read through the aligned reader.
    FileRead {
        category: String,
        index: u32,
        /// Record-aligned bytes handed to the caller.
        bytes_returned: u64,
        /// Bytes carried over to the next file.
        leftover: u64,
    },

    /// An exact window could not be filled from the available files.
    WindowShort {
        category: String,
        requested_bytes: u64,
        assembled_bytes: u64,
    },

    /// A reverse scan exhausted the stream without finding its target.
    TailNotFound {
        category: String,
        target: String,
        scanned: u64,
    },

    /// A start record was superseded by a later start for the same task.
    OrphanStart { stream_id: u32, task_id: u32 },

    /// An end record arrived with no pending start.
    UnexpectedEnd { stream_id: u32, task_id: u32 },

    /// The reconciler moved its primary pointer to a new iteration.
    IterationActivated {
        iter_id: u32,
        hwts_offset: u64,
        newly_active: usize,
    },
}

impl StreamTelemetryEvent {
    /// Short classification label for this event kind.
    #[must_use]
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::FileRejected { .. } => "file_rejected",
            Self::FileRead { .. } => "file_read",
            Self::WindowShort { .. } => "window_short",
            Self::TailNotFound { .. } => "tail_not_found",
            Self::OrphanStart { .. } => "orphan_start",
            Self::UnexpectedEnd { .. } => "unexpected_end",
            Self::IterationActivated { .. } => "iteration_activated",
        }
    }

    /// Whether the event reports data that was skipped or could not be found.
    #[must_use]
    pub fn is_anomaly(&self) -> bool {
        !matches!(
            self,
            Self::FileRead { .. } | Self::IterationActivated { .. }
        )
    }
}

/// Receiver for [`StreamTelemetryEvent`]s.
pub trait StreamObserver: Send + Sync {
    fn on_event(&self, event: &StreamTelemetryEvent);
}

/// Observer that drops every event.
pub struct NoOpObserver;

impl StreamObserver for NoOpObserver {
    #[inline(always)]
    fn on_event(&self, _event: &StreamTelemetryEvent) {}
}

/// Shared no-op observer handle; the default for every calculator.
#[must_use]
pub fn noop_observer() -> Arc<dyn StreamObserver> {
    Arc::new(NoOpObserver)
}

/// Ring-buffer observer that keeps the last N events.
pub struct TelemetryRingBuffer {
    events: Mutex<RingBufferInner>,
}

struct RingBufferInner {
    buf: Vec<StreamTelemetryEvent>,
    capacity: usize,
    write_pos: usize,
    count: usize,
}

impl TelemetryRingBuffer {
    /// Create a ring buffer; a zero capacity is bumped to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Mutex::new(RingBufferInner {
                buf: Vec::with_capacity(capacity),
                capacity,
                write_pos: 0,
                count: 0,
            }),
        }
    }

    /// Copy out the retained events in the order they were observed.
    #[must_use]
    pub fn drain(&self) -> Vec<StreamTelemetryEvent> {
        let inner = self.events.lock();
        let n = inner.count.min(inner.capacity);
        let start = if inner.count >= inner.capacity {
            inner.write_pos
        } else {
            0
        };
        (0..n)
            .map(|i| inner.buf[(start + i) % inner.capacity].clone())
            .collect()
    }

    /// Total events observed, including ones that were overwritten.
    #[must_use]
    pub fn total_observed(&self) -> usize {
        self.events.lock().count
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let inner = self.events.lock();
        inner.count.min(inner.capacity)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retained events of one kind.
    #[must_use]
    pub fn events_of_kind(&self, kind: &str) -> Vec<StreamTelemetryEvent> {
        self.drain()
            .into_iter()
            .filter(|event| event.kind_str() == kind)
            .collect()
    }
}

impl StreamObserver for TelemetryRingBuffer {
    fn on_event(&self, event: &StreamTelemetryEvent) {
        let mut inner = self.events.lock();
        let pos = inner.write_pos;
        if inner.buf.len() < inner.capacity {
            inner.buf.push(event.clone());
        } else {
            inner.buf[pos] = event.clone();
        }
        inner.write_pos = (pos + 1) % inner.capacity;
        inner.count += 1;
    }
}
