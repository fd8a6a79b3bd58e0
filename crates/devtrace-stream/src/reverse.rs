//! Tail-first scans over a logical stream.
//!
//! Files are visited newest first and each file's records are decoded from
//! the end. The head of a file that does not complete a record is carried
//! into the next (older) file, where it becomes the tail of that file's
//! last record. What remains at the head of the oldest file is exactly the
//! aging prefix and is never decoded.

use std::fs::File;
use std::io::Read;
use std::marker::PhantomData;
use std::ops::ControlFlow;
use std::sync::Arc;

use devtrace_error::{Result, TraceError};
use devtrace_types::{FixedRecord, TaskKey};
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::config::StreamConfig;
use crate::slice::SliceFile;
use crate::telemetry::{StreamObserver, StreamTelemetryEvent, noop_observer};

const LOG_COMPONENT: &str = "devtrace.stream::reverse";

/// Result of a tail scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TailScan {
    /// The requested occurrence was found with `tail_count` records after it.
    Found { tail_count: u64 },
    /// The stream was exhausted (or a file was rejected) after `scanned` records.
    NotFound { scanned: u64 },
}

impl TailScan {
    #[must_use]
    pub const fn tail_count(self) -> Option<u64> {
        match self {
            Self::Found { tail_count } => Some(tail_count),
            Self::NotFound { .. } => None,
        }
    }
}

/// Outcome of [`FileReverseCalculator::walk_from_tail`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailWalk {
    /// Records decoded and visited.
    pub scanned: u64,
    /// Whether the visitor broke out before the stream ran out.
    pub stopped: bool,
}

/// Reverse scanner for records of type `R`.
pub struct FileReverseCalculator<R> {
    max_read_file_bytes: u64,
    observer: Arc<dyn StreamObserver>,
    _record: PhantomData<fn() -> R>,
}

impl<R> std::fmt::Debug for FileReverseCalculator<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileReverseCalculator")
            .field("max_read_file_bytes", &self.max_read_file_bytes)
            .finish_non_exhaustive()
    }
}

impl<R: FixedRecord> FileReverseCalculator<R> {
    #[must_use]
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            max_read_file_bytes: config.max_read_file_bytes,
            observer: noop_observer(),
            _record: PhantomData,
        }
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn StreamObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Locate the `repeat_times`-th occurrence of `target` counted from the
    /// tail (0 and 1 both select the last one) and count the records after
    /// it, not counting skipped occurrences of `target` itself.
    pub fn find_tail_offset(
        &self,
        files: &[SliceFile],
        target: TaskKey,
        repeat_times: u32,
    ) -> Result<TailScan> {
        let wanted = repeat_times.max(1);
        let mut seen = 0_u32;
        let mut tail_count = 0_u64;

        let walk = self.walk_from_tail(files, |record| {
            if record.task_key() != target {
                tail_count += 1;
                return ControlFlow::Continue(());
            }
            seen += 1;
            if seen == wanted {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })?;

        if walk.stopped {
            debug!(
                component = LOG_COMPONENT,
                category = R::CATEGORY,
                target = %target,
                repeat_times,
                tail_count,
                scanned = walk.scanned,
                "tail occurrence located"
            );
            return Ok(TailScan::Found { tail_count });
        }

        warn!(
            component = LOG_COMPONENT,
            category = R::CATEGORY,
            target = %target,
            repeat_times,
            occurrences = seen,
            scanned = walk.scanned,
            "tail scan found no matching occurrence"
        );
        self.observer.on_event(&StreamTelemetryEvent::TailNotFound {
            category: R::CATEGORY.to_owned(),
            target: target.to_string(),
            scanned: walk.scanned,
        });
        Ok(TailScan::NotFound {
            scanned: walk.scanned,
        })
    }

    /// Decode records newest first, handing each to `visit` until it breaks
    /// or the stream is exhausted.
    ///
    /// A file above the size cap ends the walk as if the stream stopped there.
    pub fn walk_from_tail<F>(&self, files: &[SliceFile], mut visit: F) -> Result<TailWalk>
    where
        F: FnMut(&R) -> ControlFlow<()>,
    {
        let mut scanned = 0_u64;
        let mut carry: Vec<u8> = Vec::new();

        for file in files.iter().rev() {
            if file.size > self.max_read_file_bytes {
                warn!(
                    component = LOG_COMPONENT,
                    path = %file.path.display(),
                    file_size = file.size,
                    limit = self.max_read_file_bytes,
                    "stopping tail scan: slice exceeds cap"
                );
                self.observer.on_event(&StreamTelemetryEvent::FileRejected {
                    category: file.category.clone(),
                    path: file.path.display().to_string(),
                    size: file.size,
                    limit: self.max_read_file_bytes,
                });
                break;
            }

            let mut buf = Self::read_whole(file)?;
            buf.append(&mut carry);
            let head = buf.len() % R::SIZE;

            for chunk in buf[head..].rchunks_exact(R::SIZE) {
                let record = R::decode(chunk)?;
                scanned += 1;
                if visit(&record).is_break() {
                    return Ok(TailWalk {
                        scanned,
                        stopped: true,
                    });
                }
            }
            buf.truncate(head);
            carry = buf;
        }

        Ok(TailWalk {
            scanned,
            stopped: false,
        })
    }

    fn read_whole(file: &SliceFile) -> Result<Vec<u8>> {
        let handle = File::open(&file.path).map_err(|err| {
            error!(
                component = LOG_COMPONENT,
                path = %file.path.display(),
                error = %err,
                "cannot open slice file"
            );
            TraceError::Io(err)
        })?;
        let mut buf = Vec::with_capacity(usize::try_from(file.size).unwrap_or(0));
        handle.take(file.size).read_to_end(&mut buf)?;
        Ok(buf)
    }
}
