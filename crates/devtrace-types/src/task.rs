//! Task identity and the decoded HWTS log entry.

use std::fmt;
use std::str::FromStr;

use devtrace_error::TraceError;
use serde::{Deserialize, Serialize};

/// Composite `(stream_id, task_id)` identity of one device task.
///
/// Used directly as a map/set key. Displays as `stream-task`, the form used
/// by upstream task tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    pub stream_id: u32,
    pub task_id: u32,
}

impl TaskKey {
    #[must_use]
    pub const fn new(stream_id: u32, task_id: u32) -> Self {
        Self { stream_id, task_id }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.stream_id, self.task_id)
    }
}

impl FromStr for TaskKey {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (stream, task) = s
            .split_once('-')
            .ok_or_else(|| TraceError::invalid_argument(format!("task key `{s}` has no '-'")))?;
        let stream_id = stream
            .trim()
            .parse::<u32>()
            .map_err(|err| TraceError::invalid_argument(format!("bad stream id in `{s}`: {err}")))?;
        let task_id = task
            .trim()
            .parse::<u32>()
            .map_err(|err| TraceError::invalid_argument(format!("bad task id in `{s}`: {err}")))?;
        Ok(Self { stream_id, task_id })
    }
}

/// Kind of a scheduler log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    Start,
    End,
    /// Any other log type the hardware emits; carried through but never matched.
    Other(u8),
}

impl RecordKind {
    /// Decode from the low three bits of the HWTS mode byte.
    #[must_use]
    pub const fn from_mode_byte(mode: u8) -> Self {
        match mode & 0x07 {
            0 => Self::Start,
            1 => Self::End,
            other => Self::Other(other),
        }
    }

    #[must_use]
    pub const fn to_mode_bits(self) -> u8 {
        match self {
            Self::Start => 0,
            Self::End => 1,
            Self::Other(bits) => bits & 0x07,
        }
    }
}

/// One decoded HWTS log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub kind: RecordKind,
    /// Task was dispatched to the AI core (explicit per-record classification).
    pub ai_core: bool,
    /// Hardware sequence counter; wraps at `u16::MAX`.
    pub counter: u16,
    pub stream_id: u32,
    pub task_id: u32,
    /// Device clock ticks.
    pub timestamp: i64,
    pub batch_id: u16,
    pub core_id: u16,
}

impl TaskRecord {
    #[must_use]
    pub const fn key(&self) -> TaskKey {
        TaskKey::new(self.stream_id, self.task_id)
    }

    #[must_use]
    pub const fn is_start(&self) -> bool {
        matches!(self.kind, RecordKind::Start)
    }

    #[must_use]
    pub const fn is_end(&self) -> bool {
        matches!(self.kind, RecordKind::End)
    }
}
