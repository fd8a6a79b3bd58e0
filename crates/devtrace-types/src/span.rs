//! Paired task executions.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::task::TaskKey;

bitflags! {
    /// Conditions attached to a span that consumers may want to filter on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct SpanFlags: u8 {
        /// The end record carries an earlier timestamp than the start record.
        const CLOCK_INVERTED = 0x01;
    }
}

/// One matched start/end execution of a task.
///
/// `end_time >= start_time` unless [`SpanFlags::CLOCK_INVERTED`] is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedSpan {
    pub stream_id: u32,
    pub task_id: u32,
    pub batch_id: u16,
    pub start_time: i64,
    pub end_time: i64,
    pub flags: SpanFlags,
}

impl MatchedSpan {
    /// Build a span, flagging inverted clocks.
    #[must_use]
    pub fn new(key: TaskKey, batch_id: u16, start_time: i64, end_time: i64) -> Self {
        let flags = if end_time < start_time {
            SpanFlags::CLOCK_INVERTED
        } else {
            SpanFlags::empty()
        };
        Self {
            stream_id: key.stream_id,
            task_id: key.task_id,
            batch_id,
            start_time,
            end_time,
            flags,
        }
    }

    #[must_use]
    pub const fn key(&self) -> TaskKey {
        TaskKey::new(self.stream_id, self.task_id)
    }

    /// Duration in clock ticks; zero for inverted spans.
    #[must_use]
    pub fn duration(&self) -> i64 {
        if self.flags.contains(SpanFlags::CLOCK_INVERTED) {
            0
        } else {
            self.end_time - self.start_time
        }
    }
}
