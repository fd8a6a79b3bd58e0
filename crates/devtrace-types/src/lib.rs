//! Core type definitions shared by the devtrace crates.
//!
//! - [`TaskKey`] / [`TaskRecord`]: decoded hardware-task-scheduler (HWTS) log entries
//! - [`AicPmuRecord`]: decoded AI-core PMU samples
//! - [`FixedRecord`]: the fixed-size decode contract every record category implements
//! - [`MatchedSpan`]: a paired start/end execution of one task
//! - [`StepTraceRecord`] / [`IterInfo`]: iteration windows and their bookkeeping

pub mod iteration;
pub mod record;
pub mod span;
pub mod task;

pub use iteration::{IterId, IterInfo, StepTraceRecord};
pub use record::{
    AIC_PMU_RECORD_SIZE, AicPmuRecord, FixedRecord, HWTS_RECORD_SIZE, PMU_EVENT_COUNT,
    decode_records,
};
pub use span::{MatchedSpan, SpanFlags};
pub use task::{RecordKind, TaskKey, TaskRecord};
