//! Per-iteration reconstruction on top of `devtrace-stream`.
//!
//! [`IterationIndex`] holds the iteration topology derived from the step
//! trace, [`IterInfoUpdater`] attributes decoded HWTS records to it and pins
//! each iteration's stream offsets, [`TaskSpanMatcher`] pairs task start/end
//! records, and [`ReconstructionPass`] runs the whole sequence for one device.

pub mod alignment;
pub mod iteration;
pub mod pass;
pub mod reconcile;
pub mod span_matcher;

pub use alignment::{AlignmentOutcome, align_tails, align_tails_observed};
pub use iteration::{AiCoreTaskRow, AiCoreTaskTable, IterationIndex};
pub use pass::{PassOutput, ReconstructionPass};
pub use reconcile::{IterInfoUpdater, ReconcileReport, ReconcileState};
pub use span_matcher::{MatchSummary, TaskSpanMatcher, match_all_records, match_iteration_window};
