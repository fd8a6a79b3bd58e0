//! Iteration windows and their per-iteration record bookkeeping.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::task::TaskKey;

/// Opaque upstream iteration identifier.
pub type IterId = u32;

/// One step-trace row: the device-clock window of one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTraceRecord {
    pub model_id: u32,
    pub index_id: u32,
    pub iter_id: IterId,
    pub start_time: i64,
    pub end_time: i64,
}

/// Reconstructed bookkeeping for one iteration.
///
/// Counters only grow, and the offset bases are fixed at most once; both
/// rules are enforced by the mutators below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterInfo {
    model_id: u32,
    index_id: u32,
    iter_id: IterId,
    start_time: i64,
    end_time: i64,
    /// Iterations still running when this one finishes (always includes itself).
    behind_parallel_iter: BTreeSet<IterId>,
    hwts_count: u64,
    aic_count: u64,
    hwts_offset: u64,
    aic_offset: u64,
    offset_fixed: bool,
    static_aic_task_set: BTreeSet<TaskKey>,
    dynamic_aic_task_set: BTreeSet<TaskKey>,
}

impl IterInfo {
    #[must_use]
    pub fn from_step_trace(row: &StepTraceRecord) -> Self {
        Self {
            model_id: row.model_id,
            index_id: row.index_id,
            iter_id: row.iter_id,
            start_time: row.start_time,
            end_time: row.end_time,
            behind_parallel_iter: BTreeSet::from([row.iter_id]),
            hwts_count: 0,
            aic_count: 0,
            hwts_offset: 0,
            aic_offset: 0,
            offset_fixed: false,
            static_aic_task_set: BTreeSet::new(),
            dynamic_aic_task_set: BTreeSet::new(),
        }
    }

    /// Iteration referenced by records but absent from the step trace.
    ///
    /// Its window is unknown, so it is modeled as an instant at `i64::MAX`.
    #[must_use]
    pub fn placeholder(iter_id: IterId) -> Self {
        Self::from_step_trace(&StepTraceRecord {
            model_id: 0,
            index_id: 0,
            iter_id,
            start_time: i64::MAX,
            end_time: i64::MAX,
        })
    }

    #[must_use]
    pub const fn model_id(&self) -> u32 {
        self.model_id
    }

    #[must_use]
    pub const fn index_id(&self) -> u32 {
        self.index_id
    }

    #[must_use]
    pub const fn iter_id(&self) -> IterId {
        self.iter_id
    }

    #[must_use]
    pub const fn start_time(&self) -> i64 {
        self.start_time
    }

    #[must_use]
    pub const fn end_time(&self) -> i64 {
        self.end_time
    }

    #[must_use]
    pub const fn behind_parallel_iter(&self) -> &BTreeSet<IterId> {
        &self.behind_parallel_iter
    }

    pub fn add_behind_parallel_iter(&mut self, iter_id: IterId) {
        self.behind_parallel_iter.insert(iter_id);
    }

    #[must_use]
    pub const fn hwts_count(&self) -> u64 {
        self.hwts_count
    }

    #[must_use]
    pub const fn aic_count(&self) -> u64 {
        self.aic_count
    }

    #[must_use]
    pub const fn hwts_offset(&self) -> u64 {
        self.hwts_offset
    }

    #[must_use]
    pub const fn aic_offset(&self) -> u64 {
        self.aic_offset
    }

    /// Whether the offset bases have been calibrated.
    #[must_use]
    pub const fn offset_fixed(&self) -> bool {
        self.offset_fixed
    }

    /// Fix both offset bases. Returns `false` (and changes nothing) when they
    /// were already fixed.
    pub fn fix_offsets(&mut self, hwts_offset: u64, aic_offset: u64) -> bool {
        if self.offset_fixed {
            return false;
        }
        self.hwts_offset = hwts_offset;
        self.aic_offset = aic_offset;
        self.offset_fixed = true;
        true
    }

    pub fn record_hwts(&mut self) {
        self.hwts_count = self.hwts_count.saturating_add(1);
    }

    pub fn record_aic(&mut self) {
        self.aic_count = self.aic_count.saturating_add(1);
    }

    #[must_use]
    pub const fn static_aic_task_set(&self) -> &BTreeSet<TaskKey> {
        &self.static_aic_task_set
    }

    #[must_use]
    pub const fn dynamic_aic_task_set(&self) -> &BTreeSet<TaskKey> {
        &self.dynamic_aic_task_set
    }

    pub fn set_static_aic_task_set(&mut self, tasks: BTreeSet<TaskKey>) {
        self.static_aic_task_set = tasks;
    }

    pub fn insert_dynamic_aic_task(&mut self, key: TaskKey) {
        self.dynamic_aic_task_set.insert(key);
    }

    /// Whether either task set carries any classification.
    #[must_use]
    pub fn has_task_classification(&self) -> bool {
        !self.static_aic_task_set.is_empty() || !self.dynamic_aic_task_set.is_empty()
    }

    /// Task-set membership; `None` when no classification is known.
    #[must_use]
    pub fn classifies_as_aic(&self, key: TaskKey) -> Option<bool> {
        if !self.has_task_classification() {
            return None;
        }
        Some(self.static_aic_task_set.contains(&key) || self.dynamic_aic_task_set.contains(&key))
    }

    /// Whether `time` falls into `[start_time, end_time]`.
    #[must_use]
    pub const fn contains_time(&self, time: i64) -> bool {
        self.start_time <= time && time <= self.end_time
    }
}
