//! Iteration topology for one run.
//!
//! Built once from the step trace. For each iteration the index stores its
//! clock window, the iterations still running when it finishes
//! (`behind_parallel_iter`) and the task keys known to execute on the AI core.

use std::collections::{BTreeMap, BTreeSet};

use devtrace_error::{Result, TraceError};
use devtrace_types::{IterId, IterInfo, StepTraceRecord, TaskKey};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const LOG_COMPONENT: &str = "devtrace.core::iteration";

/// One row of the upstream AI-core task table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiCoreTaskRow {
    pub model_id: u32,
    /// `None` for static-shape models: the row applies to every iteration.
    pub index_id: Option<u32>,
    pub key: TaskKey,
}

/// Upstream task classification, keyed by model (static shapes) or by
/// model and index (dynamic shapes).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AiCoreTaskTable {
    rows: Vec<AiCoreTaskRow>,
}

impl AiCoreTaskTable {
    #[must_use]
    pub const fn new() -> Self {
        Self { rows: Vec::new() }
    }

    /// Parse a JSON array of rows.
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|err| TraceError::invalid_argument(format!("malformed task table: {err}")))
    }

    pub fn push(&mut self, row: AiCoreTaskRow) {
        self.rows.push(row);
    }

    /// Task shared by every iteration of `model_id`.
    pub fn add_static(&mut self, model_id: u32, key: TaskKey) {
        self.push(AiCoreTaskRow {
            model_id,
            index_id: None,
            key,
        });
    }

    /// Task of the iterations of `model_id` with `index_id`.
    pub fn add_dynamic(&mut self, model_id: u32, index_id: u32, key: TaskKey) {
        self.push(AiCoreTaskRow {
            model_id,
            index_id: Some(index_id),
            key,
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> impl Iterator<Item = &AiCoreTaskRow> {
        self.rows.iter()
    }

    fn static_tasks(&self) -> BTreeMap<u32, BTreeSet<TaskKey>> {
        let mut by_model: BTreeMap<u32, BTreeSet<TaskKey>> = BTreeMap::new();
        for row in self.rows.iter().filter(|row| row.index_id.is_none()) {
            by_model.entry(row.model_id).or_default().insert(row.key);
        }
        by_model
    }
}

/// Iterations of one run, ordered by `(start_time, iter_id)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IterationIndex {
    iterations: BTreeMap<IterId, IterInfo>,
    order: Vec<IterId>,
}

impl IterationIndex {
    /// Build the index. Rows may arrive in any order; duplicate iteration ids
    /// keep the first row.
    #[must_use]
    pub fn build(steps: &[StepTraceRecord], tasks: &AiCoreTaskTable) -> Self {
        let mut rows = steps.to_vec();
        rows.sort_by_key(|row| (row.start_time, row.iter_id));

        let mut index = Self::default();
        for row in &rows {
            if index.iterations.contains_key(&row.iter_id) {
                warn!(
                    component = LOG_COMPONENT,
                    iter_id = row.iter_id,
                    "duplicate step-trace row ignored"
                );
                continue;
            }
            index.iterations.insert(row.iter_id, IterInfo::from_step_trace(row));
            index.order.push(row.iter_id);
        }

        index.link_overlaps();
        index.assign_task_sets(tasks);

        info!(
            component = LOG_COMPONENT,
            iterations = index.order.len(),
            task_rows = tasks.len(),
            "built iteration index"
        );
        index
    }

    fn link_overlaps(&mut self) {
        let windows: Vec<(IterId, i64, i64)> = self
            .order
            .iter()
            .filter_map(|id| self.iterations.get(id))
            .map(|info| (info.iter_id(), info.start_time(), info.end_time()))
            .collect();

        for (i, &(iter_id, _, end)) in windows.iter().enumerate() {
            let behind: Vec<IterId> = windows[i..]
                .iter()
                .filter(|&&(_, j_start, j_end)| j_start < end && end <= j_end)
                .map(|&(j_id, _, _)| j_id)
                .collect();
            if let Some(info) = self.iterations.get_mut(&iter_id) {
                for id in behind {
                    info.add_behind_parallel_iter(id);
                }
                debug!(
                    component = LOG_COMPONENT,
                    iter_id,
                    behind = ?info.behind_parallel_iter(),
                    "linked overlapping iterations"
                );
            }
        }
    }

    fn assign_task_sets(&mut self, tasks: &AiCoreTaskTable) {
        let static_tasks = tasks.static_tasks();
        for info in self.iterations.values_mut() {
            if let Some(set) = static_tasks.get(&info.model_id()) {
                info.set_static_aic_task_set(set.clone());
            }
            for row in tasks.rows() {
                if row.model_id == info.model_id() && row.index_id == Some(info.index_id()) {
                    info.insert_dynamic_aic_task(row.key);
                }
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    #[must_use]
    pub fn get(&self, iter_id: IterId) -> Option<&IterInfo> {
        self.iterations.get(&iter_id)
    }

    pub fn get_mut(&mut self, iter_id: IterId) -> Option<&mut IterInfo> {
        self.iterations.get_mut(&iter_id)
    }

    /// Look up `iter_id`, creating a placeholder when the step trace never
    /// mentioned it.
    pub fn get_or_insert(&mut self, iter_id: IterId) -> &mut IterInfo {
        if !self.iterations.contains_key(&iter_id) {
            debug!(
                component = LOG_COMPONENT,
                iter_id,
                "creating placeholder iteration"
            );
            let info = IterInfo::placeholder(iter_id);
            let sort_key = (info.start_time(), iter_id);
            let pos = self.order.partition_point(|id| {
                self.iterations
                    .get(id)
                    .is_some_and(|other| (other.start_time(), *id) < sort_key)
            });
            self.order.insert(pos, iter_id);
            self.iterations.insert(iter_id, info);
        }
        self.iterations
            .entry(iter_id)
            .or_insert_with(|| IterInfo::placeholder(iter_id))
    }

    /// Position of `iter_id` in clock order.
    #[must_use]
    pub fn rank(&self, iter_id: IterId) -> Option<usize> {
        self.order.iter().position(|&id| id == iter_id)
    }

    /// Earliest iteration.
    #[must_use]
    pub fn first_iter(&self) -> Option<&IterInfo> {
        self.order.first().and_then(|id| self.iterations.get(id))
    }

    /// Earliest iteration whose window contains `time`.
    #[must_use]
    pub fn iter_containing(&self, time: i64) -> Option<&IterInfo> {
        self.iter()
            .find(|info| info.contains_time(time))
    }

    /// Iteration following `iter_id` in clock order.
    #[must_use]
    pub fn next_after(&self, iter_id: IterId) -> Option<&IterInfo> {
        let rank = self.rank(iter_id)?;
        self.order
            .get(rank + 1)
            .and_then(|id| self.iterations.get(id))
    }

    /// Task-set classification of `key` within `iter_id`.
    ///
    /// `None` when the iteration is unknown or carries no task sets; callers
    /// then fall back to the per-record flag.
    #[must_use]
    pub fn is_aic_task(&self, iter_id: IterId, key: TaskKey) -> Option<bool> {
        self.get(iter_id)?.classifies_as_aic(key)
    }

    /// Iterations in clock order.
    pub fn iter(&self) -> impl Iterator<Item = &IterInfo> {
        self.order.iter().filter_map(|id| self.iterations.get(id))
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<IterInfo> {
        self.iter().cloned().collect()
    }

    /// Pretty JSON array of [`Self::snapshot`].
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.snapshot())
            .map_err(|err| TraceError::invalid_state(format!("cannot serialize iterations: {err}")))
    }
}
