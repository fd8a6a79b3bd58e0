//! Attribution of HWTS records to iterations.
//!
//! The updater walks the decoded record stream in file order. It keeps a
//! primary iteration plus the set of iterations still running when the
//! primary one finishes, and credits every record to all of them. When an
//! iteration first enters that set, its stream offsets are pinned to the
//! primary iteration's running totals at that moment and never move again.

use std::collections::BTreeSet;
use std::sync::Arc;

use devtrace_error::{Result, TraceError};
use devtrace_stream::{
    OffsetCalculator, SliceFile, StreamObserver, StreamTelemetryEvent, noop_observer,
};
use devtrace_types::{IterId, TaskRecord, decode_records};
use serde::Serialize;
use tracing::{debug, info};

use crate::iteration::IterationIndex;

const LOG_COMPONENT: &str = "devtrace.core::reconcile";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileState {
    AwaitingFirstIteration,
    Active {
        current: IterId,
        active: BTreeSet<IterId>,
    },
    Done,
}

/// Totals of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub records_observed: u64,
    pub records_attributed: u64,
    /// Records outside every iteration window (or seen with an empty index).
    pub records_unattributed: u64,
    pub aic_end_records: u64,
    pub activations: u64,
    pub iterations: usize,
}

pub struct IterInfoUpdater<'a> {
    index: &'a mut IterationIndex,
    state: ReconcileState,
    report: ReconcileReport,
    observer: Arc<dyn StreamObserver>,
}

impl std::fmt::Debug for IterInfoUpdater<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IterInfoUpdater")
            .field("state", &self.state)
            .field("report", &self.report)
            .finish_non_exhaustive()
    }
}

impl<'a> IterInfoUpdater<'a> {
    pub fn new(index: &'a mut IterationIndex) -> Self {
        Self {
            index,
            state: ReconcileState::AwaitingFirstIteration,
            report: ReconcileReport::default(),
            observer: noop_observer(),
        }
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn StreamObserver>) -> Self {
        self.observer = observer;
        self
    }

    #[must_use]
    pub const fn state(&self) -> &ReconcileState {
        &self.state
    }

    #[must_use]
    pub const fn report(&self) -> &ReconcileReport {
        &self.report
    }

    #[must_use]
    pub fn index(&self) -> &IterationIndex {
        self.index
    }

    const fn current(&self) -> Option<IterId> {
        match &self.state {
            ReconcileState::Active { current, .. } => Some(*current),
            _ => None,
        }
    }

    /// Make `iter_id` the primary iteration.
    ///
    /// Returns `false` when `iter_id` does not come after the current
    /// iteration in clock order; the primary pointer never moves back.
    pub fn activate(&mut self, iter_id: IterId) -> Result<bool> {
        if self.state == ReconcileState::Done {
            return Err(TraceError::invalid_state(format!(
                "cannot activate iteration {iter_id} after reconciliation finished"
            )));
        }

        self.index.get_or_insert(iter_id);
        if let Some(current) = self.current() {
            let (Some(current_rank), Some(next_rank)) =
                (self.index.rank(current), self.index.rank(iter_id))
            else {
                return Err(TraceError::UnknownIteration(current));
            };
            if next_rank <= current_rank {
                debug!(
                    component = LOG_COMPONENT,
                    current,
                    requested = iter_id,
                    "ignoring activation that does not move forward"
                );
                return Ok(false);
            }
        }

        let (hwts_base, aic_base) = self
            .current()
            .and_then(|id| self.index.get(id))
            .map_or((0, 0), |info| {
                (
                    info.hwts_offset() + info.hwts_count(),
                    info.aic_offset() + info.aic_count(),
                )
            });

        let behind = self.index.get_or_insert(iter_id).behind_parallel_iter().clone();
        let newly_active: Vec<IterId> = match &self.state {
            ReconcileState::Active { active, .. } => behind.difference(active).copied().collect(),
            _ => behind.iter().copied().collect(),
        };
        for &id in &newly_active {
            if self.index.get_or_insert(id).fix_offsets(hwts_base, aic_base) {
                debug!(
                    component = LOG_COMPONENT,
                    iter_id = id,
                    hwts_offset = hwts_base,
                    aic_offset = aic_base,
                    "pinned iteration offsets"
                );
            }
        }

        debug!(
            component = LOG_COMPONENT,
            iter_id,
            hwts_base,
            newly_active = newly_active.len(),
            "iteration activated"
        );
        self.observer.on_event(&StreamTelemetryEvent::IterationActivated {
            iter_id,
            hwts_offset: hwts_base,
            newly_active: newly_active.len(),
        });
        self.report.activations += 1;
        self.state = ReconcileState::Active {
            current: iter_id,
            active: behind,
        };
        Ok(true)
    }

    /// Credit one record to the iterations active at its timestamp.
    pub fn observe(&mut self, record: &TaskRecord) -> Result<()> {
        if self.state == ReconcileState::Done {
            return Err(TraceError::invalid_state(
                "record observed after reconciliation finished",
            ));
        }
        self.report.records_observed += 1;

        if self.state == ReconcileState::AwaitingFirstIteration {
            let Some(first) = self.index.first_iter().map(|info| info.iter_id()) else {
                self.report.records_unattributed += 1;
                return Ok(());
            };
            self.activate(first)?;
        }

        loop {
            let Some(current) = self.current() else {
                return Err(TraceError::invalid_state("no primary iteration"));
            };
            let end_time = self
                .index
                .get(current)
                .map_or(i64::MAX, |info| info.end_time());
            if record.timestamp <= end_time {
                break;
            }
            let Some(next) = self.index.next_after(current).map(|info| info.iter_id()) else {
                self.report.records_unattributed += 1;
                return Ok(());
            };
            self.activate(next)?;
        }

        let ReconcileState::Active { active, .. } = &self.state else {
            return Err(TraceError::invalid_state("no active iteration set"));
        };
        let key = record.key();
        let mut counted_aic = false;
        for &id in active {
            let info = self.index.get_or_insert(id);
            info.record_hwts();
            if record.is_end() && info.classifies_as_aic(key).unwrap_or(record.ai_core) {
                info.record_aic();
                counted_aic = true;
            }
        }
        self.report.records_attributed += 1;
        if counted_aic {
            self.report.aic_end_records += 1;
        }
        Ok(())
    }

    /// Decode a record-aligned HWTS buffer and observe each record.
    pub fn feed_bytes(&mut self, bytes: &[u8]) -> Result<usize> {
        let records: Vec<TaskRecord> = decode_records(bytes)?;
        for record in &records {
            self.observe(record)?;
        }
        Ok(records.len())
    }

    /// Read one slice through `calc` and observe its records.
    pub fn feed_file(&mut self, calc: &mut OffsetCalculator, file: &SliceFile) -> Result<usize> {
        let bytes = calc.read_file(file)?;
        self.feed_bytes(&bytes)
    }

    /// Close the pass. Safe to call more than once.
    pub fn finish(&mut self) -> ReconcileReport {
        if self.state != ReconcileState::Done {
            self.state = ReconcileState::Done;
            self.report.iterations = self.index.len();
            info!(
                component = LOG_COMPONENT,
                observed = self.report.records_observed,
                attributed = self.report.records_attributed,
                unattributed = self.report.records_unattributed,
                aic_end_records = self.report.aic_end_records,
                activations = self.report.activations,
                iterations = self.report.iterations,
                "reconciliation finished"
            );
        }
        self.report.clone()
    }
}

#[cfg(test)]
mod tests {
    use devtrace_harness::{end, start, step};
    use devtrace_stream::TelemetryRingBuffer;
    use devtrace_types::TaskKey;

    use super::*;
    use crate::iteration::AiCoreTaskTable;

    fn index(steps: &[devtrace_types::StepTraceRecord]) -> IterationIndex {
        IterationIndex::build(steps, &AiCoreTaskTable::new())
    }

    #[test]
    fn test_first_records_belong_to_first_iteration() {
        let mut idx = index(&[step(1, 100, 200), step(2, 300, 400)]);
        let mut updater = IterInfoUpdater::new(&mut idx);
        updater.observe(&start(0, 1, 10)).expect("observe");
        updater.observe(&end(0, 1, 150)).expect("observe");
        let report = updater.finish();
        assert_eq!(report.records_attributed, 2);
        assert_eq!(idx.get(1).expect("iter").hwts_count(), 2);
        assert_eq!(idx.get(1).expect("iter").aic_count(), 1);
        assert_eq!(idx.get(2).expect("iter").hwts_count(), 0);
    }

    #[test]
    fn test_sequential_iterations_pin_offsets_to_running_totals() {
        let mut idx = index(&[step(1, 0, 10), step(2, 11, 20), step(3, 21, 30)]);
        let mut updater = IterInfoUpdater::new(&mut idx);
        for ts in [1, 2, 3, 12, 13, 22] {
            updater.observe(&start(0, 1, ts)).expect("observe");
        }
        updater.finish();

        let offsets: Vec<(u64, u64)> = idx
            .iter()
            .map(|info| (info.hwts_offset(), info.hwts_count()))
            .collect();
        assert_eq!(offsets, vec![(0, 3), (3, 2), (5, 1)]);
    }

    #[test]
    fn test_records_past_last_iteration_are_unattributed() {
        let mut idx = index(&[step(1, 0, 10)]);
        let mut updater = IterInfoUpdater::new(&mut idx);
        updater.observe(&start(0, 1, 5)).expect("observe");
        updater.observe(&start(0, 1, 50)).expect("observe");
        let report = updater.finish();
        assert_eq!(report.records_observed, 2);
        assert_eq!(report.records_unattributed, 1);
        assert_eq!(idx.get(1).expect("iter").hwts_count(), 1);
    }

    #[test]
    fn test_empty_index_counts_everything_unattributed() {
        let mut idx = IterationIndex::default();
        let mut updater = IterInfoUpdater::new(&mut idx);
        updater.observe(&start(0, 1, 5)).expect("observe");
        assert_eq!(updater.state(), &ReconcileState::AwaitingFirstIteration);
        assert_eq!(updater.finish().records_unattributed, 1);
    }

    #[test]
    fn test_activation_never_moves_backwards() {
        let mut idx = index(&[step(1, 0, 10), step(2, 11, 20)]);
        let mut updater = IterInfoUpdater::new(&mut idx);
        assert!(updater.activate(2).expect("activate"));
        assert!(!updater.activate(1).expect("stale activation"));
        assert!(!updater.activate(2).expect("repeat activation"));
        assert_eq!(updater.report().activations, 1);
    }

    #[test]
    fn test_unknown_iteration_becomes_placeholder() {
        let mut idx = index(&[step(1, 0, 10)]);
        let mut updater = IterInfoUpdater::new(&mut idx);
        updater.activate(1).expect("activate");
        assert!(updater.activate(77).expect("placeholder activation"));
        updater.finish();
        let placeholder = idx.get(77).expect("placeholder");
        assert!(placeholder.offset_fixed());
        assert_eq!(placeholder.start_time(), i64::MAX);
    }

    #[test]
    fn test_task_sets_override_record_flag() {
        let mut tasks = AiCoreTaskTable::new();
        tasks.add_static(1, TaskKey::new(0, 9));
        let mut idx = IterationIndex::build(&[step(1, 0, 10)], &tasks);
        let mut updater = IterInfoUpdater::new(&mut idx);
        // Flagged AI-core but absent from the task set.
        updater.observe(&end(0, 1, 2)).expect("observe");
        // Not flagged but listed in the task set.
        let mut listed = end(0, 9, 3);
        listed.ai_core = false;
        updater.observe(&listed).expect("observe");
        let report = updater.finish();
        assert_eq!(report.aic_end_records, 1);
        assert_eq!(idx.get(1).expect("iter").aic_count(), 1);
    }

    #[test]
    fn test_finish_is_idempotent_and_final() {
        let mut idx = index(&[step(1, 0, 10)]);
        let ring = Arc::new(TelemetryRingBuffer::new(8));
        let mut updater = IterInfoUpdater::new(&mut idx).with_observer(ring.clone());
        updater.observe(&start(0, 1, 1)).expect("observe");
        let first = updater.finish();
        let second = updater.finish();
        assert_eq!(first, second);
        assert_eq!(first.iterations, 1);
        assert!(matches!(
            updater.observe(&start(0, 1, 2)),
            Err(TraceError::InvalidState(_))
        ));
        assert!(updater.activate(1).is_err());
        assert_eq!(ring.events_of_kind("iteration_activated").len(), 1);
    }

    #[test]
    fn test_feed_bytes_decodes_records() {
        let mut idx = index(&[step(1, 0, 10)]);
        let mut updater = IterInfoUpdater::new(&mut idx);
        let bytes = devtrace_harness::encode_hwts(&[start(0, 1, 1), end(0, 1, 2)]).expect("encode");
        assert_eq!(updater.feed_bytes(&bytes).expect("feed"), 2);
        assert!(updater.feed_bytes(&bytes[..10]).is_err());
    }
}
