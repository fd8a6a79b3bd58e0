//! Start/end pairing of HWTS task records.

use std::collections::HashMap;
use std::sync::Arc;

use devtrace_error::{Result, TraceError};
use devtrace_stream::{
    FileCalculator, OffsetCalculator, SliceFile, StreamConfig, StreamObserver,
    StreamTelemetryEvent, noop_observer,
};
use devtrace_types::{IterId, MatchedSpan, RecordKind, TaskKey, TaskRecord, decode_records};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::iteration::IterationIndex;

const LOG_COMPONENT: &str = "devtrace.core::span_matcher";

/// Pairing statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MatchSummary {
    pub matched: u64,
    /// Starts superseded by a later start for the same task.
    pub orphaned_starts: u64,
    pub unexpected_ends: u64,
    /// Starts still waiting for an end when the summary was taken.
    pub pending_starts: u64,
}

/// Pairs start and end records per [`TaskKey`].
///
/// At most one start is pending per key. Feeding may span several buffers,
/// so a task started in one slice file can end in the next.
pub struct TaskSpanMatcher {
    pending: HashMap<TaskKey, TaskRecord>,
    spans: Vec<MatchedSpan>,
    summary: MatchSummary,
    observer: Arc<dyn StreamObserver>,
}

impl std::fmt::Debug for TaskSpanMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSpanMatcher")
            .field("pending", &self.pending.len())
            .field("spans", &self.spans.len())
            .field("summary", &self.summary)
            .finish_non_exhaustive()
    }
}

impl Default for TaskSpanMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSpanMatcher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            spans: Vec::new(),
            summary: MatchSummary::default(),
            observer: noop_observer(),
        }
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn StreamObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn push(&mut self, record: &TaskRecord) {
        let key = record.key();
        match record.kind {
            RecordKind::Start => {
                if let Some(previous) = self.pending.insert(key, *record) {
                    warn!(
                        component = LOG_COMPONENT,
                        task = %key,
                        discarded_start = previous.timestamp,
                        new_start = record.timestamp,
                        "orphaned start superseded"
                    );
                    self.summary.orphaned_starts += 1;
                    self.observer.on_event(&StreamTelemetryEvent::OrphanStart {
                        stream_id: key.stream_id,
                        task_id: key.task_id,
                    });
                }
            }
            RecordKind::End => match self.pending.remove(&key) {
                Some(begin) => {
                    self.spans.push(MatchedSpan::new(
                        key,
                        begin.batch_id,
                        begin.timestamp,
                        record.timestamp,
                    ));
                    self.summary.matched += 1;
                }
                None => {
                    warn!(
                        component = LOG_COMPONENT,
                        task = %key,
                        timestamp = record.timestamp,
                        "unexpected end without pending start"
                    );
                    self.summary.unexpected_ends += 1;
                    self.observer.on_event(&StreamTelemetryEvent::UnexpectedEnd {
                        stream_id: key.stream_id,
                        task_id: key.task_id,
                    });
                }
            },
            RecordKind::Other(_) => {}
        }
    }

    pub fn extend<'r>(&mut self, records: impl IntoIterator<Item = &'r TaskRecord>) {
        for record in records {
            self.push(record);
        }
    }

    /// Decode a record-aligned buffer and push every record.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<usize> {
        let records: Vec<TaskRecord> = decode_records(bytes)?;
        self.extend(&records);
        Ok(records.len())
    }

    #[must_use]
    pub fn summary(&self) -> MatchSummary {
        MatchSummary {
            pending_starts: self.pending.len() as u64,
            ..self.summary
        }
    }

    /// Spans sorted by end time (stable), plus the final summary.
    #[must_use]
    pub fn finish(mut self) -> (Vec<MatchedSpan>, MatchSummary) {
        let summary = self.summary();
        self.spans.sort_by_key(|span| span.end_time);
        info!(
            component = LOG_COMPONENT,
            matched = summary.matched,
            orphaned_starts = summary.orphaned_starts,
            unexpected_ends = summary.unexpected_ends,
            pending_starts = summary.pending_starts,
            "span matching finished"
        );
        (self.spans, summary)
    }
}

/// Match every record of the HWTS stream, reading slices in order.
pub fn match_all_records(
    files: &[SliceFile],
    config: &StreamConfig,
    observer: Arc<dyn StreamObserver>,
) -> Result<(Vec<MatchedSpan>, MatchSummary)> {
    let mut calc = OffsetCalculator::new(files, config.hwts_record_size, config)?
        .with_observer(Arc::clone(&observer));
    let mut matcher = TaskSpanMatcher::new().with_observer(observer);
    for file in files {
        let bytes = calc.read_file(file)?;
        matcher.push_bytes(&bytes)?;
    }
    calc.finish();
    Ok(matcher.finish())
}

/// Match only the records of `iter_id`'s calibrated window.
pub fn match_iteration_window(
    files: &[SliceFile],
    index: &IterationIndex,
    iter_id: IterId,
    config: &StreamConfig,
    observer: Arc<dyn StreamObserver>,
) -> Result<(Vec<MatchedSpan>, MatchSummary)> {
    let info = index
        .get(iter_id)
        .ok_or(TraceError::UnknownIteration(iter_id))?;
    let matcher = TaskSpanMatcher::new().with_observer(Arc::clone(&observer));
    if info.hwts_count() == 0 {
        debug!(
            component = LOG_COMPONENT,
            iter_id,
            "iteration has no records; nothing to match"
        );
        return Ok(matcher.finish());
    }

    let calc = FileCalculator::new(files, config.hwts_record_size, config)?.with_observer(observer);
    let window = calc.read_window(files, info.hwts_offset(), info.hwts_count())?;
    debug!(
        component = LOG_COMPONENT,
        iter_id,
        offset = info.hwts_offset(),
        count = info.hwts_count(),
        read = window.record_count(),
        "matching iteration window"
    );
    let mut matcher = matcher;
    matcher.push_bytes(window.bytes())?;
    Ok(matcher.finish())
}

#[cfg(test)]
mod tests {
    use devtrace_harness::{SliceFixture, end, even_cuts, start, step};
    use devtrace_stream::{TelemetryRingBuffer, discover_slices};
    use devtrace_types::{SpanFlags, StepTraceRecord};
    use proptest::prelude::*;

    use super::*;
    use crate::iteration::AiCoreTaskTable;
    use crate::reconcile::IterInfoUpdater;

    #[test]
    fn test_pairs_sorted_by_end_time() {
        let mut matcher = TaskSpanMatcher::new();
        matcher.extend(&[
            start(0, 1, 10),
            start(0, 2, 12),
            end(0, 2, 20),
            end(0, 1, 30),
            start(0, 1, 40),
            end(0, 1, 41),
        ]);
        let (spans, summary) = matcher.finish();
        let order: Vec<(u32, i64)> = spans.iter().map(|s| (s.task_id, s.end_time)).collect();
        assert_eq!(order, vec![(2, 20), (1, 30), (1, 41)]);
        assert_eq!(summary.matched, 3);
        assert_eq!(summary.pending_starts, 0);
    }

    #[test]
    fn test_second_start_discards_first() {
        let ring = Arc::new(TelemetryRingBuffer::new(8));
        let mut matcher = TaskSpanMatcher::new().with_observer(ring.clone());
        matcher.extend(&[start(0, 1, 10), start(0, 1, 15), end(0, 1, 18)]);
        let (spans, summary) = matcher.finish();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].start_time, 15);
        assert_eq!(summary.orphaned_starts, 1);
        assert_eq!(ring.events_of_kind("orphan_start").len(), 1);
    }

    #[test]
    fn test_unexpected_end_and_pending_start() {
        let mut matcher = TaskSpanMatcher::new();
        matcher.extend(&[end(0, 1, 5), start(0, 2, 6)]);
        assert_eq!(
            matcher.summary(),
            MatchSummary {
                matched: 0,
                orphaned_starts: 0,
                unexpected_ends: 1,
                pending_starts: 1,
            }
        );
    }

    #[test]
    fn test_inverted_clock_is_flagged() {
        let mut matcher = TaskSpanMatcher::new();
        matcher.extend(&[start(0, 1, 50), end(0, 1, 40)]);
        let (spans, _) = matcher.finish();
        assert!(spans[0].flags.contains(SpanFlags::CLOCK_INVERTED));
    }

    #[test]
    fn test_other_kinds_are_ignored() {
        let mut matcher = TaskSpanMatcher::new();
        let mut other = start(0, 1, 1);
        other.kind = RecordKind::Other(5);
        matcher.push(&other);
        assert_eq!(matcher.summary(), MatchSummary::default());
    }

    #[test]
    fn test_all_records_mode_matches_across_files() {
        let fixture = SliceFixture::new().expect("fixture");
        let records = [start(1, 1, 1), start(1, 2, 2), end(1, 1, 3), end(1, 2, 4)];
        // Cut inside the second and the fourth record.
        fixture.write_hwts(0, &records, 11, &[100, 220]).expect("write");
        let files = discover_slices(fixture.path(), "hwts", 0).expect("discover");

        let (spans, summary) =
            match_all_records(&files, &StreamConfig::default(), noop_observer()).expect("match");
        assert_eq!(summary.matched, 2);
        assert_eq!(spans[0].key(), TaskKey::new(1, 1));
        assert_eq!(spans[1].duration(), 2);
    }

    fn reconciled(files: &[SliceFile], steps: &[StepTraceRecord]) -> IterationIndex {
        let config = StreamConfig::default();
        let mut index = IterationIndex::build(steps, &AiCoreTaskTable::new());
        let mut calc =
            OffsetCalculator::new(files, config.hwts_record_size, &config).expect("calc");
        let mut updater = IterInfoUpdater::new(&mut index);
        for file in files {
            updater.feed_file(&mut calc, file).expect("feed");
        }
        updater.finish();
        index
    }

    #[test]
    fn test_exact_window_mode_uses_calibrated_offsets() {
        let fixture = SliceFixture::new().expect("fixture");
        let records = [
            start(0, 1, 1),
            end(0, 1, 2),
            start(0, 2, 3),
            end(0, 2, 4),
            start(0, 3, 12),
            end(0, 3, 14),
            start(0, 4, 15),
        ];
        let len = 5 + records.len() * 64;
        fixture.write_hwts(0, &records, 5, &even_cuts(len, 3)).expect("write");
        let files = discover_slices(fixture.path(), "hwts", 0).expect("discover");
        let index = reconciled(&files, &[step(1, 0, 10), step(2, 11, 20)]);

        let (spans, summary) =
            match_iteration_window(&files, &index, 2, &StreamConfig::default(), noop_observer())
                .expect("match");
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].task_id, 3);
        assert_eq!(summary.pending_starts, 1);

        let (first, _) =
            match_iteration_window(&files, &index, 1, &StreamConfig::default(), noop_observer())
                .expect("match");
        let ids: Vec<u32> = first.iter().map(|s| s.task_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_exact_window_edge_cases() {
        let index = IterationIndex::build(&[step(1, 0, 10)], &AiCoreTaskTable::new());
        let (spans, summary) =
            match_iteration_window(&[], &index, 1, &StreamConfig::default(), noop_observer())
                .expect("empty window");
        assert!(spans.is_empty());
        assert_eq!(summary, MatchSummary::default());

        let err = match_iteration_window(&[], &index, 9, &StreamConfig::default(), noop_observer())
            .expect_err("unknown iteration");
        assert!(matches!(err, TraceError::UnknownIteration(9)));
    }

    fn well_formed() -> impl Strategy<Value = Vec<TaskRecord>> {
        // Per-task start/end counts, interleaved by a shuffled timeline.
        proptest::collection::vec((0_u32..6, any::<bool>()), 0..80).prop_map(|ops| {
            let mut open = [false; 6];
            let mut out = Vec::new();
            for (i, (task, want_start)) in ops.into_iter().enumerate() {
                let ts = i64::try_from(i).unwrap_or(i64::MAX);
                let idx = task as usize;
                if want_start && !open[idx] {
                    out.push(start(0, task, ts));
                    open[idx] = true;
                } else if !want_start {
                    out.push(end(0, task, ts));
                    open[idx] = false;
                }
            }
            out
        })
    }

    /// Per-task schedule: `pairs` start/end pairs, then either one trailing
    /// start (`tail < 0`) or `tail` extra ends.
    type Schedule = (u32, i32);

    fn ordered_streams() -> impl Strategy<Value = (Vec<Schedule>, Vec<TaskRecord>)> {
        (
            proptest::collection::vec((0_u32..5, -1_i32..=3), 1..5),
            proptest::collection::vec(any::<prop::sample::Index>(), 0..64),
        )
            .prop_map(|(schedules, picks)| {
                let mut queues: Vec<Vec<bool>> = schedules
                    .iter()
                    .map(|&(pairs, tail)| {
                        let mut kinds = Vec::new();
                        for _ in 0..pairs {
                            kinds.extend([true, false]);
                        }
                        if tail < 0 {
                            kinds.push(true);
                        } else {
                            kinds.extend(std::iter::repeat_n(false, tail.unsigned_abs() as usize));
                        }
                        kinds.reverse();
                        kinds
                    })
                    .collect();

                // Merge the per-task queues, keeping each task's own order.
                let mut picks = picks.into_iter();
                let mut records = Vec::new();
                loop {
                    let live: Vec<usize> =
                        (0..queues.len()).filter(|&i| !queues[i].is_empty()).collect();
                    if live.is_empty() {
                        break;
                    }
                    let task = picks.next().map_or(live[0], |pick| live[pick.index(live.len())]);
                    let ts = i64::try_from(records.len()).unwrap_or(i64::MAX);
                    let task_id = u32::try_from(task).unwrap_or(u32::MAX);
                    if let Some(is_start) = queues[task].pop() {
                        records.push(if is_start { start(0, task_id, ts) } else { end(0, task_id, ts) });
                    }
                }
                (schedules, records)
            })
    }

    proptest! {
        #[test]
        fn prop_conservation_on_well_formed_streams(records in well_formed()) {
            let starts = records.iter().filter(|r| r.is_start()).count() as u64;
            let ends = records.iter().filter(|r| r.is_end()).count() as u64;

            let mut matcher = TaskSpanMatcher::new();
            matcher.extend(&records);
            let summary = matcher.summary();
            let (spans, _) = matcher.finish();

            prop_assert_eq!(summary.orphaned_starts, 0);
            prop_assert_eq!(spans.len() as u64, summary.matched);
            prop_assert_eq!(summary.matched + summary.pending_starts, starts);
            prop_assert_eq!(summary.matched + summary.unexpected_ends, ends);
            prop_assert!(spans.windows(2).all(|w| w[0].end_time <= w[1].end_time));
        }

        #[test]
        fn prop_per_task_spans_and_unmatched_follow_counts(
            (schedules, records) in ordered_streams(),
        ) {
            let mut matcher = TaskSpanMatcher::new();
            matcher.extend(&records);
            let (spans, summary) = matcher.finish();
            prop_assert_eq!(summary.orphaned_starts, 0);

            let mut unmatched = 0_u64;
            for (task, &(pairs, tail)) in schedules.iter().enumerate() {
                let key = TaskKey::new(0, u32::try_from(task).unwrap_or(u32::MAX));
                let starts = u64::from(pairs) + u64::from(tail < 0);
                let ends = u64::from(pairs) + u64::from(tail.max(0).unsigned_abs());
                let task_records = records.iter().filter(|r| r.key() == key);
                prop_assert_eq!(
                    task_records.clone().filter(|r| r.is_start()).count() as u64,
                    starts
                );
                prop_assert_eq!(task_records.filter(|r| r.is_end()).count() as u64, ends);

                let task_spans = spans.iter().filter(|span| span.key() == key).count() as u64;
                prop_assert_eq!(task_spans, starts.min(ends));
                unmatched += starts.abs_diff(ends);
            }
            prop_assert_eq!(summary.pending_starts + summary.unexpected_ends, unmatched);
        }
    }
}
