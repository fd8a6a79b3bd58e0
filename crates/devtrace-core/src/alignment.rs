//! Re-aligning the tails of the HWTS and AI-core streams.
//!
//! Both categories age out independently, so their newest records need not
//! describe the same task. The newest AI-core sample names a task key; the
//! number of HWTS records after the matching occurrence of that key has no
//! AI-core counterpart and is reported as the count to discard.

use std::ops::ControlFlow;
use std::sync::Arc;

use devtrace_error::Result;
use devtrace_stream::{
    FileReverseCalculator, SliceFile, StreamConfig, StreamObserver, TailScan, noop_observer,
};
use devtrace_types::{AicPmuRecord, FixedRecord, TaskKey, TaskRecord};
use serde::Serialize;
use tracing::{info, warn};

const LOG_COMPONENT: &str = "devtrace.core::alignment";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlignmentOutcome {
    /// Drop the last `discard` HWTS records to line up with the AI-core tail.
    Aligned { discard: u64 },
    /// No common anchor; streams are used as they are.
    Unaligned,
}

/// Newest AI-core key and how many times it repeats at the tail.
fn aic_tail_anchor(
    aic_files: &[SliceFile],
    config: &StreamConfig,
    observer: &Arc<dyn StreamObserver>,
) -> Result<Option<(TaskKey, u32)>> {
    let calc = FileReverseCalculator::<AicPmuRecord>::new(config).with_observer(Arc::clone(observer));
    let mut anchor: Option<(TaskKey, u32)> = None;
    calc.walk_from_tail(aic_files, |record| {
        let key = record.task_key();
        let Some((anchor_key, repeats)) = anchor.as_mut() else {
            anchor = Some((key, 1));
            return ControlFlow::Continue(());
        };
        if *anchor_key != key {
            return ControlFlow::Break(());
        }
        *repeats += 1;
        ControlFlow::Continue(())
    })?;
    Ok(anchor)
}

/// Compute how many trailing HWTS records to discard.
pub fn align_tails(
    hwts_files: &[SliceFile],
    aic_files: &[SliceFile],
    config: &StreamConfig,
) -> Result<AlignmentOutcome> {
    align_tails_observed(hwts_files, aic_files, config, &noop_observer())
}

/// [`align_tails`] reporting to `observer`.
pub fn align_tails_observed(
    hwts_files: &[SliceFile],
    aic_files: &[SliceFile],
    config: &StreamConfig,
    observer: &Arc<dyn StreamObserver>,
) -> Result<AlignmentOutcome> {
    if hwts_files.is_empty() || aic_files.is_empty() {
        warn!(
            component = LOG_COMPONENT,
            hwts_files = hwts_files.len(),
            aic_files = aic_files.len(),
            "cannot align tails: a stream is empty"
        );
        return Ok(AlignmentOutcome::Unaligned);
    }

    let Some((anchor, repeats)) = aic_tail_anchor(aic_files, config, observer)? else {
        warn!(
            component = LOG_COMPONENT,
            "cannot align tails: AI-core stream holds no whole record"
        );
        return Ok(AlignmentOutcome::Unaligned);
    };

    let scan = FileReverseCalculator::<TaskRecord>::new(config)
        .with_observer(Arc::clone(observer))
        .find_tail_offset(hwts_files, anchor, repeats)?;
    match scan {
        TailScan::Found { tail_count } => {
            info!(
                component = LOG_COMPONENT,
                anchor = %anchor,
                repeats,
                discard = tail_count,
                "aligned HWTS tail to AI-core tail"
            );
            Ok(AlignmentOutcome::Aligned {
                discard: tail_count,
            })
        }
        TailScan::NotFound { scanned } => {
            warn!(
                component = LOG_COMPONENT,
                anchor = %anchor,
                repeats,
                scanned,
                "AI-core anchor not found in HWTS stream; leaving tails unaligned"
            );
            Ok(AlignmentOutcome::Unaligned)
        }
    }
}
