//! One reconstruction pass over a device's trace directory.

use std::path::Path;
use std::sync::Arc;

use devtrace_error::{Result, TraceError};
use devtrace_stream::{
    OffsetCalculator, SliceFile, StreamConfig, StreamObserver, discover_slices, noop_observer,
    require_slices,
};
use devtrace_types::{IterId, MatchedSpan, StepTraceRecord};
use tracing::info;

use crate::alignment::{AlignmentOutcome, align_tails_observed};
use crate::iteration::{AiCoreTaskTable, IterationIndex};
use crate::reconcile::{IterInfoUpdater, ReconcileReport};
use crate::span_matcher::{MatchSummary, match_iteration_window};

const LOG_COMPONENT: &str = "devtrace.core::pass";
const HWTS_CATEGORY: &str = "hwts";
const AIC_CATEGORY: &str = "aicore";

/// Result of a completed pass. Nothing is handed out before the pass ends.
#[derive(Debug, Clone)]
pub struct PassOutput {
    pub device_id: u32,
    pub index: IterationIndex,
    pub report: ReconcileReport,
    pub alignment: AlignmentOutcome,
    pub hwts_files: Vec<SliceFile>,
    pub aic_files: Vec<SliceFile>,
}

impl PassOutput {
    /// JSON document with the report, the tail alignment and every iteration.
    pub fn to_json(&self) -> Result<String> {
        let document = serde_json::json!({
            "device_id": self.device_id,
            "report": self.report,
            "alignment": self.alignment,
            "iterations": self.index.snapshot(),
        });
        serde_json::to_string_pretty(&document)
            .map_err(|err| TraceError::invalid_state(format!("cannot serialize pass: {err}")))
    }
}

pub struct ReconstructionPass {
    config: StreamConfig,
    observer: Arc<dyn StreamObserver>,
}

impl std::fmt::Debug for ReconstructionPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconstructionPass")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ReconstructionPass {
    pub fn new(config: StreamConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            observer: noop_observer(),
        })
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn StreamObserver>) -> Self {
        self.observer = observer;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Discover, index, reconcile and publish.
    pub fn run(
        &self,
        dir: &Path,
        device_id: u32,
        steps: &[StepTraceRecord],
        tasks: &AiCoreTaskTable,
    ) -> Result<PassOutput> {
        let hwts_files = require_slices(dir, HWTS_CATEGORY, device_id)?;
        let aic_files = if self.config.require_aic {
            require_slices(dir, AIC_CATEGORY, device_id)?
        } else {
            discover_slices(dir, AIC_CATEGORY, device_id)?
        };

        let mut index = IterationIndex::build(steps, tasks);
        let report = {
            let mut calc =
                OffsetCalculator::new(&hwts_files, self.config.hwts_record_size, &self.config)?
                    .with_observer(Arc::clone(&self.observer));
            let mut updater =
                IterInfoUpdater::new(&mut index).with_observer(Arc::clone(&self.observer));
            for file in &hwts_files {
                updater.feed_file(&mut calc, file)?;
            }
            calc.finish();
            updater.finish()
        };

        let alignment =
            align_tails_observed(&hwts_files, &aic_files, &self.config, &self.observer)?;

        info!(
            component = LOG_COMPONENT,
            dir = %dir.display(),
            device_id,
            hwts_files = hwts_files.len(),
            aic_files = aic_files.len(),
            iterations = index.len(),
            records = report.records_observed,
            alignment = ?alignment,
            "reconstruction pass complete"
        );
        Ok(PassOutput {
            device_id,
            index,
            report,
            alignment,
            hwts_files,
            aic_files,
        })
    }

    /// Matched spans of one iteration's exact record window.
    pub fn iteration_spans(
        &self,
        output: &PassOutput,
        iter_id: IterId,
    ) -> Result<(Vec<MatchedSpan>, MatchSummary)> {
        match_iteration_window(
            &output.hwts_files,
            &output.index,
            iter_id,
            &self.config,
            Arc::clone(&self.observer),
        )
    }
}
